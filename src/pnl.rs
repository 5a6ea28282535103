// ===============================
// src/pnl.rs
// ===============================
//
// Rumus P&L murni (tanpa state):
//   unrealized = (last - entry) * sign(side) * qty * dollars_per_point
//   realized   = unrealized(exit) - commissions
//   risk       = |entry - stop| * dollars_per_point * qty
//   R          = amount / risk
//
use crate::domain::Side;

/// Signed move from entry in points, positive when in favour of `side`.
pub fn points(side: Side, entry: f64, price: f64) -> f64 {
    (price - entry) * side.sign()
}

pub fn unrealized_pnl(side: Side, entry: f64, last: f64, qty: f64, dollars_per_point: f64) -> f64 {
    points(side, entry, last) * qty * dollars_per_point
}

pub fn commissions(per_contract: f64, qty: f64) -> f64 {
    per_contract * qty.abs()
}

pub fn realized_pnl(side: Side, entry: f64, exit: f64, qty: f64, dollars_per_point: f64, commissions: f64) -> f64 {
    unrealized_pnl(side, entry, exit, qty, dollars_per_point) - commissions
}

/// `None` when no stop is known or the stop sits on the entry price.
pub fn planned_risk_dollars(entry: f64, stop: Option<f64>, dollars_per_point: f64, qty: f64) -> Option<f64> {
    let risk = (entry - stop?).abs() * dollars_per_point * qty.abs();
    (risk > 0.0 && risk.is_finite()).then_some(risk)
}

pub fn r_multiple(amount: f64, risk: Option<f64>) -> Option<f64> {
    risk.filter(|r| *r > 0.0).map(|r| amount / r)
}

pub fn efficiency(realized: f64, mfe_dollars: f64) -> Option<f64> {
    (mfe_dollars != 0.0).then(|| realized / mfe_dollars)
}

/// Excursion in points. mae <= 0 <= mfe because entry counts as zero excursion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Excursion {
    pub mae_points: f64,
    pub mfe_points: f64,
}

impl Excursion {
    pub fn from_peaks(side: Side, entry: f64, peak_favorable: f64, peak_adverse: f64) -> Self {
        Self {
            mae_points: points(side, entry, peak_adverse).min(0.0),
            mfe_points: points(side, entry, peak_favorable).max(0.0),
        }
    }

    pub fn range_points(&self) -> f64 {
        self.mfe_points - self.mae_points
    }

    pub fn dollars(points: f64, qty: f64, dollars_per_point: f64) -> f64 {
        points * qty.abs() * dollars_per_point
    }
}
