// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quantities below this are treated as flat.
pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode { Sim, Live, Debug }
impl Mode {
    pub fn as_str(&self) -> &'static str { match self { Mode::Sim => "sim", Mode::Live => "live", Mode::Debug => "debug" } }
}
impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Position direction. `Flat` only ever pairs with qty == 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Long, Short, Flat }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Long => 1.0, Side::Short => -1.0, Side::Flat => 0.0 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Long => "long", Side::Short => "short", Side::Flat => "flat" } }
}

/// Order direction as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide { Buy, Sell }
impl OrderSide {
    pub fn sign(&self) -> f64 { match self { OrderSide::Buy => 1.0, OrderSide::Sell => -1.0 } }
    /// Position side a fill on this order side opens from flat.
    pub fn opens(&self) -> Side { match self { OrderSide::Buy => Side::Long, OrderSide::Sell => Side::Short } }
    /// True when a fill on this side reduces a position held on `side`.
    pub fn reduces(&self, side: Side) -> bool {
        matches!((self, side), (OrderSide::Sell, Side::Long) | (OrderSide::Buy, Side::Short))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountScope { pub mode: Mode, pub account: String }

/// Identity of one tracked position: (mode, account, symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey { pub mode: Mode, pub account: String, pub symbol: String }
impl ScopeKey {
    pub fn new(mode: Mode, account: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self { mode, account: account.into(), symbol: symbol.into() }
    }
    pub fn account_scope(&self) -> AccountScope { AccountScope { mode: self.mode, account: self.account.clone() } }
}
impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}/{}", self.mode, self.account, self.symbol) }
}

/// Market context captured at entry (order-flow levels supplied by the chart side).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryContext { pub vwap: Option<f64>, pub poc: Option<f64>, pub delta: Option<f64> }

/// Immutable position snapshot. The engine swaps whole `Arc<PositionState>`s, never mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub mode: Mode,
    pub account: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    /// Brackets came from `set_brackets`; inference must not touch them.
    pub brackets_explicit: bool,
    pub last_price: f64,
    pub peak_favorable_price: f64,
    pub peak_adverse_price: f64,
    pub entry_context: EntryContext,
    /// Largest size held during this round trip.
    pub max_qty: f64,
    /// Contracts already closed by partial reductions.
    pub closed_qty: f64,
    /// Pre-commission dollars realized by partial reductions.
    pub realized_partial: f64,
    /// Commissions charged on partial reductions so far.
    pub commissions: f64,
}

impl PositionState {
    pub fn flat(key: &ScopeKey) -> Self {
        Self {
            symbol: key.symbol.clone(),
            mode: key.mode,
            account: key.account.clone(),
            side: Side::Flat,
            qty: 0.0,
            entry_price: 0.0,
            entry_time: Utc::now(),
            stop_price: None,
            target_price: None,
            brackets_explicit: false,
            last_price: 0.0,
            peak_favorable_price: 0.0,
            peak_adverse_price: 0.0,
            entry_context: EntryContext::default(),
            max_qty: 0.0,
            closed_qty: 0.0,
            realized_partial: 0.0,
            commissions: 0.0,
        }
    }

    /// Fresh position; entry itself counts as zero excursion. A zero qty or flat side yields `flat`.
    pub fn open(key: &ScopeKey, side: Side, qty: f64, price: f64, at: DateTime<Utc>, ctx: EntryContext) -> Self {
        if side == Side::Flat || qty.abs() < QTY_EPSILON {
            return Self::flat(key);
        }
        Self {
            side,
            qty: qty.abs(),
            entry_price: price,
            entry_time: at,
            last_price: price,
            peak_favorable_price: price,
            peak_adverse_price: price,
            entry_context: ctx,
            max_qty: qty.abs(),
            ..Self::flat(key)
        }
    }

    pub fn key(&self) -> ScopeKey { ScopeKey::new(self.mode, self.account.clone(), self.symbol.clone()) }

    pub fn is_open(&self) -> bool { self.side != Side::Flat }

    /// Copy with a new observed price. Extremes only ever move away from entry.
    pub fn with_price(&self, price: f64) -> Self {
        let mut next = self.clone();
        if !self.is_open() || !price.is_finite() || price <= 0.0 {
            return next;
        }
        next.last_price = price;
        let s = self.side.sign();
        if (price - self.peak_favorable_price) * s > 0.0 {
            next.peak_favorable_price = price;
        }
        if (price - self.peak_adverse_price) * s < 0.0 {
            next.peak_adverse_price = price;
        }
        next
    }

    /// Copy with a new size, keeping `qty == 0 <=> Flat`.
    pub fn with_qty(&self, qty: f64) -> Self {
        let mut next = self.clone();
        if qty.abs() < QTY_EPSILON {
            next.qty = 0.0;
            next.side = Side::Flat;
        } else {
            next.qty = qty.abs();
            next.max_qty = next.max_qty.max(next.qty);
        }
        next
    }
}

/// Which link of the exit-price chain produced a record's exit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitPriceSource { LastFill, AverageFill, Quote, Market, Entry }

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(pub String);
impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price_source: ExitPriceSource,
    pub realized_pnl: f64,
    pub commissions: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub planned_risk_dollars: Option<f64>,
    pub r_multiple: Option<f64>,
    pub mae_points: f64,
    pub mae_dollars: f64,
    pub mae_r: Option<f64>,
    pub mfe_points: f64,
    pub mfe_dollars: f64,
    pub mfe_r: Option<f64>,
    pub efficiency: Option<f64>,
    pub range_points: f64,
    pub range_r: Option<f64>,
    pub entry_context: EntryContext,
    pub mode: Mode,
    pub account: String,
}
impl TradeRecord {
    pub fn key(&self) -> ScopeKey { ScopeKey::new(self.mode, self.account.clone(), self.symbol.clone()) }
}

// ---- Normalized wire events ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Unset,
    OrderSent,
    PendingOpen,
    PendingChild,
    Open,
    PendingCancelReplace,
    PendingCancel,
    Filled,
    Canceled,
    Rejected,
    PartiallyFilled,
}
impl OrderStatus {
    pub fn is_fill(&self) -> bool { matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled) }
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            OrderStatus::OrderSent | OrderStatus::PendingOpen | OrderStatus::PendingChild | OrderStatus::Open
                | OrderStatus::PendingCancelReplace
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderUpdateReason {
    Unset,
    OpenOrdersRequestResponse,
    NewOrderAccepted,
    GeneralOrderUpdate,
    OrderFilled,
    OrderFilledPartially,
    OrderCanceled,
    OrderCancelReplaceComplete,
    NewOrderRejected,
    OrderCancelRejected,
    OrderCancelReplaceRejected,
}
impl OrderUpdateReason {
    pub fn is_fill(&self) -> bool { matches!(self, OrderUpdateReason::OrderFilled | OrderUpdateReason::OrderFilledPartially) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceUpdate { pub account: String, pub cash: f64, pub ts: DateTime<Utc> }

/// Signed server-side position: qty < 0 is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate { pub symbol: String, pub qty: f64, pub avg_price: Option<f64>, pub account: String }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: Option<String>,
    pub symbol: String,
    pub account: String,
    pub status: Option<OrderStatus>,
    pub reason: Option<OrderUpdateReason>,
    pub side: Option<OrderSide>,
    pub order_qty: Option<f64>,
    /// Size of this fill (0 when the update is not a fill).
    pub filled_qty: f64,
    /// Cumulative filled size of the order, when the server reports it.
    pub cumulative_qty: Option<f64>,
    pub fill_price: Option<f64>,
    pub avg_fill_price: Option<f64>,
    /// Working price of the order (limit or stop level).
    pub order_price: Option<f64>,
    pub ts: DateTime<Utc>,
}
impl OrderUpdate {
    /// A fill needs size. Status/reason veto it only when present and both say otherwise.
    pub fn is_fill(&self) -> bool {
        if self.filled_qty <= QTY_EPSILON {
            return false;
        }
        match (self.status, self.reason) {
            (None, None) => true,
            (s, r) => s.map(|s| s.is_fill()).unwrap_or(false) || r.map(|r| r.is_fill()).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPrice { pub symbol: String, pub price: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NormalizedEvent {
    Balance(BalanceUpdate),
    Position(PositionUpdate),
    Order(OrderUpdate),
    Market(MarketPrice),
    LogonResponse { success: bool, text: Option<String> },
    Logoff { reason: Option<String> },
    Heartbeat,
}
impl NormalizedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::Balance(_) => "balance",
            NormalizedEvent::Position(_) => "position",
            NormalizedEvent::Order(_) => "order",
            NormalizedEvent::Market(_) => "market",
            NormalizedEvent::LogonResponse { .. } => "logon_response",
            NormalizedEvent::Logoff { .. } => "logoff",
            NormalizedEvent::Heartbeat => "heartbeat",
        }
    }
    /// Events the engine consumes; session-level messages stay in the connection.
    pub fn is_data(&self) -> bool {
        matches!(self, NormalizedEvent::Balance(_) | NormalizedEvent::Position(_) | NormalizedEvent::Order(_) | NormalizedEvent::Market(_))
    }
}
