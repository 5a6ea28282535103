// ===============================
// src/positions.rs (position lifecycle engine)
// ===============================
//
// State machine per scope (mode, account, symbol): FLAT <-> OPEN.
// - Semua mutasi satu scope terjadi di bawah Mutex scope tersebut.
// - PositionState immutable: setiap perubahan = Arc baru (swap), pembaca
//   boleh menyimpan snapshot tanpa lock.
// - Close bersifat single-flight: sinyal close pertama mengubah slot ke FLAT
//   dan mencatat `recent_close` di critical section yang sama; sinyal kedua
//   (fill kembar / PositionUpdate qty 0) menemukan FLAT dan di-suppress.
// - Mode diturunkan dari account tiap event, bukan flag global.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::{
    AccountScope, BalanceUpdate, EntryContext, MarketPrice, NormalizedEvent, OrderSide, OrderUpdate, PositionState,
    PositionUpdate, ScopeKey, Side, TradeRecord, QTY_EPSILON,
};
use crate::listener::EngineListener;
use crate::metrics::{EVENTS_SUPPRESSED, OPEN_POSITIONS, TRADES_CLOSED};
use crate::pnl;
use crate::recorder::{build_record, ExitPrices, PersistJob, RecorderHandle};
use crate::store::TradeStore;
use crate::symbols::SymbolMetadata;

// fills_seen is reset past this many order ids
const MAX_TRACKED_ORDERS: usize = 4096;

/// What one event did to its scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    None,
    Opened,
    Updated,
    Closed(TradeRecord),
    /// Closed and immediately reopened on the other side.
    Reversed(TradeRecord),
    Suppressed(&'static str),
    Ignored(&'static str),
}

/// Position plus its closed trades, read under one lock.
#[derive(Debug, Clone)]
pub struct ScopeView {
    pub position: Arc<PositionState>,
    pub trades: Vec<TradeRecord>,
}

#[derive(Debug, Clone)]
struct RecentClose {
    side: Side,
    qty: f64,
    order_id: Option<String>,
    at: Instant,
}

#[derive(Debug)]
struct ScopeSlot {
    position: Arc<PositionState>,
    /// Fill/quote prices seen since the position opened (market comes from the engine).
    exit_hint: ExitPrices,
    /// order id -> cumulative filled qty already applied
    fills_seen: HashMap<String, f64>,
    recent_close: Option<RecentClose>,
    /// Size a PositionUpdate put on the book before its entry fill arrived.
    unfilled_report: Option<ReportedSize>,
    trades: Vec<TradeRecord>,
}

/// Contracts known only from a position report. The matching entry fill
/// confirms them instead of adding to them.
#[derive(Debug, Clone, Copy)]
struct ReportedSize {
    side: Side,
    qty: f64,
    /// Whole position came from the report: the first fill also sets entry time.
    retime: bool,
}

impl ScopeSlot {
    fn new(key: &ScopeKey) -> Self {
        Self {
            position: Arc::new(PositionState::flat(key)),
            exit_hint: ExitPrices::default(),
            fills_seen: HashMap::new(),
            recent_close: None,
            unfilled_report: None,
            trades: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MarketSnapshot {
    last: Option<f64>,
    context: EntryContext,
}

enum Notice {
    Position(Arc<PositionState>),
    Trade(TradeRecord),
}

pub struct PositionEngine {
    cfg: EngineConfig,
    meta: Arc<dyn SymbolMetadata>,
    listener: Arc<dyn EngineListener>,
    recorder: Option<RecorderHandle>,
    scopes: DashMap<ScopeKey, Arc<Mutex<ScopeSlot>>>,
    balances: DashMap<AccountScope, BalanceUpdate>,
    market: DashMap<String, MarketSnapshot>,
}

impl PositionEngine {
    pub fn new(
        cfg: EngineConfig,
        meta: Arc<dyn SymbolMetadata>,
        listener: Arc<dyn EngineListener>,
        recorder: Option<RecorderHandle>,
    ) -> Self {
        Self {
            cfg,
            meta,
            listener,
            recorder,
            scopes: DashMap::new(),
            balances: DashMap::new(),
            market: DashMap::new(),
        }
    }

    pub fn key_for(&self, account: &str, symbol: &str) -> ScopeKey {
        ScopeKey::new(self.cfg.modes.resolve(account), account, symbol)
    }

    fn slot(&self, key: &ScopeKey) -> Arc<Mutex<ScopeSlot>> {
        if let Some(s) = self.scopes.get(key) {
            return Arc::clone(s.value());
        }
        Arc::clone(self.scopes.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(ScopeSlot::new(key)))).value())
    }

    // ---- reads ----

    /// Current snapshot; FLAT for scopes never seen.
    pub fn snapshot(&self, key: &ScopeKey) -> Arc<PositionState> {
        let slot = self.scopes.get(key).map(|s| Arc::clone(s.value()));
        match slot {
            Some(slot) => Arc::clone(&slot.lock().position),
            None => Arc::new(PositionState::flat(key)),
        }
    }

    pub fn view(&self, key: &ScopeKey) -> ScopeView {
        let slot = self.scopes.get(key).map(|s| Arc::clone(s.value()));
        match slot {
            Some(slot) => {
                let g = slot.lock();
                ScopeView { position: Arc::clone(&g.position), trades: g.trades.clone() }
            }
            None => ScopeView { position: Arc::new(PositionState::flat(key)), trades: Vec::new() },
        }
    }

    pub fn open_positions(&self) -> Vec<Arc<PositionState>> {
        let slots: Vec<_> = self.scopes.iter().map(|e| Arc::clone(e.value())).collect();
        slots.into_iter().map(|s| Arc::clone(&s.lock().position)).filter(|p| p.is_open()).collect()
    }

    /// Closed trades of one (mode, account), every symbol.
    pub fn trades(&self, scope: &AccountScope) -> Vec<TradeRecord> {
        let slots: Vec<_> = self
            .scopes
            .iter()
            .filter(|e| e.key().mode == scope.mode && e.key().account == scope.account)
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut out: Vec<TradeRecord> = slots.into_iter().flat_map(|s| s.lock().trades.clone()).collect();
        out.sort_by_key(|t| t.exit_time);
        out
    }

    pub fn balance(&self, scope: &AccountScope) -> Option<BalanceUpdate> {
        self.balances.get(scope).map(|b| b.value().clone())
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.market.get(symbol).and_then(|m| m.last)
    }

    pub fn unrealized_pnl(&self, key: &ScopeKey) -> f64 {
        let p = self.snapshot(key);
        if !p.is_open() {
            return 0.0;
        }
        pnl::unrealized_pnl(p.side, p.entry_price, p.last_price, p.qty, self.meta.dollars_per_point(&p.symbol))
    }

    // ---- external inputs ----

    /// Order-flow levels used as entry context for positions opened afterwards.
    pub fn update_market_context(&self, symbol: &str, context: EntryContext) {
        self.market.entry(symbol.to_string()).or_default().context = context;
    }

    /// Price from an outside feed; same as a market trade event.
    pub fn on_price(&self, symbol: &str, price: f64) -> usize {
        self.on_market(&MarketPrice { symbol: symbol.to_string(), price })
    }

    /// Explicit stop/target. These win over anything inferred from working orders.
    pub fn set_brackets(&self, key: &ScopeKey, stop: Option<f64>, target: Option<f64>) -> bool {
        let slot = self.slot(key);
        let updated = {
            let mut g = slot.lock();
            if !g.position.is_open() {
                return false;
            }
            let mut next = (*g.position).clone();
            next.stop_price = stop.or(next.stop_price);
            next.target_price = target.or(next.target_price);
            next.brackets_explicit = true;
            let next = Arc::new(next);
            g.position = Arc::clone(&next);
            next
        };
        self.persist(PersistJob::Open((*updated).clone()));
        self.listener.position_changed(key, &updated);
        true
    }

    pub fn apply(&self, ev: &NormalizedEvent) -> Transition {
        match ev {
            NormalizedEvent::Order(o) => self.on_order(o),
            NormalizedEvent::Position(p) => self.on_position(p),
            NormalizedEvent::Balance(b) => {
                let scope = AccountScope { mode: self.cfg.modes.resolve(&b.account), account: b.account.clone() };
                self.balances.insert(scope.clone(), b.clone());
                self.listener.balance_changed(&scope, b);
                Transition::Updated
            }
            NormalizedEvent::Market(m) => {
                if self.on_market(m) > 0 { Transition::Updated } else { Transition::None }
            }
            NormalizedEvent::LogonResponse { .. } | NormalizedEvent::Logoff { .. } | NormalizedEvent::Heartbeat => {
                Transition::Ignored("session message")
            }
        }
    }

    fn on_market(&self, m: &MarketPrice) -> usize {
        if !(m.price.is_finite() && m.price > 0.0) {
            return 0;
        }
        self.market.entry(m.symbol.clone()).or_default().last = Some(m.price);

        let slots: Vec<_> = self
            .scopes
            .iter()
            .filter(|e| e.key().symbol == m.symbol)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut touched = 0;
        for (key, slot) in slots {
            let next = {
                let mut g = slot.lock();
                if !g.position.is_open() {
                    continue;
                }
                let next = Arc::new(g.position.with_price(m.price));
                g.position = Arc::clone(&next);
                next
            };
            touched += 1;
            self.listener.position_changed(&key, &next);
        }
        touched
    }

    fn on_order(&self, o: &OrderUpdate) -> Transition {
        let key = self.key_for(&o.account, &o.symbol);
        let slot = self.slot(&key);
        let mut notices = Vec::new();
        let t = {
            let mut g = slot.lock();
            self.order_locked(&key, &mut g, o, &mut notices)
        };
        self.finish(&key, &t, notices);
        t
    }

    fn order_locked(&self, key: &ScopeKey, g: &mut ScopeSlot, o: &OrderUpdate, out: &mut Vec<Notice>) -> Transition {
        if let Some(p) = o.order_price {
            g.exit_hint.quote = Some(p);
        }

        if !o.is_fill() {
            let working = o.status.map(|s| s.is_working()).unwrap_or(true);
            return match (o.side, o.order_price) {
                (Some(side), Some(price)) if working => match infer_brackets(&g.position, side, price) {
                    Some(next) => {
                        debug!(scope = %key, stop = ?next.stop_price, target = ?next.target_price, "brackets inferred");
                        self.install(g, next, true, out);
                        Transition::Updated
                    }
                    None => Transition::None,
                },
                _ => Transition::None,
            };
        }

        let Some(side) = o.side else { return Transition::Ignored("fill without side") };
        let Some(price) = o.fill_price.or(o.avg_fill_price).or(o.order_price) else {
            return Transition::Ignored("fill without price");
        };

        // duplicate reports of the same fill carry the same cumulative qty
        let qty = match (&o.order_id, o.cumulative_qty) {
            (Some(id), Some(cum)) => {
                let seen = g.fills_seen.get(id).copied().unwrap_or(0.0);
                let delta = cum - seen;
                if delta <= QTY_EPSILON {
                    return Transition::Suppressed("duplicate fill");
                }
                if g.fills_seen.len() >= MAX_TRACKED_ORDERS {
                    g.fills_seen.clear();
                }
                g.fills_seen.insert(id.clone(), cum);
                delta
            }
            _ => o.filled_qty,
        };

        self.market.entry(key.symbol.clone()).or_default().last = Some(price);

        let pos = Arc::clone(&g.position);
        if !pos.is_open() {
            if self.is_close_twin(g, side, qty, o.order_id.as_deref()) {
                return Transition::Suppressed("late fill of closed trade");
            }
            self.open(key, g, side.opens(), qty, price, out);
            return Transition::Opened;
        }

        if !side.reduces(pos.side) {
            let next = self.confirm_or_add(g, &pos, qty, price, o.ts);
            self.install(g, next, true, out);
            return Transition::Updated;
        }

        // only reducing fills are exit candidates
        g.exit_hint.last_fill = Some(price);
        if o.avg_fill_price.is_some() {
            g.exit_hint.avg_fill = o.avg_fill_price;
        }

        let remaining = pos.qty - qty;
        if remaining > QTY_EPSILON {
            let next = self.reduce(&pos, qty, price);
            if let Some(r) = g.unfilled_report.as_mut() {
                r.qty = r.qty.min(remaining);
            }
            self.install(g, next, true, out);
            return Transition::Updated;
        }

        let exit = ExitPrices { last_fill: Some(price), avg_fill: o.avg_fill_price, quote: g.exit_hint.quote, market: self.last_price(&key.symbol) };
        let record = self.close(key, g, exit, o.order_id.clone(), out);
        if remaining < -QTY_EPSILON {
            self.open(key, g, side.opens(), -remaining, price, out);
            return Transition::Reversed(record);
        }
        Transition::Closed(record)
    }

    fn on_position(&self, u: &PositionUpdate) -> Transition {
        let key = self.key_for(&u.account, &u.symbol);
        let slot = self.slot(&key);
        let mut notices = Vec::new();
        let t = {
            let mut g = slot.lock();
            self.position_locked(&key, &mut g, u, &mut notices)
        };
        self.finish(&key, &t, notices);
        t
    }

    fn position_locked(&self, key: &ScopeKey, g: &mut ScopeSlot, u: &PositionUpdate, out: &mut Vec<Notice>) -> Transition {
        let pos = Arc::clone(&g.position);
        let flat_report = u.qty.abs() <= QTY_EPSILON;
        let reported_side = if flat_report { Side::Flat } else if u.qty > 0.0 { Side::Long } else { Side::Short };

        if !pos.is_open() {
            if flat_report {
                return if g.recent_close.is_some() { Transition::Suppressed("already closed") } else { Transition::None };
            }
            // stale snapshot of what was just closed
            let as_order = if reported_side == Side::Long { OrderSide::Sell } else { OrderSide::Buy };
            if self.is_close_twin(g, as_order, u.qty.abs(), None) {
                return Transition::Suppressed("stale position after close");
            }
            let Some(price) = u.avg_price.or_else(|| self.last_price(&key.symbol)) else {
                return Transition::Ignored("position without price");
            };
            self.open(key, g, reported_side, u.qty.abs(), price, out);
            g.unfilled_report = Some(ReportedSize { side: reported_side, qty: u.qty.abs(), retime: true });
            return Transition::Opened;
        }

        let exit = self.exit_prices(g, &key.symbol);
        if flat_report {
            let record = self.close(key, g, exit, None, out);
            return Transition::Closed(record);
        }
        if reported_side != pos.side {
            let record = self.close(key, g, exit, None, out);
            let Some(price) = u.avg_price.or_else(|| self.last_price(&key.symbol)) else {
                warn!(scope = %key, qty = u.qty, "reversal reopen ignored: no price");
                return Transition::Closed(record);
            };
            self.open(key, g, reported_side, u.qty.abs(), price, out);
            g.unfilled_report = Some(ReportedSize { side: reported_side, qty: u.qty.abs(), retime: true });
            return Transition::Reversed(record);
        }

        let qty = u.qty.abs();
        if (qty - pos.qty).abs() <= QTY_EPSILON {
            return Transition::None;
        }
        let next = if qty > pos.qty {
            // server-side add we have no fill for; its average price is authoritative
            let mut next = pos.with_qty(qty);
            if let Some(avg) = u.avg_price {
                next.entry_price = avg;
            }
            let added = qty - pos.qty;
            let r = g.unfilled_report.get_or_insert(ReportedSize { side: pos.side, qty: 0.0, retime: false });
            r.qty += added;
            next
        } else {
            let (price, _) = exit.resolve(pos.entry_price);
            if let Some(r) = g.unfilled_report.as_mut() {
                r.qty = r.qty.min(qty);
            }
            self.reduce(&pos, pos.qty - qty, price)
        };
        self.install(g, next, true, out);
        Transition::Updated
    }

    // ---- transitions (scope lock held) ----

    fn exit_prices(&self, g: &ScopeSlot, symbol: &str) -> ExitPrices {
        ExitPrices { market: self.last_price(symbol), ..g.exit_hint }
    }

    fn context(&self, symbol: &str) -> EntryContext {
        self.market.get(symbol).map(|m| m.context).unwrap_or_default()
    }

    fn open(&self, key: &ScopeKey, g: &mut ScopeSlot, side: Side, qty: f64, price: f64, out: &mut Vec<Notice>) {
        let p = PositionState::open(key, side, qty, price, Utc::now(), self.context(&key.symbol));
        g.exit_hint = ExitPrices::default();
        g.recent_close = None;
        g.unfilled_report = None;
        OPEN_POSITIONS.inc();
        info!(scope = %key, side = side.as_str(), qty, price, "position opened");
        self.install(g, p, true, out);
    }

    /// Same-side fill. Contracts a position report already booked are confirmed
    /// at the fill price; anything beyond them scales in with a size-weighted entry.
    fn confirm_or_add(&self, g: &mut ScopeSlot, pos: &PositionState, qty: f64, price: f64, at: DateTime<Utc>) -> PositionState {
        let mut next = pos.clone();
        let mut rest = qty;
        if let Some(r) = g.unfilled_report.take().filter(|r| r.side == pos.side) {
            let confirmed = r.qty.min(qty);
            // confirmed contracts move from the reported price to the fill price
            next.entry_price += (price - pos.entry_price) * confirmed / pos.qty;
            if r.retime && r.qty - confirmed <= QTY_EPSILON {
                next.entry_time = at;
                next.last_price = price;
                next.peak_favorable_price = price;
                next.peak_adverse_price = price;
            }
            rest -= confirmed;
            if r.qty - confirmed > QTY_EPSILON {
                g.unfilled_report = Some(ReportedSize { qty: r.qty - confirmed, ..r });
            }
        }
        if rest > QTY_EPSILON {
            let total = next.qty + rest;
            let entry = (next.entry_price * next.qty + price * rest) / total;
            next = next.with_qty(total);
            next.entry_price = entry;
        }
        next.with_price(price)
    }

    /// Partial close of `qty` at `price`; P&L and commission accrue on the snapshot.
    fn reduce(&self, pos: &PositionState, qty: f64, price: f64) -> PositionState {
        let dpp = self.meta.dollars_per_point(&pos.symbol);
        let mut next = pos.with_price(price).with_qty(pos.qty - qty);
        next.realized_partial += pnl::unrealized_pnl(pos.side, pos.entry_price, price, qty, dpp);
        next.commissions += pnl::commissions(self.meta.commission_per_contract(&pos.symbol), qty);
        next.closed_qty += qty;
        next
    }

    fn close(&self, key: &ScopeKey, g: &mut ScopeSlot, exit: ExitPrices, order_id: Option<String>, out: &mut Vec<Notice>) -> TradeRecord {
        let record = build_record(&g.position, &exit, Utc::now(), self.meta.as_ref());
        g.recent_close = Some(RecentClose { side: g.position.side, qty: g.position.qty, order_id, at: Instant::now() });
        g.trades.push(record.clone());
        g.exit_hint = ExitPrices::default();
        g.unfilled_report = None;
        OPEN_POSITIONS.dec();
        TRADES_CLOSED.with_label_values(&[key.mode.as_str()]).inc();
        self.install(g, PositionState::flat(key), false, out);
        self.persist(PersistJob::Close(record.clone()));
        out.push(Notice::Trade(record.clone()));
        record
    }

    fn install(&self, g: &mut ScopeSlot, next: PositionState, persist: bool, out: &mut Vec<Notice>) {
        let next = Arc::new(next);
        g.position = Arc::clone(&next);
        if persist && next.is_open() {
            self.persist(PersistJob::Open((*next).clone()));
        }
        out.push(Notice::Position(next));
    }

    /// A fill (or stale position) on a FLAT scope that just mirrors the close that flattened it.
    /// Distinct order ids are never twins. Without ids, side and size decide inside `close_grace`.
    fn is_close_twin(&self, g: &ScopeSlot, side: OrderSide, qty: f64, order_id: Option<&str>) -> bool {
        let Some(rc) = &g.recent_close else { return false };
        // the closing order id is remembered until the next open
        if let (Some(a), Some(b)) = (order_id, rc.order_id.as_deref()) {
            return a == b;
        }
        if rc.at.elapsed() > self.cfg.close_grace {
            return false;
        }
        side.reduces(rc.side) && qty <= rc.qty + QTY_EPSILON
    }

    fn persist(&self, job: PersistJob) {
        if let Some(r) = &self.recorder {
            r.submit(job);
        }
    }

    // listener calls happen with no scope lock held
    fn finish(&self, key: &ScopeKey, t: &Transition, notices: Vec<Notice>) {
        if let Transition::Suppressed(reason) = *t {
            EVENTS_SUPPRESSED.with_label_values(&[reason]).inc();
            warn!(scope = %key, reason, "event suppressed");
        }
        for n in notices {
            match n {
                Notice::Position(p) => self.listener.position_changed(key, &p),
                Notice::Trade(r) => self.listener.trade_closed(&r),
            }
        }
    }

    // ---- background restore ----

    /// Load persisted open positions (optionally one account scope) and closed trades off the
    /// caller's task, then install them through the scope locks. Live state always wins:
    /// a slot that is already open is left alone.
    pub fn spawn_restore(self: &Arc<Self>, store: Arc<dyn TradeStore>, only: Option<AccountScope>) -> JoinHandle<usize> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let filter = only;
            let loaded = tokio::task::spawn_blocking(move || {
                let positions = store.open_positions()?;
                let positions: Vec<PositionState> = positions
                    .into_iter()
                    .filter(|p| filter.as_ref().map_or(true, |s| s.mode == p.mode && s.account == p.account))
                    .collect();
                let mut scopes: Vec<AccountScope> = positions.iter().map(|p| p.key().account_scope()).collect();
                if let Some(s) = &filter {
                    scopes.push(s.clone());
                }
                scopes.sort_by(|a, b| (a.mode.as_str(), &a.account).cmp(&(b.mode.as_str(), &b.account)));
                scopes.dedup();
                let mut trades = Vec::new();
                for s in &scopes {
                    trades.extend(store.load_trades(s)?);
                }
                Ok::<_, crate::store::StoreError>((positions, trades))
            })
            .await;

            let (positions, trades) = match loaded {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    warn!(?e, "restore: store read failed");
                    return 0;
                }
                Err(e) => {
                    warn!(?e, "restore: task failed");
                    return 0;
                }
            };
            engine.install_restored(positions, trades)
        })
    }

    fn install_restored(&self, positions: Vec<PositionState>, trades: Vec<TradeRecord>) -> usize {
        for t in trades {
            let key = t.key();
            let slot = self.slot(&key);
            let mut g = slot.lock();
            if !g.trades.iter().any(|x| x.id == t.id) {
                g.trades.push(t);
                g.trades.sort_by_key(|x| x.exit_time);
            }
        }

        let mut restored = 0;
        for p in positions {
            let key = p.key();
            if !p.is_open() || p.qty <= QTY_EPSILON {
                self.persist(PersistJob::Clear(key));
                continue;
            }
            let slot = self.slot(&key);
            let installed = {
                let mut g = slot.lock();
                if g.position.is_open() {
                    None
                } else {
                    let next = Arc::new(p);
                    g.position = Arc::clone(&next);
                    OPEN_POSITIONS.inc();
                    Some(next)
                }
            };
            if let Some(next) = installed {
                restored += 1;
                info!(scope = %key, side = next.side.as_str(), qty = next.qty, "restored open position");
                self.listener.position_changed(&key, &next);
            }
        }
        restored
    }
}

/// Opposite-side working order price relative to entry: adverse side is a stop, favourable a target.
/// Only fills gaps; never moves a known level.
fn infer_brackets(pos: &PositionState, order_side: OrderSide, price: f64) -> Option<PositionState> {
    if !pos.is_open() || pos.brackets_explicit || !order_side.reduces(pos.side) {
        return None;
    }
    let favourable = (price - pos.entry_price) * pos.side.sign();
    let mut next = pos.clone();
    if favourable < 0.0 && pos.stop_price.is_none() {
        next.stop_price = Some(price);
    } else if favourable > 0.0 && pos.target_price.is_none() {
        next.target_price = Some(price);
    } else {
        return None;
    }
    Some(next)
}

/// Consumer side of the network -> engine hand-off.
pub async fn run(engine: Arc<PositionEngine>, mut rx: mpsc::Receiver<NormalizedEvent>) {
    while let Some(ev) = rx.recv().await {
        let t = engine.apply(&ev);
        if let Transition::Ignored(why) = t {
            debug!(kind = ev.kind(), why, "event ignored");
        }
    }
    info!("engine: event channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeResolver;
    use crate::domain::{ExitPriceSource, Mode, OrderStatus, OrderUpdateReason};
    use crate::listener::{ChannelListener, EngineNotice, NoopListener};
    use crate::store::MemoryStore;
    use crate::symbols::SymbolTable;
    use std::time::Duration;

    fn engine() -> PositionEngine {
        engine_with(Arc::new(NoopListener))
    }

    fn engine_with(listener: Arc<dyn EngineListener>) -> PositionEngine {
        let cfg = EngineConfig { modes: ModeResolver::default(), close_grace: Duration::from_secs(3) };
        PositionEngine::new(cfg, Arc::new(SymbolTable::default()), listener, None)
    }

    fn fill(id: &str, account: &str, side: OrderSide, qty: f64, cum: f64, price: f64) -> NormalizedEvent {
        NormalizedEvent::Order(OrderUpdate {
            order_id: Some(id.to_string()),
            symbol: "ESZ5".into(),
            account: account.into(),
            status: Some(OrderStatus::Filled),
            reason: Some(OrderUpdateReason::OrderFilled),
            side: Some(side),
            order_qty: Some(cum),
            filled_qty: qty,
            cumulative_qty: Some(cum),
            fill_price: Some(price),
            avg_fill_price: Some(price),
            order_price: None,
            ts: Utc::now(),
        })
    }

    // fill report without cumulative size
    fn bare_fill(id: Option<&str>, side: OrderSide, qty: f64, price: f64) -> NormalizedEvent {
        NormalizedEvent::Order(OrderUpdate {
            order_id: id.map(str::to_string),
            symbol: "ESZ5".into(),
            account: "Sim1".into(),
            status: Some(OrderStatus::Filled),
            reason: Some(OrderUpdateReason::OrderFilled),
            side: Some(side),
            order_qty: Some(qty),
            filled_qty: qty,
            cumulative_qty: None,
            fill_price: Some(price),
            avg_fill_price: None,
            order_price: None,
            ts: Utc::now(),
        })
    }

    fn working(id: &str, side: OrderSide, price: f64) -> NormalizedEvent {
        NormalizedEvent::Order(OrderUpdate {
            order_id: Some(id.to_string()),
            symbol: "ESZ5".into(),
            account: "Sim1".into(),
            status: Some(OrderStatus::Open),
            reason: Some(OrderUpdateReason::NewOrderAccepted),
            side: Some(side),
            order_qty: Some(1.0),
            filled_qty: 0.0,
            cumulative_qty: None,
            fill_price: None,
            avg_fill_price: None,
            order_price: Some(price),
            ts: Utc::now(),
        })
    }

    fn position(account: &str, qty: f64, avg: Option<f64>) -> NormalizedEvent {
        NormalizedEvent::Position(PositionUpdate { symbol: "ESZ5".into(), qty, avg_price: avg, account: account.into() })
    }

    fn price(p: f64) -> NormalizedEvent {
        NormalizedEvent::Market(MarketPrice { symbol: "ESZ5".into(), price: p })
    }

    fn sim() -> ScopeKey { ScopeKey::new(Mode::Sim, "Sim1", "ESZ5") }

    fn assert_invariant(p: &PositionState) {
        assert_eq!(p.qty.abs() <= QTY_EPSILON, p.side == Side::Flat, "{p:?}");
    }

    #[test]
    fn fill_opens_and_fill_closes() {
        let e = engine();
        assert_eq!(e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0)), Transition::Opened);
        let p = e.snapshot(&sim());
        assert_eq!((p.side, p.qty, p.entry_price), (Side::Long, 1.0, 6750.0));

        let t = e.apply(&fill("2", "Sim1", OrderSide::Sell, 1.0, 1.0, 6760.0));
        let Transition::Closed(r) = t else { panic!("expected close, got {t:?}") };
        assert_eq!(r.exit_price, 6760.0);
        assert!((r.realized_pnl - (500.0 - 2.25)).abs() < 1e-9);
        assert_eq!(e.snapshot(&sim()).side, Side::Flat);
    }

    #[test]
    fn duplicate_close_produces_one_record() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 2.0, 2.0, 6750.0));
        assert!(matches!(e.apply(&fill("2", "Sim1", OrderSide::Sell, 2.0, 2.0, 6755.0)), Transition::Closed(_)));
        // same report delivered twice
        assert_eq!(e.apply(&fill("2", "Sim1", OrderSide::Sell, 2.0, 2.0, 6755.0)), Transition::Suppressed("duplicate fill"));
        // server confirms flat afterwards
        assert_eq!(e.apply(&position("Sim1", 0.0, None)), Transition::Suppressed("already closed"));
        assert_eq!(e.view(&sim()).trades.len(), 1);
    }

    #[test]
    fn position_close_then_late_fill_is_one_trade() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&price(6758.0));
        let t = e.apply(&position("Sim1", 0.0, None));
        let Transition::Closed(r) = t else { panic!("expected close, got {t:?}") };
        // no fill since entry; last market price is the best available
        assert_eq!(r.exit_price, 6758.0);

        // the exit fill shows up after the position report
        let late = e.apply(&fill("2", "Sim1", OrderSide::Sell, 1.0, 1.0, 6757.0));
        assert_eq!(late, Transition::Suppressed("late fill of closed trade"));
        assert_eq!(e.view(&sim()).trades.len(), 1);
        assert_eq!(e.snapshot(&sim()).side, Side::Flat);
    }

    #[test]
    fn distinct_order_after_close_opens_new_position() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&fill("2", "Sim1", OrderSide::Sell, 1.0, 1.0, 6752.0));
        // a fresh sell order is a new short, not a twin of order 2
        assert_eq!(e.apply(&fill("3", "Sim1", OrderSide::Sell, 1.0, 1.0, 6751.0)), Transition::Opened);
        assert_eq!(e.snapshot(&sim()).side, Side::Short);
    }

    #[test]
    fn concurrent_close_signals_record_once() {
        let e = Arc::new(engine());
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        let a = {
            let e = Arc::clone(&e);
            std::thread::spawn(move || e.apply(&fill("2", "Sim1", OrderSide::Sell, 1.0, 1.0, 6753.0)))
        };
        let b = {
            let e = Arc::clone(&e);
            std::thread::spawn(move || e.apply(&position("Sim1", 0.0, None)))
        };
        let (ta, tb) = (a.join().unwrap(), b.join().unwrap());
        let closes = [&ta, &tb].iter().filter(|t| matches!(t, Transition::Closed(_))).count();
        assert_eq!(closes, 1, "{ta:?} / {tb:?}");
        assert_eq!(e.view(&sim()).trades.len(), 1);
        assert_invariant(&e.snapshot(&sim()));
    }

    #[test]
    fn scopes_do_not_leak() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&fill("9", "120005", OrderSide::Sell, 3.0, 3.0, 6749.0));

        let live = ScopeKey::new(Mode::Live, "120005", "ESZ5");
        assert_eq!(e.snapshot(&sim()).side, Side::Long);
        assert_eq!(e.snapshot(&live).side, Side::Short);
        assert_eq!(e.snapshot(&live).qty, 3.0);

        e.apply(&position("120005", 0.0, None));
        assert_eq!(e.snapshot(&sim()).qty, 1.0);
        assert!(e.trades(&sim().account_scope()).is_empty());
        assert_eq!(e.trades(&live.account_scope()).len(), 1);
        assert_eq!(e.trades(&live.account_scope())[0].mode, Mode::Live);
    }

    #[test]
    fn excursions_only_widen() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        for p in [6748.0, 6760.0, 6755.0, 6749.0, 6740.0, 6745.0] {
            e.apply(&price(p));
            let s = e.snapshot(&sim());
            assert!(s.peak_favorable_price >= s.entry_price);
            assert!(s.peak_adverse_price <= s.entry_price);
        }
        let s = e.snapshot(&sim());
        assert_eq!((s.peak_favorable_price, s.peak_adverse_price, s.last_price), (6760.0, 6740.0, 6745.0));
    }

    #[test]
    fn scale_in_weights_entry_and_partial_exit_accrues() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&fill("2", "Sim1", OrderSide::Buy, 1.0, 1.0, 6760.0));
        let s = e.snapshot(&sim());
        assert_eq!((s.qty, s.entry_price), (2.0, 6755.0));

        assert_eq!(e.apply(&fill("3", "Sim1", OrderSide::Sell, 1.0, 1.0, 6765.0)), Transition::Updated);
        let s = e.snapshot(&sim());
        assert_eq!((s.side, s.qty, s.closed_qty), (Side::Long, 1.0, 1.0));
        assert!((s.realized_partial - 500.0).abs() < 1e-9);

        let Transition::Closed(r) = e.apply(&fill("4", "Sim1", OrderSide::Sell, 1.0, 1.0, 6755.0)) else { panic!() };
        assert_eq!(r.qty, 2.0);
        assert!((r.realized_pnl - (500.0 - 2.0 * 2.25)).abs() < 1e-9);
    }

    #[test]
    fn cumulative_qty_drives_partial_fills() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 2.0, 6750.0));
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 2.0, 6750.0));
        assert_eq!(e.snapshot(&sim()).qty, 2.0);
    }

    #[test]
    fn overshoot_reverses() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        let t = e.apply(&fill("2", "Sim1", OrderSide::Sell, 3.0, 3.0, 6745.0));
        let Transition::Reversed(r) = t else { panic!("expected reversal, got {t:?}") };
        assert_eq!((r.side, r.qty), (Side::Long, 1.0));
        let s = e.snapshot(&sim());
        assert_eq!((s.side, s.qty, s.entry_price), (Side::Short, 2.0, 6745.0));
    }

    #[test]
    fn position_sign_flip_reverses() {
        let e = engine();
        e.apply(&position("Sim1", 2.0, Some(6750.0)));
        assert_eq!(e.snapshot(&sim()).side, Side::Long);
        assert!(matches!(e.apply(&position("Sim1", -1.0, Some(6740.0))), Transition::Reversed(_)));
        let s = e.snapshot(&sim());
        assert_eq!((s.side, s.qty, s.entry_price), (Side::Short, 1.0, 6740.0));
        assert_invariant(&s);
    }

    #[test]
    fn sign_flip_without_price_only_closes() {
        let e = engine();
        e.apply(&position("Sim1", 2.0, Some(6750.0)));
        let t = e.apply(&position("Sim1", -1.0, None));
        assert!(matches!(t, Transition::Closed(_)), "{t:?}");
        let s = e.snapshot(&sim());
        assert_eq!(s.side, Side::Flat);
        assert_invariant(&s);
        assert_eq!(e.view(&sim()).trades.len(), 1);
    }

    #[test]
    fn report_before_entry_fill_is_one_lot() {
        let e = engine();
        assert_eq!(e.apply(&position("Sim1", 1.0, Some(6750.0))), Transition::Opened);
        assert_eq!(e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0)), Transition::Updated);
        let s = e.snapshot(&sim());
        assert_eq!((s.side, s.qty, s.max_qty, s.entry_price), (Side::Long, 1.0, 1.0, 6750.0));

        // the server keeps reporting one lot
        assert_eq!(e.apply(&position("Sim1", 1.0, Some(6750.0))), Transition::None);

        let t = e.apply(&fill("2", "Sim1", OrderSide::Sell, 1.0, 1.0, 6760.0));
        let Transition::Closed(r) = t else { panic!("expected close, got {t:?}") };
        assert_eq!(r.qty, 1.0);
        assert!((r.realized_pnl - 497.75).abs() < 1e-9);
        assert!((r.commissions - 2.25).abs() < 1e-9);

        assert_eq!(e.apply(&position("Sim1", 0.0, None)), Transition::Suppressed("already closed"));
        assert_eq!(e.view(&sim()).trades.len(), 1);
    }

    #[test]
    fn entry_fill_reprices_report_opened_position() {
        let e = engine();
        e.apply(&position("Sim1", 1.0, Some(6749.0)));
        let entry = fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.5);
        let NormalizedEvent::Order(o) = &entry else { unreachable!() };
        e.apply(&entry);
        let s = e.snapshot(&sim());
        assert_eq!((s.qty, s.entry_price, s.entry_time), (1.0, 6750.5, o.ts));
        assert_eq!((s.peak_favorable_price, s.peak_adverse_price), (6750.5, 6750.5));

        // beyond the reported size a fill is a real add
        e.apply(&fill("2", "Sim1", OrderSide::Buy, 1.0, 1.0, 6760.0));
        let s = e.snapshot(&sim());
        assert_eq!((s.qty, s.entry_price), (2.0, 6755.25));
    }

    #[test]
    fn scale_in_price_is_not_an_exit_price() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&fill("2", "Sim1", OrderSide::Buy, 1.0, 1.0, 6752.0));
        e.apply(&price(6740.0));
        let t = e.apply(&position("Sim1", 0.0, None));
        let Transition::Closed(r) = t else { panic!("expected close, got {t:?}") };
        assert_eq!((r.exit_price, r.exit_price_source), (6740.0, ExitPriceSource::Market));
    }

    #[test]
    fn closing_order_redelivered_after_grace_is_suppressed() {
        let cfg = EngineConfig { modes: ModeResolver::default(), close_grace: Duration::from_millis(10) };
        let e = PositionEngine::new(cfg, Arc::new(SymbolTable::default()), Arc::new(NoopListener), None);
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        assert!(matches!(e.apply(&bare_fill(Some("X1"), OrderSide::Sell, 1.0, 6760.0)), Transition::Closed(_)));

        std::thread::sleep(Duration::from_millis(30));
        let t = e.apply(&bare_fill(Some("X1"), OrderSide::Sell, 1.0, 6760.0));
        assert_eq!(t, Transition::Suppressed("late fill of closed trade"));
        assert_eq!(e.snapshot(&sim()).side, Side::Flat);
        assert_eq!(e.view(&sim()).trades.len(), 1);

        // without an id, size and side only count inside the grace window
        assert_eq!(e.apply(&bare_fill(None, OrderSide::Sell, 1.0, 6761.0)), Transition::Opened);
        assert_eq!(e.snapshot(&sim()).side, Side::Short);
    }

    #[test]
    fn position_without_any_price_is_ignored() {
        let e = engine();
        assert_eq!(e.apply(&position("Sim1", 1.0, None)), Transition::Ignored("position without price"));
        assert_invariant(&e.snapshot(&sim()));
    }

    #[test]
    fn working_orders_infer_missing_brackets() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&working("s", OrderSide::Sell, 6740.0));
        e.apply(&working("t", OrderSide::Sell, 6770.0));
        // same-side order is not a bracket
        e.apply(&working("b", OrderSide::Buy, 6730.0));
        let s = e.snapshot(&sim());
        assert_eq!((s.stop_price, s.target_price), (Some(6740.0), Some(6770.0)));

        // a moved stop does not rewrite the planned level
        e.apply(&working("s2", OrderSide::Sell, 6745.0));
        assert_eq!(e.snapshot(&sim()).stop_price, Some(6740.0));

        let Transition::Closed(r) = e.apply(&fill("t", "Sim1", OrderSide::Sell, 1.0, 1.0, 6770.0)) else { panic!() };
        assert_eq!(r.planned_risk_dollars, Some(500.0));
        assert!((r.r_multiple.unwrap_or_default() - (1000.0 - 2.25) / 500.0).abs() < 1e-9);
    }

    #[test]
    fn explicit_brackets_win() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        assert!(e.set_brackets(&sim(), Some(6746.0), None));
        e.apply(&working("s", OrderSide::Sell, 6740.0));
        e.apply(&working("t", OrderSide::Sell, 6770.0));
        let s = e.snapshot(&sim());
        assert_eq!((s.stop_price, s.target_price), (Some(6746.0), None));
        assert!(!e.set_brackets(&ScopeKey::new(Mode::Sim, "Sim1", "NQZ5"), Some(1.0), None));
    }

    #[test]
    fn balances_are_scoped() {
        let e = engine();
        e.apply(&NormalizedEvent::Balance(BalanceUpdate { account: "Sim1".into(), cash: 50_000.0, ts: Utc::now() }));
        e.apply(&NormalizedEvent::Balance(BalanceUpdate { account: "120005".into(), cash: 7_500.0, ts: Utc::now() }));
        let sim = AccountScope { mode: Mode::Sim, account: "Sim1".into() };
        let live = AccountScope { mode: Mode::Live, account: "120005".into() };
        assert_eq!(e.balance(&sim).map(|b| b.cash), Some(50_000.0));
        assert_eq!(e.balance(&live).map(|b| b.cash), Some(7_500.0));
    }

    #[test]
    fn entry_context_is_captured_at_open() {
        let e = engine();
        let ctx = EntryContext { vwap: Some(6748.5), poc: Some(6747.0), delta: Some(-120.0) };
        e.update_market_context("ESZ5", ctx);
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.update_market_context("ESZ5", EntryContext::default());
        assert_eq!(e.snapshot(&sim()).entry_context, ctx);
    }

    #[test]
    fn unrealized_follows_price() {
        let e = engine();
        e.apply(&fill("1", "Sim1", OrderSide::Sell, 2.0, 2.0, 6750.0));
        assert_eq!(e.on_price("ESZ5", 6745.0), 1);
        assert!((e.unrealized_pnl(&sim()) - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn listener_sees_close_after_flat_snapshot() {
        let (listener, mut rx) = ChannelListener::new(16);
        let e = engine_with(Arc::new(listener));
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&fill("2", "Sim1", OrderSide::Sell, 1.0, 1.0, 6751.0));

        let mut seen = Vec::new();
        while let Ok(n) = rx.try_recv() {
            seen.push(n);
        }
        assert!(matches!(seen.last(), Some(EngineNotice::TradeClosed(_))));
        let Some(EngineNotice::Position(_, p)) = seen.get(seen.len() - 2) else { panic!("{seen:?}") };
        assert_eq!(p.side, Side::Flat);
    }

    #[tokio::test]
    async fn closes_are_queued_for_persistence() {
        let (handle, mut rx) = crate::recorder::channel();
        let cfg = EngineConfig::default();
        let e = PositionEngine::new(cfg, Arc::new(SymbolTable::default()), Arc::new(NoopListener), Some(handle));
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));
        e.apply(&fill("2", "Sim1", OrderSide::Sell, 1.0, 1.0, 6751.0));
        assert!(matches!(rx.recv().await, Some(PersistJob::Open(_))));
        assert!(matches!(rx.recv().await, Some(PersistJob::Close(_))));
    }

    #[tokio::test]
    async fn restore_installs_only_into_flat_slots() {
        let store = Arc::new(MemoryStore::new());
        let nq = ScopeKey::new(Mode::Sim, "Sim1", "NQZ5");
        let stored_es = PositionState::open(&sim(), Side::Short, 1.0, 6800.0, Utc::now(), EntryContext::default());
        let stored_nq = PositionState::open(&nq, Side::Long, 2.0, 21000.0, Utc::now(), EntryContext::default());
        store.save_open_position(&stored_es).unwrap();
        store.save_open_position(&stored_nq).unwrap();

        let e = Arc::new(engine());
        // live state arrived first for ES
        e.apply(&fill("1", "Sim1", OrderSide::Buy, 1.0, 1.0, 6750.0));

        let restored = e.spawn_restore(store, None).await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(e.snapshot(&sim()).side, Side::Long);
        let nq_now = e.snapshot(&nq);
        assert_eq!((nq_now.side, nq_now.qty), (Side::Long, 2.0));
    }
}
