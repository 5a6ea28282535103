// ===============================
// src/listener.rs
// ===============================
//
// Batas satu arah engine -> presentasi. Engine hanya kenal trait ini,
// tidak pernah tipe UI. Callback dipanggil di luar lock scope.
//
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::domain::{AccountScope, BalanceUpdate, PositionState, ScopeKey, TradeRecord};

pub trait EngineListener: Send + Sync {
    fn balance_changed(&self, _scope: &AccountScope, _balance: &BalanceUpdate) {}
    fn position_changed(&self, _key: &ScopeKey, _position: &Arc<PositionState>) {}
    fn trade_closed(&self, _record: &TradeRecord) {}
}

/// Discards everything.
pub struct NoopListener;
impl EngineListener for NoopListener {}

/// Logs notifications; what the binary runs with when no UI is attached.
pub struct LogListener;

impl EngineListener for LogListener {
    fn balance_changed(&self, scope: &AccountScope, balance: &BalanceUpdate) {
        info!(mode = %scope.mode, account = %scope.account, cash = balance.cash, "balance");
    }

    fn position_changed(&self, key: &ScopeKey, p: &Arc<PositionState>) {
        debug!(scope = %key, side = p.side.as_str(), qty = p.qty, entry = p.entry_price, last = p.last_price, "position");
    }

    fn trade_closed(&self, r: &TradeRecord) {
        info!(
            scope = %r.key(),
            side = r.side.as_str(),
            qty = r.qty,
            entry = r.entry_price,
            exit = r.exit_price,
            pnl = r.realized_pnl,
            r = ?r.r_multiple,
            "trade closed"
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    Balance(AccountScope, BalanceUpdate),
    Position(ScopeKey, Arc<PositionState>),
    TradeClosed(TradeRecord),
}

impl EngineNotice {
    // droppable under back-pressure
    fn is_tick(&self) -> bool { !matches!(self, EngineNotice::TradeClosed(_)) }
}

/// Marshals notices onto a channel for a consumer on another task/thread.
/// Position and balance ticks beyond `capacity` unread are dropped so a slow
/// consumer never stalls the engine. Closed trades are always queued.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<EngineNotice>,
    queued_ticks: Arc<AtomicUsize>,
    capacity: usize,
}

/// Receiving end of a [`ChannelListener`], in engine order.
pub struct NoticeReceiver {
    rx: mpsc::UnboundedReceiver<EngineNotice>,
    queued_ticks: Arc<AtomicUsize>,
}

impl ChannelListener {
    pub fn new(capacity: usize) -> (Self, NoticeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued_ticks = Arc::new(AtomicUsize::new(0));
        let listener = Self { tx, queued_ticks: Arc::clone(&queued_ticks), capacity: capacity.max(1) };
        (listener, NoticeReceiver { rx, queued_ticks })
    }

    fn push(&self, n: EngineNotice) {
        let tick = n.is_tick();
        if tick && self.queued_ticks.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.queued_ticks.fetch_sub(1, Ordering::AcqRel);
            warn!("listener: consumer behind, tick dropped");
            return;
        }
        if self.tx.send(n).is_err() {
            if tick {
                self.queued_ticks.fetch_sub(1, Ordering::AcqRel);
            }
            debug!("listener: receiver gone");
        }
    }
}

impl NoticeReceiver {
    pub async fn recv(&mut self) -> Option<EngineNotice> {
        let n = self.rx.recv().await?;
        self.taken(&n);
        Some(n)
    }

    pub fn try_recv(&mut self) -> Result<EngineNotice, TryRecvError> {
        let n = self.rx.try_recv()?;
        self.taken(&n);
        Ok(n)
    }

    fn taken(&self, n: &EngineNotice) {
        if n.is_tick() {
            self.queued_ticks.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl EngineListener for ChannelListener {
    fn balance_changed(&self, scope: &AccountScope, balance: &BalanceUpdate) {
        self.push(EngineNotice::Balance(scope.clone(), balance.clone()));
    }

    fn position_changed(&self, key: &ScopeKey, position: &Arc<PositionState>) {
        self.push(EngineNotice::Position(key.clone(), Arc::clone(position)));
    }

    fn trade_closed(&self, record: &TradeRecord) {
        self.push(EngineNotice::TradeClosed(record.clone()));
    }
}
