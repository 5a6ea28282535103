// ===============================
// src/recorder.rs
// ===============================
//
// TradeRecorder:
// - build_record(): rakit TradeRecord dari snapshot posisi saat close
// - run()         : worker persistence di luar hot path (queue unbounded)
//
// Kebijakan kalau store gagal: RETRY SAMPAI BERHASIL, urut FIFO.
// Job yang gagal tetap di kepala antrian, dicoba ulang tiap `retry_every`;
// job berikutnya menunggu di belakangnya. Trade id deterministik, jadi retry
// tidak pernah menggandakan trade.
//
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::{ExitPriceSource, PositionState, ScopeKey, TradeId, TradeRecord};
use crate::metrics::{PERSIST_FAILURES, PERSIST_PENDING};
use crate::pnl::{self, Excursion};
use crate::store::{StoreError, TradeStore};
use crate::symbols::SymbolMetadata;

/// Candidate exit prices, tried in declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExitPrices {
    pub last_fill: Option<f64>,
    pub avg_fill: Option<f64>,
    pub quote: Option<f64>,
    pub market: Option<f64>,
}

impl ExitPrices {
    /// First usable price wins; entry is the last resort so a record is always produced.
    pub fn resolve(&self, entry_price: f64) -> (f64, ExitPriceSource) {
        let usable = |p: Option<f64>| p.filter(|v| v.is_finite() && *v > 0.0);
        if let Some(p) = usable(self.last_fill) {
            return (p, ExitPriceSource::LastFill);
        }
        if let Some(p) = usable(self.avg_fill) {
            return (p, ExitPriceSource::AverageFill);
        }
        if let Some(p) = usable(self.quote) {
            return (p, ExitPriceSource::Quote);
        }
        if let Some(p) = usable(self.market) {
            return (p, ExitPriceSource::Market);
        }
        (entry_price, ExitPriceSource::Entry)
    }
}

/// Stable id: same round trip always hashes to the same id.
pub fn trade_id(position: &PositionState, exit_time: DateTime<Utc>) -> TradeId {
    let mut h = Sha256::new();
    h.update(position.mode.as_str().as_bytes());
    h.update([0]);
    h.update(position.account.as_bytes());
    h.update([0]);
    h.update(position.symbol.as_bytes());
    h.update([0]);
    h.update(position.entry_time.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    h.update(exit_time.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    h.update(position.max_qty.to_le_bytes());
    TradeId(hex::encode(&h.finalize()[..12]))
}

/// Assemble the record for a position that is closing now.
/// Mode/account come from the position itself, never from ambient state.
pub fn build_record(
    position: &PositionState,
    exit: &ExitPrices,
    exit_time: DateTime<Utc>,
    meta: &dyn SymbolMetadata,
) -> TradeRecord {
    let dpp = meta.dollars_per_point(&position.symbol);
    let per_contract = meta.commission_per_contract(&position.symbol);
    let (exit_price, exit_price_source) = exit.resolve(position.entry_price);

    // exit counts as a priced tick
    let position = position.with_price(exit_price);
    let side = position.side;
    let qty = position.max_qty.max(position.qty);

    let commissions = position.commissions + pnl::commissions(per_contract, position.qty);
    let gross_final = pnl::unrealized_pnl(side, position.entry_price, exit_price, position.qty, dpp);
    let realized_pnl = position.realized_partial + gross_final - commissions;

    let risk = pnl::planned_risk_dollars(position.entry_price, position.stop_price, dpp, qty);
    let ex = Excursion::from_peaks(side, position.entry_price, position.peak_favorable_price, position.peak_adverse_price);
    let mae_dollars = Excursion::dollars(ex.mae_points, qty, dpp);
    let mfe_dollars = Excursion::dollars(ex.mfe_points, qty, dpp);
    let range_points = ex.range_points();

    TradeRecord {
        id: trade_id(&position, exit_time),
        symbol: position.symbol.clone(),
        side,
        qty,
        entry_price: position.entry_price,
        entry_time: position.entry_time,
        exit_price,
        exit_time,
        exit_price_source,
        realized_pnl,
        commissions,
        stop_price: position.stop_price,
        target_price: position.target_price,
        planned_risk_dollars: risk,
        r_multiple: pnl::r_multiple(realized_pnl, risk),
        mae_points: ex.mae_points,
        mae_dollars,
        mae_r: pnl::r_multiple(mae_dollars, risk),
        mfe_points: ex.mfe_points,
        mfe_dollars,
        mfe_r: pnl::r_multiple(mfe_dollars, risk),
        efficiency: pnl::efficiency(realized_pnl, mfe_dollars),
        range_points,
        range_r: pnl::r_multiple(Excursion::dollars(range_points, qty, dpp), risk),
        entry_context: position.entry_context,
        mode: position.mode,
        account: position.account.clone(),
    }
}

// ---- persistence worker ----

#[derive(Debug, Clone)]
pub enum PersistJob {
    /// Opened or changed position, kept so it can be restored after restart.
    Open(PositionState),
    /// Save the trade and clear its open position in one store transaction.
    Close(TradeRecord),
    /// Drop a stored open position with no trade attached.
    Clear(ScopeKey),
}

impl PersistJob {
    fn describe(&self) -> String {
        match self {
            PersistJob::Open(p) => format!("open {}", p.key()),
            PersistJob::Close(r) => format!("close {} trade {}", r.key(), r.id),
            PersistJob::Clear(k) => format!("clear {k}"),
        }
    }
}

/// Cheap, cloneable submit side. Never blocks.
#[derive(Debug, Clone)]
pub struct RecorderHandle {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl RecorderHandle {
    pub fn submit(&self, job: PersistJob) {
        if let Err(e) = self.tx.send(job) {
            error!(job = %e.0.describe(), "recorder: queue closed, job not persisted");
        }
    }
}

pub fn channel() -> (RecorderHandle, mpsc::UnboundedReceiver<PersistJob>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RecorderHandle { tx }, rx)
}

fn apply(store: &dyn TradeStore, job: &PersistJob) -> Result<(), StoreError> {
    match job {
        PersistJob::Open(p) => store.save_open_position(p),
        PersistJob::Close(r) => store.commit_close(r).map(|_| ()),
        PersistJob::Clear(k) => store.clear_open_position(k),
    }
}

async fn apply_blocking(store: &Arc<dyn TradeStore>, job: &PersistJob) -> Result<(), StoreError> {
    let store = Arc::clone(store);
    let job = job.clone();
    tokio::task::spawn_blocking(move || apply(store.as_ref(), &job))
        .await
        .map_err(|e| StoreError::Unavailable(format!("persist task: {e}")))?
}

/// Drain the head of the queue until empty or the first failure.
async fn drain(store: &Arc<dyn TradeStore>, pending: &mut VecDeque<PersistJob>) {
    while let Some(job) = pending.front() {
        match apply_blocking(store, job).await {
            Ok(()) => {
                if let PersistJob::Close(r) = job {
                    info!(trade = %r.id, scope = %r.key(), pnl = r.realized_pnl, "recorder: trade persisted");
                }
                pending.pop_front();
            }
            Err(e) => {
                PERSIST_FAILURES.inc();
                warn!(?e, job = %job.describe(), pending = pending.len(), "recorder: store write failed, will retry");
                break;
            }
        }
    }
    PERSIST_PENDING.set(pending.len() as i64);
}

const SHUTDOWN_ATTEMPTS: u32 = 5;

pub async fn run(mut rx: mpsc::UnboundedReceiver<PersistJob>, store: Arc<dyn TradeStore>, retry_every: Duration) {
    info!("recorder: started");
    let mut pending: VecDeque<PersistJob> = VecDeque::new();

    let mut tick = interval(retry_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_job = rx.recv() => {
                match maybe_job {
                    Some(job) => {
                        pending.push_back(job);
                        // jobs behind a failed one wait for the retry tick
                        if pending.len() == 1 {
                            drain(&store, &mut pending).await;
                        } else {
                            PERSIST_PENDING.set(pending.len() as i64);
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                if !pending.is_empty() {
                    drain(&store, &mut pending).await;
                }
            }
        }
    }

    // queue closed: last attempts before exit
    for _ in 0..SHUTDOWN_ATTEMPTS {
        if pending.is_empty() {
            break;
        }
        drain(&store, &mut pending).await;
        if !pending.is_empty() {
            tokio::time::sleep(retry_every).await;
        }
    }
    if pending.is_empty() {
        info!("recorder: queue closed, all jobs persisted");
    } else {
        let jobs: Vec<String> = pending.iter().map(PersistJob::describe).collect();
        error!(?jobs, "recorder: stopped with unpersisted jobs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntryContext, Mode, Side};
    use crate::store::MemoryStore;
    use crate::symbols::{ContractSpec, SymbolTable};

    fn table(dpp: f64, commission: f64) -> SymbolTable {
        let spec = ContractSpec { dollars_per_point: dpp, commission_per_contract: commission };
        SymbolTable::new([("ES", spec)], spec)
    }

    fn long(entry: f64, qty: f64) -> PositionState {
        let key = ScopeKey::new(Mode::Sim, "Sim1", "ESZ5");
        PositionState::open(&key, Side::Long, qty, entry, Utc::now(), EntryContext::default())
    }

    fn fill(price: f64) -> ExitPrices { ExitPrices { last_fill: Some(price), ..Default::default() } }

    #[test]
    fn exit_price_chain_priority() {
        let all = ExitPrices { last_fill: Some(1.0), avg_fill: Some(2.0), quote: Some(3.0), market: Some(4.0) };
        assert_eq!(all.resolve(9.0), (1.0, ExitPriceSource::LastFill));
        let no_fill = ExitPrices { last_fill: None, ..all };
        assert_eq!(no_fill.resolve(9.0), (2.0, ExitPriceSource::AverageFill));
        let quote_only = ExitPrices { quote: Some(3.0), market: Some(4.0), ..Default::default() };
        assert_eq!(quote_only.resolve(9.0), (3.0, ExitPriceSource::Quote));
        let market = ExitPrices { last_fill: Some(0.0), market: Some(4.0), ..Default::default() };
        assert_eq!(market.resolve(9.0), (4.0, ExitPriceSource::Market));
        assert_eq!(ExitPrices::default().resolve(9.0), (9.0, ExitPriceSource::Entry));
    }

    #[test]
    fn five_hundred_dollar_long() {
        let rec = build_record(&long(100.0, 2.0), &fill(105.0), Utc::now(), &table(50.0, 0.0));
        assert_eq!(rec.realized_pnl, 500.0);
        assert_eq!(rec.mfe_points, 5.0);
        assert_eq!(rec.mfe_dollars, 500.0);
        assert_eq!(rec.efficiency, Some(1.0));
        assert_eq!(rec.r_multiple, None);
    }

    #[test]
    fn two_r_trade() {
        let mut p = long(6750.0, 1.0);
        p.stop_price = Some(6745.0);
        let p = p.with_price(6748.0);
        let rec = build_record(&p, &fill(6760.0), Utc::now(), &table(5.0, 0.0));
        assert_eq!(rec.planned_risk_dollars, Some(25.0));
        assert_eq!(rec.realized_pnl, 50.0);
        assert_eq!(rec.r_multiple, Some(2.0));
        assert_eq!(rec.mae_points, -2.0);
        assert_eq!(rec.mae_dollars, -10.0);
        assert_eq!(rec.mae_r, Some(-0.4));
        assert_eq!(rec.range_points, 12.0);
        assert_eq!(rec.range_r, Some(2.4));
    }

    #[test]
    fn commissions_and_partials_flow_into_realized() {
        let mut p = long(100.0, 2.0);
        // one lot already closed at 102
        p.realized_partial = 100.0;
        p.commissions = 2.0;
        p.closed_qty = 1.0;
        let p = p.with_qty(1.0);
        let rec = build_record(&p, &fill(104.0), Utc::now(), &table(50.0, 2.0));
        assert_eq!(rec.qty, 2.0);
        assert_eq!(rec.commissions, 4.0);
        assert_eq!(rec.realized_pnl, 100.0 + 200.0 - 4.0);
    }

    #[test]
    fn record_carries_position_scope() {
        let key = ScopeKey::new(Mode::Live, "L1", "NQH6");
        let p = PositionState::open(&key, Side::Short, 1.0, 20000.0, Utc::now(), EntryContext::default());
        let rec = build_record(&p, &fill(19990.0), Utc::now(), &table(20.0, 0.0));
        assert_eq!(rec.mode, Mode::Live);
        assert_eq!(rec.account, "L1");
        assert_eq!(rec.realized_pnl, 200.0);
    }

    #[test]
    fn trade_id_is_stable() {
        let p = long(100.0, 1.0);
        let t = Utc::now();
        assert_eq!(trade_id(&p, t), trade_id(&p, t));
        assert_eq!(trade_id(&p, t).0.len(), 24);
    }

    #[tokio::test]
    async fn worker_retries_until_store_recovers() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(2);
        let (handle, rx) = channel();
        let worker = tokio::spawn(run(rx, store.clone() as Arc<dyn TradeStore>, Duration::from_millis(10)));

        let rec = build_record(&long(100.0, 1.0), &fill(101.0), Utc::now(), &table(50.0, 0.0));
        handle.submit(PersistJob::Close(rec.clone()));

        for _ in 0..200 {
            if !store.trades().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.trades(), vec![rec]);

        drop(handle);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn jobs_keep_order_behind_a_failure() {
        let store = Arc::new(MemoryStore::new());
        let (handle, rx) = channel();
        store.fail_next(1);
        let worker = tokio::spawn(run(rx, store.clone() as Arc<dyn TradeStore>, Duration::from_millis(10)));

        let p = long(100.0, 1.0);
        handle.submit(PersistJob::Open(p.clone()));
        let rec = build_record(&p, &fill(101.0), Utc::now(), &table(50.0, 0.0));
        handle.submit(PersistJob::Close(rec));

        drop(handle);
        worker.await.unwrap();
        // open was retried first, close applied after it: nothing left open
        assert!(store.load_open_position(&p.key()).unwrap().is_none());
        assert_eq!(store.trades().len(), 1);
    }
}
