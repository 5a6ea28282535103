// ===============================
// src/main.rs
// ===============================
/*
 # status koneksi & breaker
 curl -s localhost:9898/metrics | egrep '^dtc_(connection_state|breaker_state|reconnects_total)'

 # trade yang sudah ditutup / antrian persist
 curl -s localhost:9898/metrics | egrep '^(trades_closed_total|persist_pending|positions_open)'
*/
/*
=============================================================================
Project : dtc_bridge — DTC protocol client + position lifecycle engine
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Connects to a DTC (JSON encoding) trading server, keeps the
          session alive with heartbeats behind a reconnect circuit breaker,
          tracks positions per (mode, account, symbol), computes P&L /
          MAE / MFE / R-multiple, and persists closed trades atomically.
=============================================================================
*/
use anyhow::Context;
use std::sync::Arc;
use tokio::{
    select, signal,
    sync::mpsc,
    time::{interval, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dtc_bridge::circuit_breaker::CircuitBreaker;
use dtc_bridge::config;
use dtc_bridge::connection::ConnectionManager;
use dtc_bridge::dispatcher::MessageDispatcher;
use dtc_bridge::domain::NormalizedEvent;
use dtc_bridge::listener::LogListener;
use dtc_bridge::metrics;
use dtc_bridge::positions::{self, PositionEngine};
use dtc_bridge::recorder;
use dtc_bridge::store::{JsonFileStore, TradeStore};
use dtc_bridge::symbols::SymbolTable;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Config & logging ----
    let cfg = config::load();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&cfg.log_filter)).init();

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(cfg.metrics_port);

    info!(
        addr = %cfg.connection.addr(),
        user = %cfg.connection.username,
        default_account = ?cfg.default_account,
        sim_prefixes = ?cfg.engine.modes.sim_prefixes,
        debug_accounts = ?cfg.engine.modes.debug_accounts,
        heartbeat = ?cfg.connection.heartbeat_interval,
        store = %cfg.store.path,
        "startup config"
    );

    // ---- Store + recorder (off the hot path) ----
    let store: Arc<dyn TradeStore> = Arc::new(
        JsonFileStore::open(&cfg.store.path).with_context(|| format!("open trade store {}", cfg.store.path))?,
    );
    let (rec_handle, rec_rx) = recorder::channel();
    let recorder_task = tokio::spawn(recorder::run(rec_rx, Arc::clone(&store), cfg.store.retry_every));

    // ---- Engine ----
    let engine = Arc::new(PositionEngine::new(
        cfg.engine.clone(),
        Arc::new(SymbolTable::default()),
        Arc::new(LogListener),
        Some(rec_handle),
    ));
    let restore_task = engine.spawn_restore(Arc::clone(&store), None);

    // network -> engine
    let (ev_tx, ev_rx) = mpsc::channel::<NormalizedEvent>(4096);
    let engine_task = tokio::spawn(positions::run(Arc::clone(&engine), ev_rx));

    // ---- Connection ----
    let cancel = CancellationToken::new();
    let breaker = Arc::new(CircuitBreaker::new(cfg.connection.breaker.clone()));
    let (conn, mut conn_state) = ConnectionManager::new(
        cfg.connection.clone(),
        Arc::clone(&breaker),
        MessageDispatcher::new(cfg.default_account.clone()),
        ev_tx,
    );
    let conn_task = tokio::spawn(conn.run(cancel.clone()));

    // ---- Status loop until Ctrl-C ----
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut status = interval(Duration::from_secs(30));
    loop {
        select! {
            _ = &mut ctrl_c => {
                info!("ctrl-c, shutting down");
                break;
            }
            changed = conn_state.changed() => {
                if changed.is_err() {
                    warn!("connection task ended");
                    break;
                }
                info!(state = conn_state.borrow().as_str(), "connection");
            }
            _ = status.tick() => {
                let open = engine.open_positions();
                let b = breaker.stats();
                info!(
                    open_positions = open.len(),
                    breaker = b.state.as_str(),
                    failures = b.failure_count,
                    trips = b.total_trips,
                    "status"
                );
                for p in open {
                    info!(scope = %p.key(), side = p.side.as_str(), qty = p.qty, entry = p.entry_price, last = p.last_price, "open");
                }
            }
        }
    }

    // ---- Drain: connection -> engine -> recorder ----
    cancel.cancel();
    let _ = conn_task.await;
    let _ = engine_task.await;
    match restore_task.await {
        Ok(n) => info!(restored = n, "restore finished"),
        Err(e) => warn!(?e, "restore task failed"),
    }
    // last handle to the recorder queue goes with the engine
    drop(engine);
    let _ = recorder_task.await;
    info!("bye");
    Ok(())
}
