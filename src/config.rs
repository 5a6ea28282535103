// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : dtc_bridge — DTC protocol client + position lifecycle engine
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Connects to a DTC (JSON encoding) trading server, keeps the
          session alive with heartbeats behind a reconnect circuit breaker,
          tracks positions per (mode, account, symbol), computes P&L /
          MAE / MFE / R-multiple, and persists closed trades atomically.
=============================================================================
*/
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::BreakerConfig;
use crate::domain::Mode;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_name: String,
    /// Account sent with post-logon snapshot requests (empty = all).
    pub trade_account: Option<String>,
    pub heartbeat_interval: Duration,
    /// Session is dead after `heartbeat_interval * dead_multiple` of silence.
    pub dead_multiple: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_frame_bytes: usize,
    pub breaker: BreakerConfig,
}

impl ConnectionConfig {
    pub fn addr(&self) -> String { format!("{}:{}", self.host, self.port) }

    pub fn dead_after(&self) -> Duration { self.heartbeat_interval * self.dead_multiple.max(1) }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11099,
            username: String::new(),
            password: String::new(),
            client_name: "dtc_bridge".to_string(),
            trade_account: None,
            heartbeat_interval: Duration::from_secs(5),
            dead_multiple: 3,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            max_frame_bytes: 1 << 20,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Maps an account name to its trading mode. Mode is always derived per event, never global.
#[derive(Clone, Debug)]
pub struct ModeResolver {
    pub sim_prefixes: Vec<String>,
    pub debug_accounts: Vec<String>,
}

impl ModeResolver {
    pub fn resolve(&self, account: &str) -> Mode {
        if self.debug_accounts.iter().any(|a| a.eq_ignore_ascii_case(account)) {
            return Mode::Debug;
        }
        let lower = account.to_ascii_lowercase();
        if self.sim_prefixes.iter().any(|p| !p.is_empty() && lower.starts_with(&p.to_ascii_lowercase())) {
            return Mode::Sim;
        }
        Mode::Live
    }
}

impl Default for ModeResolver {
    fn default() -> Self { Self { sim_prefixes: vec!["Sim".to_string()], debug_accounts: Vec::new() } }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub modes: ModeResolver,
    /// Window in which a late fill matching a just-closed trade is treated as its twin.
    pub close_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self { Self { modes: ModeResolver::default(), close_grace: Duration::from_secs(3) } }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub path: String,
    pub retry_every: Duration,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,
    /// Fallback account for messages that omit one.
    pub default_account: Option<String>,
    pub metrics_port: u16,
    pub log_filter: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) => v.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()).map(str::to_string).collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn load() -> AppConfig {
    // .env opsional
    let _ = dotenv();

    // ===== Connection =====
    let d = ConnectionConfig::default();
    let default_account = env_opt("DEFAULT_ACCOUNT");
    let connection = ConnectionConfig {
        host: env::var("DTC_HOST").unwrap_or(d.host),
        port: env_or("DTC_PORT", d.port),
        username: env::var("DTC_USERNAME").unwrap_or_default(),
        password: env::var("DTC_PASSWORD").unwrap_or_default(),
        client_name: env::var("CLIENT_NAME").unwrap_or(d.client_name),
        trade_account: default_account.clone(),
        heartbeat_interval: Duration::from_secs(env_or("HEARTBEAT_SECS", 5u64).max(1)),
        dead_multiple: env_or("HEARTBEAT_DEAD_MULTIPLE", d.dead_multiple),
        connect_timeout: Duration::from_millis(env_or("CONNECT_TIMEOUT_MS", 5_000)),
        handshake_timeout: Duration::from_millis(env_or("HANDSHAKE_TIMEOUT_MS", 5_000)),
        reconnect_base: Duration::from_millis(env_or("RECONNECT_BASE_MS", 500)),
        reconnect_max: Duration::from_millis(env_or("RECONNECT_MAX_MS", 30_000)),
        max_frame_bytes: env_or("MAX_FRAME_BYTES", d.max_frame_bytes),
        breaker: BreakerConfig {
            threshold: env_or("BREAKER_THRESHOLD", 5),
            recovery_timeout: Duration::from_secs(env_or("BREAKER_RECOVERY_SECS", 30)),
        },
    };

    // ===== Engine =====
    let engine = EngineConfig {
        modes: ModeResolver {
            sim_prefixes: env_list("SIM_ACCOUNT_PREFIXES", &["Sim"]),
            debug_accounts: env_list("DEBUG_ACCOUNTS", &[]),
        },
        close_grace: Duration::from_millis(env_or("CLOSE_GRACE_MS", 3_000)),
    };

    // ===== Store =====
    let store = StoreConfig {
        path: env::var("TRADE_STORE").unwrap_or_else(|_| "data/trades.json".to_string()),
        retry_every: Duration::from_millis(env_or("PERSIST_RETRY_MS", 1_000u64).max(10)),
    };

    AppConfig {
        connection,
        engine,
        store,
        default_account,
        metrics_port: env_or("METRICS_PORT", 9898),
        log_filter: env_opt("RUST_LOG").or_else(|| env_opt("LOG_FILTER")).unwrap_or_else(|| "info".to_string()),
    }
}
