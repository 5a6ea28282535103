// ===============================
// src/lib.rs
// ===============================
//
// wire:   framer -> dispatcher (+ fields, protocol) -> connection
// engine: positions (+ pnl, symbols, listener)
// durable: recorder -> store
//
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod domain;
pub mod fields;
pub mod framer;
pub mod listener;
pub mod metrics;
pub mod pnl;
pub mod positions;
pub mod protocol;
pub mod recorder;
pub mod store;
pub mod symbols;
