// ===============================
// src/circuit_breaker.rs
// ===============================
//
// Circuit breaker untuk reconnect:
// - Closed   : boleh connect bebas
// - Open     : tolak semua attempt sampai recovery_timeout lewat
// - HalfOpen : tepat SATU attempt percobaan
// Semua method punya varian `_at(now)` supaya test deterministik.
//
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self { Self { threshold: 5, recovery_timeout: Duration::from_secs(30) } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState { Closed, Open, HalfOpen }

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        }
    }
    /// Gauge value: 0 closed, 1 half-open, 2 open.
    pub fn code(&self) -> i64 {
        match self {
            CircuitBreakerState::Closed => 0,
            CircuitBreakerState::HalfOpen => 1,
            CircuitBreakerState::Open => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Go ahead; `trial` marks the single half-open attempt.
    Granted { trial: bool },
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
struct Inner {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_trips: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub total_trips: u64,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg: BreakerConfig { threshold: cfg.threshold.max(1), ..cfg },
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
                opened_at: None,
                trial_in_flight: false,
                total_trips: 0,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig { &self.cfg }

    pub fn state(&self) -> CircuitBreakerState { self.inner.lock().state }

    pub fn failure_count(&self) -> u32 { self.inner.lock().failure_count }

    pub fn last_failure_time(&self) -> Option<Instant> { self.inner.lock().last_failure_time }

    pub fn stats(&self) -> BreakerStats {
        let g = self.inner.lock();
        BreakerStats { state: g.state, failure_count: g.failure_count, total_trips: g.total_trips }
    }

    pub fn try_acquire(&self) -> Permit { self.try_acquire_at(Instant::now()) }

    pub fn try_acquire_at(&self, now: Instant) -> Permit {
        let mut g = self.inner.lock();
        match g.state {
            CircuitBreakerState::Closed => Permit::Granted { trial: false },
            CircuitBreakerState::Open => {
                let opened = g.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened);
                if elapsed >= self.cfg.recovery_timeout {
                    g.state = CircuitBreakerState::HalfOpen;
                    g.trial_in_flight = true;
                    Permit::Granted { trial: true }
                } else {
                    Permit::Rejected { retry_in: self.cfg.recovery_timeout - elapsed }
                }
            }
            CircuitBreakerState::HalfOpen => {
                if g.trial_in_flight {
                    Permit::Rejected { retry_in: self.cfg.recovery_timeout }
                } else {
                    g.trial_in_flight = true;
                    Permit::Granted { trial: true }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut g = self.inner.lock();
        g.state = CircuitBreakerState::Closed;
        g.failure_count = 0;
        g.opened_at = None;
        g.trial_in_flight = false;
    }

    /// Hands back an unfinished half-open trial (caller cancelled). Nothing is
    /// counted; the next `try_acquire` may run the trial again.
    pub fn release_trial(&self) {
        let mut g = self.inner.lock();
        if g.state == CircuitBreakerState::HalfOpen {
            g.trial_in_flight = false;
        }
    }

    pub fn record_failure(&self) -> bool { self.record_failure_at(Instant::now()) }

    /// Returns true when this failure (re)opened the breaker.
    pub fn record_failure_at(&self, now: Instant) -> bool {
        let mut g = self.inner.lock();
        g.failure_count = g.failure_count.saturating_add(1);
        g.last_failure_time = Some(now);
        let trip = match g.state {
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Closed => g.failure_count >= self.cfg.threshold,
            // already open: keep the original timer
            CircuitBreakerState::Open => false,
        };
        if trip {
            g.state = CircuitBreakerState::Open;
            g.opened_at = Some(now);
            g.trial_in_flight = false;
            g.total_trips += 1;
        }
        trip
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self { Self::new(BreakerConfig::default()) }
}
