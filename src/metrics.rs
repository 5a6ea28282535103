// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{info, warn};

// Semua metric di registry sendiri
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static counter opts")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("static counter opts")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("static gauge opts")
}

// -------- Wire / session --------
pub static FRAMES: Lazy<IntCounter> = Lazy::new(|| counter("dtc_frames_total", "frames extracted from the stream"));

pub static FRAME_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| counter("dtc_frame_errors_total", "oversized frames dropped by the framer"));

pub static DECODE_ERRORS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("dtc_decode_errors_total", "frames that did not decode (label: reason)", &["reason"]));

pub static EVENTS_BY_KIND: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("dtc_events_total", "normalized events by kind", &["kind"]));

pub static EVENTS_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| counter("dtc_events_dropped_total", "events not delivered because the engine channel closed"));

/// 0 disconnected, 1 connecting, 2 handshaking, 3 connected
pub static CONN_STATE: Lazy<IntGauge> = Lazy::new(|| gauge("dtc_connection_state", "connection state code"));

/// 0 closed, 1 half-open, 2 open
pub static BREAKER_STATE: Lazy<IntGauge> = Lazy::new(|| gauge("dtc_breaker_state", "circuit breaker state code"));

pub static BREAKER_TRIPS: Lazy<IntCounter> =
    Lazy::new(|| counter("dtc_breaker_trips_total", "times the breaker opened"));

pub static RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| counter("dtc_reconnects_total", "session attempts after the first"));

pub static HEARTBEATS_SENT: Lazy<IntCounter> = Lazy::new(|| counter("dtc_heartbeats_sent_total", "heartbeats written"));

// Connect + logon round trip (ms)
pub static LAT_HANDSHAKE: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("dtc_handshake_ms", "connect to successful logon (ms)")
            .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
    )
    .expect("static histogram opts")
});

// -------- Engine --------
pub static OPEN_POSITIONS: Lazy<IntGauge> = Lazy::new(|| gauge("positions_open", "scopes currently open"));

pub static TRADES_CLOSED: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("trades_closed_total", "closed trades (label: mode)", &["mode"]));

pub static EVENTS_SUPPRESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("engine_events_suppressed_total", "duplicate or late closing signals (label: reason)", &["reason"])
});

// -------- Persistence --------
pub static PERSIST_PENDING: Lazy<IntGauge> = Lazy::new(|| gauge("persist_pending", "jobs waiting for the store"));

pub static PERSIST_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("persist_failures_total", "failed store writes (each retried)"));

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(FRAMES.clone()),
        Box::new(FRAME_ERRORS.clone()),
        Box::new(DECODE_ERRORS.clone()),
        Box::new(EVENTS_BY_KIND.clone()),
        Box::new(EVENTS_DROPPED.clone()),
        Box::new(CONN_STATE.clone()),
        Box::new(BREAKER_STATE.clone()),
        Box::new(BREAKER_TRIPS.clone()),
        Box::new(RECONNECTS.clone()),
        Box::new(HEARTBEATS_SENT.clone()),
        Box::new(LAT_HANDSHAKE.clone()),
        Box::new(OPEN_POSITIONS.clone()),
        Box::new(TRADES_CLOSED.clone()),
        Box::new(EVENTS_SUPPRESSED.clone()),
        Box::new(PERSIST_PENDING.clone()),
        Box::new(PERSIST_FAILURES.clone()),
    ];
    for c in collectors {
        // double init (tests) -> AlreadyReg, ignore
        let _ = REGISTRY.register(c);
    }
}

pub fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// tiny HTTP/1.1 responder: "/" and "/metrics" -> text format, else 404
fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).unwrap_or(0);
    let line = String::from_utf8_lossy(&req[..n]);
    let path = line.split_whitespace().nth(1).unwrap_or("/");

    let (status, body) = match path {
        "/" | "/metrics" => ("200 OK", encode_metrics()),
        _ => ("404 Not Found", b"not found\n".to_vec()),
    };
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Exporter on its own OS thread. Port 0 disables it; a bind failure is logged, not fatal.
pub fn serve_metrics(port: u16) {
    if port == 0 {
        info!("metrics exporter disabled");
        return;
    }
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr) {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, error = %e, "metrics bind failed, exporter off");
            return;
        }
    };
    info!("metrics listening on http://{addr}/metrics");
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(error = %e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_show_up_in_text_format() {
        init();
        init();
        TRADES_CLOSED.with_label_values(&["sim"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("trades_closed_total"));
        assert!(text.contains("mode=\"sim\""));
    }
}
