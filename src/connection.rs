// ===============================
// src/connection.rs
// ===============================
//
// Session DTC di atas TCP:
//   breaker permit -> connect -> logon -> snapshot requests -> reader loop
// - Heartbeat ditulis oleh task writer terpisah (child token per session).
// - Tidak ada byte masuk selama `dead_after` -> session dianggap mati.
// - Gagal di tahap mana pun -> Disconnected, breaker.record_failure(),
//   exponential backoff + jitter, lalu coba lagi.
// - Frame/decode error hanya di-log; koneksi tetap jalan.
//
use rand::Rng;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    sync::{mpsc, watch},
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, Permit};
use crate::config::ConnectionConfig;
use crate::dispatcher::MessageDispatcher;
use crate::domain::NormalizedEvent;
use crate::framer::{FrameError, ProtocolFramer, RawFrame};
use crate::metrics::{
    BREAKER_STATE, BREAKER_TRIPS, CONN_STATE, DECODE_ERRORS, EVENTS_BY_KIND, EVENTS_DROPPED, FRAMES, FRAME_ERRORS,
    HEARTBEATS_SENT, LAT_HANDSHAKE, RECONNECTS,
};
use crate::protocol::{self, Heartbeat, LogonRequest, Logoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
        }
    }

    fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Handshaking => 2,
            ConnectionState::Connected => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("socket: {0}")]
    Io(#[from] io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("logon rejected: {}", .0.as_deref().unwrap_or("no reason given"))]
    LogonRejected(Option<String>),
    #[error("server logoff: {}", .0.as_deref().unwrap_or("no reason given"))]
    Logoff(Option<String>),
    #[error("no data for {0:?}")]
    HeartbeatLost(Duration),
    #[error("peer closed the connection")]
    Closed,
    #[error("heartbeat writer stopped")]
    WriterStopped,
    #[error("engine channel closed")]
    ChannelClosed,
}

/// Exponential backoff with jitter, capped at `max`. attempt 0 -> base.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(16);
    let delay = base.saturating_mul(factor).min(max);
    let jitter_cap = (delay.as_millis() as u64 / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
    (delay + Duration::from_millis(jitter)).min(max.max(base))
}

pub struct ConnectionManager {
    cfg: ConnectionConfig,
    breaker: Arc<CircuitBreaker>,
    dispatcher: MessageDispatcher,
    events: mpsc::Sender<NormalizedEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

// what the reader did with one frame
enum Handled {
    Continue,
    LoggedOn,
}

impl ConnectionManager {
    pub fn new(
        cfg: ConnectionConfig,
        breaker: Arc<CircuitBreaker>,
        dispatcher: MessageDispatcher,
        events: mpsc::Sender<NormalizedEvent>,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        (Self { cfg, breaker, dispatcher, events, state_tx }, state_rx)
    }

    pub fn state(&self) -> ConnectionState { *self.state_tx.borrow() }

    fn set_state(&self, s: ConnectionState) {
        CONN_STATE.set(s.code());
        self.state_tx.send_replace(s);
        debug!(state = s.as_str(), "connection state");
    }

    /// Reconnect loop; returns when `cancel` fires or the engine side hangs up.
    pub async fn run(self, cancel: CancellationToken) {
        let addr = self.cfg.addr();
        info!(%addr, "connection manager started");
        let mut attempt: u32 = 0;
        let mut sessions: u64 = 0;

        while !cancel.is_cancelled() {
            let permit = self.breaker.try_acquire();
            BREAKER_STATE.set(self.breaker.state().code());
            let trial = match permit {
                Permit::Rejected { retry_in } => {
                    debug!(?retry_in, "breaker open, waiting");
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(retry_in) => continue,
                    }
                }
                Permit::Granted { trial } => {
                    if trial {
                        info!("breaker half-open, trial connect");
                    }
                    trial
                }
            };

            if sessions > 0 {
                RECONNECTS.inc();
            }
            sessions += 1;

            let mut logged_on = false;
            let outcome = self.session(&cancel, &mut logged_on).await;
            self.set_state(ConnectionState::Disconnected);
            if logged_on {
                attempt = 0;
            }

            // stopped before the trial could succeed or fail
            if trial && !logged_on && matches!(outcome, Ok(()) | Err(SessionError::ChannelClosed)) {
                self.breaker.release_trial();
                BREAKER_STATE.set(self.breaker.state().code());
            }

            match outcome {
                Ok(()) => break,
                Err(SessionError::ChannelClosed) => {
                    warn!("engine channel closed, stopping connection");
                    break;
                }
                Err(e) => {
                    if self.breaker.record_failure() {
                        BREAKER_TRIPS.inc();
                        error!(failures = self.breaker.failure_count(), "circuit breaker opened");
                    }
                    BREAKER_STATE.set(self.breaker.state().code());
                    let delay = backoff(attempt, self.cfg.reconnect_base, self.cfg.reconnect_max);
                    attempt = attempt.saturating_add(1);
                    warn!(error = %e, ?delay, "session ended, will reconnect");
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("connection manager stopped");
    }

    // Ok(()) only when cancelled
    async fn session(&self, cancel: &CancellationToken, logged_on: &mut bool) -> Result<(), SessionError> {
        let started = Instant::now();
        self.set_state(ConnectionState::Connecting);
        let addr = self.cfg.addr();
        let stream = select! {
            _ = cancel.cancelled() => return Ok(()),
            r = timeout(self.cfg.connect_timeout, TcpStream::connect(&addr)) => match r {
                Err(_) => return Err(SessionError::Timeout("connect")),
                Ok(Err(source)) => return Err(SessionError::Connect { addr, source }),
                Ok(Ok(s)) => s,
            },
        };
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let mut framer = ProtocolFramer::new(self.cfg.max_frame_bytes);

        self.set_state(ConnectionState::Handshaking);
        let hb_secs = self.cfg.heartbeat_interval.as_secs().max(1) as u32;
        let logon = LogonRequest::new(&self.cfg.username, &self.cfg.password, &self.cfg.client_name, hb_secs);
        writer.write_all(&protocol::encode(&logon)?).await?;

        select! {
            _ = cancel.cancelled() => return Ok(()),
            r = timeout(self.cfg.handshake_timeout, self.await_logon(&mut reader, &mut framer)) => match r {
                Err(_) => return Err(SessionError::Timeout("logon")),
                Ok(r) => r?,
            },
        }

        *logged_on = true;
        self.breaker.record_success();
        BREAKER_STATE.set(self.breaker.state().code());
        LAT_HANDSHAKE.observe(started.elapsed().as_secs_f64() * 1000.0);

        for req in protocol::post_logon_requests(self.cfg.trade_account.as_deref()) {
            writer.write_all(&protocol::encode(&req)?).await?;
        }
        self.set_state(ConnectionState::Connected);
        info!(%addr, "logged on");

        let session_token = cancel.child_token();
        let writer_task = tokio::spawn(write_loop(writer, self.cfg.heartbeat_interval, session_token.clone(), cancel.clone()));

        let result = self.read_loop(&mut reader, &mut framer, &session_token).await;
        session_token.cancel();
        let _ = writer_task.await;

        match result {
            // our own shutdown
            Err(SessionError::WriterStopped) if cancel.is_cancelled() => Ok(()),
            other => other,
        }
    }

    async fn await_logon(&self, reader: &mut OwnedReadHalf, framer: &mut ProtocolFramer) -> Result<(), SessionError> {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            while let Some(frame) = framer.next_frame() {
                if let Handled::LoggedOn = self.handle(frame, true).await? {
                    return Ok(());
                }
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(SessionError::Closed);
            }
            framer.push(&buf[..n]);
        }
    }

    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        framer: &mut ProtocolFramer,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        let dead_after = self.cfg.dead_after();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            // frames that arrived together with the logon response go first
            while let Some(frame) = framer.next_frame() {
                self.handle(frame, false).await?;
            }
            let n = select! {
                _ = token.cancelled() => return Err(SessionError::WriterStopped),
                r = timeout(dead_after, reader.read(&mut buf)) => match r {
                    Err(_) => return Err(SessionError::HeartbeatLost(dead_after)),
                    Ok(r) => r?,
                },
            };
            if n == 0 {
                return Err(SessionError::Closed);
            }
            framer.push(&buf[..n]);
        }
    }

    async fn handle(
        &self,
        frame: Result<RawFrame, FrameError>,
        handshaking: bool,
    ) -> Result<Handled, SessionError> {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                FRAME_ERRORS.inc();
                warn!(error = %e, "frame dropped");
                return Ok(Handled::Continue);
            }
        };
        FRAMES.inc();
        let ev = match self.dispatcher.decode(&frame) {
            Ok(ev) => ev,
            Err(e) => {
                DECODE_ERRORS.with_label_values(&[e.label()]).inc();
                warn!(error = %e, len = frame.len(), "frame not decoded, dropped");
                return Ok(Handled::Continue);
            }
        };
        EVENTS_BY_KIND.with_label_values(&[ev.kind()]).inc();

        match ev {
            NormalizedEvent::Heartbeat => Ok(Handled::Continue),
            NormalizedEvent::Logoff { reason } => Err(SessionError::Logoff(reason)),
            NormalizedEvent::LogonResponse { success, text } => {
                if !handshaking {
                    debug!(success, "logon response outside handshake ignored");
                    return Ok(Handled::Continue);
                }
                if success {
                    Ok(Handled::LoggedOn)
                } else {
                    Err(SessionError::LogonRejected(text))
                }
            }
            data => {
                if self.events.send(data).await.is_err() {
                    EVENTS_DROPPED.inc();
                    return Err(SessionError::ChannelClosed);
                }
                Ok(Handled::Continue)
            }
        }
    }
}

/// Heartbeats every `every`; on app shutdown sends a Logoff before closing the socket.
async fn write_loop(mut w: OwnedWriteHalf, every: Duration, session: CancellationToken, app: CancellationToken) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        select! {
            _ = session.cancelled() => break,
            _ = tick.tick() => {
                let sent = match protocol::encode(&Heartbeat::now()) {
                    Ok(bytes) => w.write_all(&bytes).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match sent {
                    Ok(()) => HEARTBEATS_SENT.inc(),
                    Err(e) => {
                        warn!(error = %e, "heartbeat write failed");
                        session.cancel();
                        break;
                    }
                }
            }
        }
    }

    if app.is_cancelled() {
        if let Ok(bytes) = protocol::encode(&Logoff::shutdown("client shutdown")) {
            let _ = w.write_all(&bytes).await;
        }
    }
    let _ = w.shutdown().await;
}
