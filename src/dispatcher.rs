// ===============================
// src/dispatcher.rs
// ===============================
//
// Frame -> NormalizedEvent.
// Type tidak dikenal / field wajib hilang -> DecodeError (caller log + drop),
// tidak pernah fatal untuk koneksi.
//
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{BalanceUpdate, MarketPrice, NormalizedEvent, OrderUpdate, PositionUpdate};
use crate::fields::{resolve, resolve_f64, resolve_i64, resolve_string, Field};
use crate::framer::RawFrame;
use crate::protocol;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("message has no type discriminator")]
    MissingType,
    #[error("unknown message type {0}")]
    UnknownType(i64),
    #[error("{kind} message missing required field {field}")]
    MissingField { kind: &'static str, field: &'static str },
}

impl DecodeError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DecodeError::Json(_) | DecodeError::NotAnObject => "unparseable",
            DecodeError::MissingType => "missing_type",
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::MissingField { .. } => "missing_field",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind { LogonResponse, Heartbeat, Logoff, MarketTrade, OrderUpdate, PositionUpdate, BalanceUpdate }

const MESSAGE_TABLE: &[(u16, Kind)] = &[
    (protocol::LOGON_RESPONSE, Kind::LogonResponse),
    (protocol::HEARTBEAT, Kind::Heartbeat),
    (protocol::LOGOFF, Kind::Logoff),
    (protocol::MARKET_DATA_UPDATE_TRADE, Kind::MarketTrade),
    (protocol::MARKET_DATA_UPDATE_TRADE_COMPACT, Kind::MarketTrade),
    (protocol::ORDER_UPDATE, Kind::OrderUpdate),
    (protocol::POSITION_UPDATE, Kind::PositionUpdate),
    (protocol::ACCOUNT_BALANCE_UPDATE, Kind::BalanceUpdate),
];

fn kind_of(code: i64) -> Option<Kind> {
    MESSAGE_TABLE.iter().find(|(c, _)| i64::from(*c) == code).map(|(_, k)| *k)
}

#[derive(Debug, Clone, Default)]
pub struct MessageDispatcher {
    /// Account used when a message carries none (single-account logons).
    default_account: Option<String>,
}

impl MessageDispatcher {
    pub fn new(default_account: Option<String>) -> Self { Self { default_account } }

    pub fn decode(&self, frame: &RawFrame) -> Result<NormalizedEvent, DecodeError> {
        let value: Value = serde_json::from_slice(frame.as_bytes())?;
        match value {
            Value::Object(map) => self.decode_map(&map),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    pub fn decode_map(&self, m: &Map<String, Value>) -> Result<NormalizedEvent, DecodeError> {
        let code = resolve_i64(m, Field::Type).ok_or(DecodeError::MissingType)?;
        let kind = kind_of(code).ok_or(DecodeError::UnknownType(code))?;
        Ok(match kind {
            Kind::LogonResponse => NormalizedEvent::LogonResponse {
                // only an explicit success code counts
                success: resolve_i64(m, Field::LogonResult) == Some(protocol::LOGON_SUCCESS),
                text: resolve_string(m, Field::ResultText),
            },
            Kind::Heartbeat => NormalizedEvent::Heartbeat,
            Kind::Logoff => NormalizedEvent::Logoff { reason: resolve_string(m, Field::Reason) },
            Kind::MarketTrade => NormalizedEvent::Market(MarketPrice {
                symbol: required_string(m, Field::Symbol, "market_trade", "symbol")?,
                price: resolve_f64(m, Field::TradePrice)
                    .filter(|p| *p > 0.0)
                    .ok_or(DecodeError::MissingField { kind: "market_trade", field: "price" })?,
            }),
            Kind::OrderUpdate => NormalizedEvent::Order(self.order_update(m)?),
            Kind::PositionUpdate => NormalizedEvent::Position(PositionUpdate {
                symbol: required_string(m, Field::Symbol, "position_update", "symbol")?,
                // a missing quantity on a position update means flat
                qty: resolve_f64(m, Field::PositionQty).unwrap_or(0.0),
                avg_price: resolve_f64(m, Field::PositionAvgPrice).filter(|p| *p > 0.0),
                account: self.account(m, "position_update")?,
            }),
            Kind::BalanceUpdate => NormalizedEvent::Balance(BalanceUpdate {
                account: self.account(m, "balance_update")?,
                cash: resolve_f64(m, Field::Cash).ok_or(DecodeError::MissingField { kind: "balance_update", field: "cash" })?,
                ts: timestamp(m).unwrap_or_else(Utc::now),
            }),
        })
    }

    fn order_update(&self, m: &Map<String, Value>) -> Result<OrderUpdate, DecodeError> {
        let side = resolve(m, Field::BuySell).and_then(|v| match v {
            Value::String(s) => protocol::buy_sell_text(s),
            other => other.as_i64().and_then(protocol::buy_sell),
        });
        Ok(OrderUpdate {
            order_id: resolve_string(m, Field::OrderId),
            symbol: required_string(m, Field::Symbol, "order_update", "symbol")?,
            account: self.account(m, "order_update")?,
            status: resolve_i64(m, Field::OrderStatus).and_then(protocol::order_status),
            reason: resolve_i64(m, Field::UpdateReason).and_then(protocol::order_update_reason),
            side,
            order_qty: resolve_f64(m, Field::OrderQty).filter(|q| *q >= 0.0),
            filled_qty: resolve_f64(m, Field::FillQty).filter(|q| *q > 0.0).unwrap_or(0.0),
            cumulative_qty: resolve_f64(m, Field::CumulativeQty).filter(|q| *q >= 0.0),
            fill_price: positive(resolve_f64(m, Field::FillPrice)),
            avg_fill_price: positive(resolve_f64(m, Field::AvgFillPrice)),
            order_price: positive(resolve_f64(m, Field::OrderPrice)),
            ts: timestamp(m).unwrap_or_else(Utc::now),
        })
    }

    fn account(&self, m: &Map<String, Value>, kind: &'static str) -> Result<String, DecodeError> {
        resolve_string(m, Field::Account)
            .or_else(|| self.default_account.clone())
            .ok_or(DecodeError::MissingField { kind, field: "account" })
    }
}

fn required_string(m: &Map<String, Value>, f: Field, kind: &'static str, field: &'static str) -> Result<String, DecodeError> {
    resolve_string(m, f).ok_or(DecodeError::MissingField { kind, field })
}

// prices of 0 mean "not set" on the wire
fn positive(v: Option<f64>) -> Option<f64> { v.filter(|p| *p > 0.0) }

// seconds since epoch, fractional allowed
fn timestamp(m: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let secs = resolve_f64(m, Field::Timestamp).filter(|s| *s > 0.0)?;
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}
