// ===============================
// src/protocol.rs
// ===============================
//
// Wire model (DTC, JSON encoding): satu object JSON per message,
// diakhiri byte NUL, selalu membawa field numerik "Type".
//
use chrono::Utc;
use serde::Serialize;

use crate::domain::{OrderSide, OrderStatus, OrderUpdateReason};
use crate::framer::DEFAULT_TERMINATOR;

pub const PROTOCOL_VERSION: u32 = 8;

pub const LOGON_REQUEST: u16 = 1;
pub const LOGON_RESPONSE: u16 = 2;
pub const HEARTBEAT: u16 = 3;
pub const LOGOFF: u16 = 5;
pub const MARKET_DATA_UPDATE_TRADE: u16 = 107;
pub const MARKET_DATA_UPDATE_TRADE_COMPACT: u16 = 112;
pub const OPEN_ORDERS_REQUEST: u16 = 300;
pub const ORDER_UPDATE: u16 = 301;
pub const CURRENT_POSITIONS_REQUEST: u16 = 305;
pub const POSITION_UPDATE: u16 = 306;
pub const ACCOUNT_BALANCE_UPDATE: u16 = 600;
pub const ACCOUNT_BALANCE_REQUEST: u16 = 601;

/// LogonResponse `Result` value for success. Anything else is a failed logon.
pub const LOGON_SUCCESS: i64 = 1;

/// `Integer_1` bit asking the server to stream order updates for all accounts.
/// Without it some servers never push fills on their own.
pub const LOGON_FLAG_ORDER_UPDATES: u32 = 0x2;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogonRequest {
    #[serde(rename = "Type")]
    pub kind: u16,
    pub protocol_version: u32,
    pub username: String,
    pub password: String,
    pub client_name: String,
    pub hardware_identifier: String,
    pub heartbeat_interval_in_seconds: u32,
    #[serde(rename = "Integer_1")]
    pub integer_1: u32,
}

impl LogonRequest {
    /// Always carries the order-update subscription flag.
    pub fn new(username: &str, password: &str, client_name: &str, heartbeat_secs: u32) -> Self {
        Self {
            kind: LOGON_REQUEST,
            protocol_version: PROTOCOL_VERSION,
            username: username.to_string(),
            password: password.to_string(),
            client_name: client_name.to_string(),
            hardware_identifier: client_name.to_string(),
            heartbeat_interval_in_seconds: heartbeat_secs,
            integer_1: LOGON_FLAG_ORDER_UPDATES,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    #[serde(rename = "Type")]
    pub kind: u16,
    pub num_dropped_messages: u32,
    pub current_date_time: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self { kind: HEARTBEAT, num_dropped_messages: 0, current_date_time: Utc::now().timestamp() }
    }
}

/// Sent on our own shutdown; the server should not expect us back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Logoff {
    #[serde(rename = "Type")]
    pub kind: u16,
    pub reason: String,
    pub do_not_reconnect: u8,
}

impl Logoff {
    pub fn shutdown(reason: &str) -> Self {
        Self { kind: LOGOFF, reason: reason.to_string(), do_not_reconnect: 1 }
    }
}

/// Snapshot requests sent right after logon (positions, open orders, balances).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnapshotRequest {
    #[serde(rename = "Type")]
    pub kind: u16,
    #[serde(rename = "RequestID")]
    pub request_id: u32,
    pub trade_account: String,
}

pub fn post_logon_requests(trade_account: Option<&str>) -> Vec<SnapshotRequest> {
    let account = trade_account.unwrap_or_default().to_string();
    [CURRENT_POSITIONS_REQUEST, OPEN_ORDERS_REQUEST, ACCOUNT_BALANCE_REQUEST]
        .into_iter()
        .enumerate()
        .map(|(i, kind)| SnapshotRequest { kind, request_id: i as u32 + 1, trade_account: account.clone() })
        .collect()
}

/// JSON body followed by the terminator byte.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = serde_json::to_vec(msg)?;
    out.push(DEFAULT_TERMINATOR);
    Ok(out)
}

// ---- enum code ranges; anything outside maps to None ----

pub fn order_status(code: i64) -> Option<OrderStatus> {
    use OrderStatus::*;
    Some(match code {
        0 => Unset,
        1 => OrderSent,
        2 => PendingOpen,
        3 => PendingChild,
        4 => Open,
        5 => PendingCancelReplace,
        6 => PendingCancel,
        7 => Filled,
        8 => Canceled,
        9 => Rejected,
        10 => PartiallyFilled,
        _ => return None,
    })
}

pub fn order_update_reason(code: i64) -> Option<OrderUpdateReason> {
    use OrderUpdateReason::*;
    Some(match code {
        0 => Unset,
        1 => OpenOrdersRequestResponse,
        2 => NewOrderAccepted,
        3 => GeneralOrderUpdate,
        4 => OrderFilled,
        5 => OrderFilledPartially,
        6 => OrderCanceled,
        7 => OrderCancelReplaceComplete,
        8 => NewOrderRejected,
        9 => OrderCancelRejected,
        10 => OrderCancelReplaceRejected,
        _ => return None,
    })
}

pub fn buy_sell(code: i64) -> Option<OrderSide> {
    match code {
        1 => Some(OrderSide::Buy),
        2 => Some(OrderSide::Sell),
        _ => None,
    }
}

/// Some gateways send "BUY"/"SELL" instead of 1/2.
pub fn buy_sell_text(s: &str) -> Option<OrderSide> {
    match s.trim().to_ascii_uppercase().as_str() {
        "BUY" | "B" => Some(OrderSide::Buy),
        "SELL" | "S" => Some(OrderSide::Sell),
        other => other.parse().ok().and_then(buy_sell),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn logon_request_always_subscribes_to_order_updates() {
        let bytes = encode(&LogonRequest::new("user", "pw", "dtc_bridge", 5)).unwrap();
        assert_eq!(bytes.last(), Some(&0u8));
        let v: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(v["Type"], 1);
        assert_eq!(v["ProtocolVersion"], 8);
        assert_eq!(v["Username"], "user");
        assert_eq!(v["HeartbeatIntervalInSeconds"], 5);
        assert_eq!(v["Integer_1"].as_u64().unwrap() & LOGON_FLAG_ORDER_UPDATES as u64, 0x2);
    }

    #[test]
    fn heartbeat_is_type_three() {
        let bytes = encode(&Heartbeat::now()).unwrap();
        let v: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(v["Type"], 3);
    }

    #[test]
    fn snapshot_requests_cover_positions_orders_balance() {
        let reqs = post_logon_requests(Some("Sim1"));
        let kinds: Vec<u16> = reqs.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![CURRENT_POSITIONS_REQUEST, OPEN_ORDERS_REQUEST, ACCOUNT_BALANCE_REQUEST]);
        assert!(reqs.iter().all(|r| r.trade_account == "Sim1"));
    }

    #[test]
    fn out_of_range_codes_are_none() {
        assert_eq!(order_status(7), Some(OrderStatus::Filled));
        assert_eq!(order_status(11), None);
        assert_eq!(order_status(-1), None);
        assert_eq!(order_update_reason(99), None);
        assert_eq!(buy_sell(0), None);
        assert_eq!(buy_sell_text("sell"), Some(OrderSide::Sell));
        assert_eq!(buy_sell_text("1"), Some(OrderSide::Buy));
        assert_eq!(buy_sell_text("short"), None);
    }
}
