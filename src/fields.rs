// ===============================
// src/fields.rs
// ===============================
//
// Server mengirim nama key berbeda untuk field yang sama (beda versi/deployment).
// Tabel di bawah = daftar kandidat per field logis, urut prioritas.
// resolve() = kandidat pertama yang ada dan tidak null menang.
// Murni, tidak tergantung tipe message.
//
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Type,
    Symbol,
    Account,
    OrderId,
    OrderStatus,
    UpdateReason,
    BuySell,
    OrderQty,
    FillQty,
    CumulativeQty,
    FillPrice,
    AvgFillPrice,
    OrderPrice,
    PositionQty,
    PositionAvgPrice,
    Cash,
    Timestamp,
    LogonResult,
    ResultText,
    TradePrice,
    Reason,
}

pub const FIELD_KEYS: &[(Field, &[&str])] = &[
    (Field::Type, &["Type", "type", "MessageType"]),
    (Field::Symbol, &["Symbol", "symbol", "Instrument", "SymbolName"]),
    (Field::Account, &["TradeAccount", "Account", "account", "AccountName"]),
    (Field::OrderId, &["ServerOrderID", "ClientOrderID", "OrderID", "OrderId"]),
    (Field::OrderStatus, &["OrderStatus", "Status"]),
    (Field::UpdateReason, &["OrderUpdateReason", "UpdateReason"]),
    (Field::BuySell, &["BuySell", "Side", "BuySellType"]),
    (Field::OrderQty, &["OrderQuantity", "Quantity", "Qty"]),
    (Field::FillQty, &["LastFillQuantity", "FillQuantity", "LastFillQty", "FillQty"]),
    (Field::CumulativeQty, &["FilledQuantity", "CumulativeFilledQuantity", "Filled"]),
    (Field::FillPrice, &["LastFillPrice", "FillPrice", "LastFillPx"]),
    (Field::AvgFillPrice, &["AverageFillPrice", "AvgFillPrice", "AvgPx"]),
    (Field::OrderPrice, &["Price1", "Price", "LimitPrice", "StopPrice"]),
    (Field::PositionQty, &["Quantity", "PositionQuantity", "NetPosition", "Qty"]),
    (Field::PositionAvgPrice, &["AveragePrice", "AvgPrice", "AveragePositionPrice", "PositionAveragePrice"]),
    (Field::Cash, &["CashBalance", "BalanceAvailableForNewPositions", "AccountValue", "NetLiquidatingValue"]),
    (Field::Timestamp, &["DateTime", "LatestTransactionDateTime", "Timestamp", "ts"]),
    (Field::LogonResult, &["Result", "LogonResult"]),
    (Field::ResultText, &["ResultText", "Text"]),
    (Field::TradePrice, &["Price", "LastTradePrice", "TradePrice"]),
    (Field::Reason, &["Reason", "ReasonText", "Text"]),
];

pub fn candidates(field: Field) -> &'static [&'static str] {
    FIELD_KEYS.iter().find(|(f, _)| *f == field).map(|(_, keys)| *keys).unwrap_or(&[])
}

/// First candidate key present with a non-null value.
pub fn resolve(map: &Map<String, Value>, field: Field) -> Option<&Value> {
    candidates(field).iter().filter_map(|k| map.get(*k)).find(|v| !v.is_null())
}

pub fn resolve_f64(map: &Map<String, Value>, field: Field) -> Option<f64> {
    resolve(map, field).and_then(as_f64)
}

pub fn resolve_i64(map: &Map<String, Value>, field: Field) -> Option<i64> {
    resolve(map, field).and_then(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Strings pass through, numbers are rendered (ids are sometimes numeric). Blank is absent.
pub fn resolve_string(map: &Map<String, Value>, field: Field) -> Option<String> {
    resolve(map, field).and_then(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn as_f64(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!("fixture must be an object"),
        }
    }

    #[test]
    fn every_field_has_candidates() {
        for (field, keys) in FIELD_KEYS {
            assert!(!keys.is_empty(), "{field:?}");
            assert_eq!(candidates(*field), *keys);
        }
    }

    #[test]
    fn priority_order_wins() {
        let m = obj(json!({"Qty": 3, "PositionQuantity": 2, "Quantity": 1}));
        assert_eq!(resolve_f64(&m, Field::PositionQty), Some(1.0));
        let m = obj(json!({"Qty": 3, "NetPosition": 2}));
        assert_eq!(resolve_f64(&m, Field::PositionQty), Some(2.0));
    }

    #[test]
    fn null_is_skipped() {
        let m = obj(json!({"TradeAccount": null, "Account": "Sim1"}));
        assert_eq!(resolve_string(&m, Field::Account).as_deref(), Some("Sim1"));
    }

    #[test]
    fn numeric_strings_and_ids() {
        let m = obj(json!({"LastFillPrice": "6750.25", "ServerOrderID": 42, "OrderStatus": "7"}));
        assert_eq!(resolve_f64(&m, Field::FillPrice), Some(6750.25));
        assert_eq!(resolve_string(&m, Field::OrderId).as_deref(), Some("42"));
        assert_eq!(resolve_i64(&m, Field::OrderStatus), Some(7));
    }

    #[test]
    fn missing_or_garbage_is_none() {
        let m = obj(json!({"CashBalance": "n/a", "Symbol": "  "}));
        assert_eq!(resolve_f64(&m, Field::Cash), None);
        assert_eq!(resolve_string(&m, Field::Symbol), None);
        assert_eq!(resolve_f64(&m, Field::FillPrice), None);
    }
}
