//! Tolerant tick-frame parser.
//!
//! Broker feeds disagree on field names and wrapping, so extraction probes a
//! list of aliases and accepts numbers-as-strings. A frame that yields no
//! token or no price is rejected; everything else is best-effort.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::store::Ltp;

const TOKEN_KEYS: &[&str] = &["token", "symbol", "tradingsymbol", "instrument_token", "tokenID"];
const PRICE_KEYS: &[&str] = &["ltp", "last_price", "lastPrice", "price", "trade_price"];
const TS_KEYS: &[&str] = &["exchange_timestamp", "timestamp", "ts", "time", "epoch"];

/// Millisecond/second boundary: |v| at or above this is epoch milliseconds.
const MS_THRESHOLD: i64 = 1_000_000_000_000;

/// Stateless after construction; share one instance by reference across all
/// shards.
#[derive(Debug, Default)]
pub struct TickParser {
    strip_prefix: String,
}

impl TickParser {
    pub fn new(strip_prefix: impl Into<String>) -> Self {
        Self {
            strip_prefix: strip_prefix.into(),
        }
    }

    pub fn strip_prefix(&self) -> &str {
        &self.strip_prefix
    }

    /// Decode one JSON frame into an LTP, or `None` when the token or price
    /// is absent or untypable. Timestamp is optional and defaults to the
    /// Unix epoch.
    pub fn parse(&self, frame: &str) -> Option<Ltp> {
        let root: Value = serde_json::from_str(frame).ok()?;
        let payload = unwrap_payload(&root);

        let mut token = first_string(payload, TOKEN_KEYS)?;
        let price = first_number(payload, PRICE_KEYS)?;

        let ts = first_epoch(payload, TS_KEYS)
            .map(to_datetime)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        if !self.strip_prefix.is_empty() {
            if let Some(rest) = token.strip_prefix(&self.strip_prefix) {
                token = rest.to_string();
            }
        }

        Some(Ltp { token, price, ts })
    }
}

/// Feeds wrap ticks under `data` objects or arrays; unwrap one level of each.
fn unwrap_payload(root: &Value) -> &Value {
    let mut v = root;
    if let Some(first) = v.as_array().and_then(|a| a.first()) {
        v = first;
    }
    if let Some(data) = v.get("data") {
        if data.is_object() {
            v = data;
        } else if let Some(first) = data.as_array().and_then(|a| a.first()) {
            v = first;
        }
    }
    v
}

fn first_string(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn first_number(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(f) = s.trim().parse::<f64>() {
                    return Some(f);
                }
            }
            _ => {}
        }
    }
    None
}

fn first_epoch(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(key) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i);
                }
                if let Some(f) = n.as_f64() {
                    return Some(f as i64);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn to_datetime(epoch: i64) -> DateTime<Utc> {
    let dt = if epoch.abs() >= MS_THRESHOLD {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    };
    dt.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
