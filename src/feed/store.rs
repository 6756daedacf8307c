//! Last-traded-price store shared by every shard's consumer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// One last-traded-price observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Ltp {
    /// Raw instrument token, venue prefix already stripped (e.g. `"26000"`).
    pub token: String,
    pub price: f64,
    /// Exchange wall-clock time; the Unix epoch when the frame carried none.
    pub ts: DateTime<Utc>,
}

/// Concurrent token → latest LTP map.
///
/// Many readers, many writers; writes per key are serialized by the lock and
/// the last upsert wins. Writers hold the lock only for a hash insert, so it
/// is never held across I/O.
#[derive(Debug, Default)]
pub struct LtpStore {
    map: RwLock<HashMap<String, Ltp>>,
}

impl LtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the whole record keyed by `ltp.token`.
    pub fn upsert(&self, ltp: Ltp) {
        self.map.write().insert(ltp.token.clone(), ltp);
    }

    pub fn get(&self, token: &str) -> Option<Ltp> {
        self.map.read().get(token).cloned()
    }

    /// Consistent point-in-time copy of the full map.
    pub fn snapshot(&self) -> HashMap<String, Ltp> {
        self.map.read().clone()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
