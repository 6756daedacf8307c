//! Differential subscription state: what the caller wants vs what the server
//! has acknowledged.
//!
//! Keeping intent (`desired`) apart from server truth (`active`) makes
//! reconnects cheap: a fresh connection starts with `active` empty, so the
//! subscribe builders naturally reissue the whole intent.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::json;

const DEFAULT_BATCH_SIZE: usize = 100;

/// Subscription depth requested from the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionMode {
    #[default]
    Ltp,
    Quote,
    Full,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }
}

/// Egress token formatter, e.g. prepending a venue prefix.
pub type TokenFormatter = Box<dyn Fn(&str) -> String + Send + Sync>;

struct State {
    desired: HashSet<String>,
    active: HashSet<String>,
    mode: SubscriptionMode,
    batch_size: usize,
}

/// Thread-safe desired/active set machine emitting batched
/// subscribe/unsubscribe payloads.
///
/// Builders never commit membership changes to `active`; only
/// `mark_subscribed` / `mark_unsubscribed` do, so building twice without an
/// intervening ACK yields payloads for the same tokens.
pub struct SubscriptionReconciler {
    state: Mutex<State>,
    formatter: Option<TokenFormatter>,
}

impl SubscriptionReconciler {
    /// `batch_size` of 0 is coerced to 100. `formatter` defaults to identity.
    pub fn new(
        mode: SubscriptionMode,
        batch_size: usize,
        formatter: Option<TokenFormatter>,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                desired: HashSet::new(),
                active: HashSet::new(),
                mode,
                batch_size: coerce_batch(batch_size),
            }),
            formatter,
        }
    }

    pub fn add(&self, token: &str) {
        self.state.lock().desired.insert(token.to_string());
    }

    pub fn add_many(&self, tokens: &[String]) {
        let mut state = self.state.lock();
        for t in tokens {
            state.desired.insert(t.clone());
        }
    }

    pub fn remove(&self, token: &str) {
        self.state.lock().desired.remove(token);
    }

    pub fn clear(&self) {
        self.state.lock().desired.clear();
    }

    pub fn set_mode(&self, mode: SubscriptionMode) {
        self.state.lock().mode = mode;
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        self.state.lock().batch_size = coerce_batch(batch_size);
    }

    /// Record server acknowledgement of subscriptions.
    pub fn mark_subscribed(&self, tokens: &[String]) {
        let mut state = self.state.lock();
        for t in tokens {
            state.active.insert(t.clone());
        }
    }

    /// Record server acknowledgement of unsubscriptions.
    pub fn mark_unsubscribed(&self, tokens: &[String]) {
        let mut state = self.state.lock();
        for t in tokens {
            state.active.remove(t);
        }
    }

    /// One JSON payload per batch of ≤ batch_size tokens from
    /// desired ∖ active. Empty diff ⇒ empty vec.
    pub fn build_subscribe_batches(&self) -> Vec<String> {
        let (need, mode, batch_size) = {
            let state = self.state.lock();
            let need: Vec<String> = state
                .desired
                .iter()
                .filter(|t| !state.active.contains(*t))
                .cloned()
                .collect();
            (need, state.mode, state.batch_size)
        };
        self.build_payloads(&need, mode, batch_size, "subscribe")
    }

    /// Symmetric over active ∖ desired.
    pub fn build_unsubscribe_batches(&self) -> Vec<String> {
        let (drop, mode, batch_size) = {
            let state = self.state.lock();
            let drop: Vec<String> = state
                .active
                .iter()
                .filter(|t| !state.desired.contains(*t))
                .cloned()
                .collect();
            (drop, state.mode, state.batch_size)
        };
        self.build_payloads(&drop, mode, batch_size, "unsubscribe")
    }

    pub fn desired_snapshot(&self) -> Vec<String> {
        self.state.lock().desired.iter().cloned().collect()
    }

    pub fn active_snapshot(&self) -> Vec<String> {
        self.state.lock().active.iter().cloned().collect()
    }

    fn build_payloads(
        &self,
        tokens: &[String],
        mode: SubscriptionMode,
        batch_size: usize,
        action: &str,
    ) -> Vec<String> {
        tokens
            .chunks(batch_size)
            .map(|batch| {
                let formatted: Vec<String> = batch.iter().map(|t| self.fmt(t)).collect();
                json!({
                    "action": action,
                    "mode": mode.as_str(),
                    "tokens": formatted,
                })
                .to_string()
            })
            .collect()
    }

    fn fmt(&self, token: &str) -> String {
        match &self.formatter {
            Some(f) => f(token),
            None => token.to_string(),
        }
    }
}

fn coerce_batch(batch_size: usize) -> usize {
    if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn payload_tokens(payload: &str) -> Vec<String> {
        let v: serde_json::Value = serde_json::from_str(payload).unwrap();
        v["tokens"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t.as_str().unwrap().to_string())
            .collect()
    }

    fn all_tokens(payloads: &[String]) -> HashSet<String> {
        payloads.iter().flat_map(|p| payload_tokens(p)).collect()
    }

    fn prefixed() -> SubscriptionReconciler {
        SubscriptionReconciler::new(
            SubscriptionMode::Ltp,
            2,
            Some(Box::new(|t| format!("nse_cm|{t}"))),
        )
    }

    #[test]
    fn batching_respects_size_and_covers_diff() {
        let rec = prefixed();
        rec.add_many(&["A".into(), "B".into(), "C".into()]);

        let payloads = rec.build_subscribe_batches();
        assert_eq!(payloads.len(), 2);
        for p in &payloads {
            let v: serde_json::Value = serde_json::from_str(p).unwrap();
            assert_eq!(v["action"], "subscribe");
            assert_eq!(v["mode"], "ltp");
            assert!(payload_tokens(p).len() <= 2);
        }
        let union = all_tokens(&payloads);
        let expected: HashSet<String> =
            ["nse_cm|A", "nse_cm|B", "nse_cm|C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(union, expected);
    }

    #[test]
    fn builders_are_idempotent_without_acks() {
        let rec = prefixed();
        rec.add_many(&["A".into(), "B".into(), "C".into()]);

        let first = all_tokens(&rec.build_subscribe_batches());
        let second = all_tokens(&rec.build_subscribe_batches());
        assert_eq!(first, second);
    }

    #[test]
    fn convergence_after_acks() {
        let rec = prefixed();
        rec.add_many(&["A".into(), "B".into(), "C".into()]);
        rec.mark_subscribed(&["A".into(), "B".into()]);

        let payloads = rec.build_subscribe_batches();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payload_tokens(&payloads[0]), vec!["nse_cm|C".to_string()]);

        rec.remove("A");
        let unsub = rec.build_unsubscribe_batches();
        assert_eq!(unsub.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&unsub[0]).unwrap();
        assert_eq!(v["action"], "unsubscribe");
        assert_eq!(payload_tokens(&unsub[0]), vec!["nse_cm|A".to_string()]);
    }

    #[test]
    fn empty_diffs_build_nothing() {
        let rec = prefixed();
        assert!(rec.build_subscribe_batches().is_empty());
        assert!(rec.build_unsubscribe_batches().is_empty());

        rec.add("A");
        rec.mark_subscribed(&["A".into()]);
        assert!(rec.build_subscribe_batches().is_empty());
        assert!(rec.build_unsubscribe_batches().is_empty());
    }

    #[test]
    fn zero_batch_size_coerced_to_default() {
        let rec = SubscriptionReconciler::new(SubscriptionMode::Ltp, 0, None);
        let tokens: Vec<String> = (0..150).map(|i| i.to_string()).collect();
        rec.add_many(&tokens);

        let payloads = rec.build_subscribe_batches();
        assert_eq!(payloads.len(), 2);
        assert_eq!(all_tokens(&payloads).len(), 150);
    }

    #[test]
    fn identity_formatter_by_default() {
        let rec = SubscriptionReconciler::new(SubscriptionMode::Quote, 10, None);
        rec.add("26000");
        let payloads = rec.build_subscribe_batches();
        let v: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(v["mode"], "quote");
        assert_eq!(payload_tokens(&payloads[0]), vec!["26000".to_string()]);
    }

    #[test]
    fn reconnect_reset_reissues_full_intent() {
        let rec = prefixed();
        rec.add_many(&["A".into(), "B".into(), "C".into()]);
        rec.mark_subscribed(&["A".into(), "B".into(), "C".into()]);
        assert!(rec.build_subscribe_batches().is_empty());

        // Fresh connection: server forgot everything.
        rec.mark_unsubscribed(&rec.active_snapshot());
        let union = all_tokens(&rec.build_subscribe_batches());
        assert_eq!(union.len(), 3);
    }

    #[test]
    fn mode_strings() {
        assert_eq!(SubscriptionMode::Ltp.as_str(), "ltp");
        assert_eq!(SubscriptionMode::Quote.as_str(), "quote");
        assert_eq!(SubscriptionMode::Full.as_str(), "full");
    }
}
