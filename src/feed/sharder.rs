//! Shard manager: partitions the desired token universe across WebSocket
//! connections and owns one full pipeline per shard.
//!
//! Worker stack per shard: reconciler → transport → frame ring → consumer →
//! shared store. Workers never refer back to the manager; the resubscribe
//! hook only reaches its sibling reconciler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::consumer::Consumer;
use super::parser::TickParser;
use super::reconcile::{SubscriptionMode, SubscriptionReconciler};
use super::ring::FrameRing;
use super::store::LtpStore;
use super::transport::{WsTransport, WsTransportOptions};

const DEFAULT_MAX_TOKENS_PER_CONN: usize = 800;
const SHARD_RING_CAPACITY: usize = 8192;

/// Fabric-wide options.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub wss_url: String,
    /// Shard size per connection; 0 falls back to 800.
    pub max_tokens_per_conn: usize,
    /// Tokens per subscribe payload.
    pub subscribe_batch_size: usize,
    pub verify_peer: bool,
    pub ca_file: Option<PathBuf>,
    /// Venue prefix applied to tokens on egress (e.g. `"nse_cm|"`).
    pub token_prefix: String,
    /// Handshake headers common to every shard.
    pub headers: HashMap<String, String>,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            wss_url: String::new(),
            max_tokens_per_conn: DEFAULT_MAX_TOKENS_PER_CONN,
            subscribe_batch_size: 100,
            verify_peer: true,
            ca_file: None,
            token_prefix: String::new(),
            headers: HashMap::new(),
        }
    }
}

/// One shard's pipeline. Owned exclusively by the manager.
struct Worker {
    transport: WsTransport,
    reconciler: Arc<SubscriptionReconciler>,
    ring: Arc<FrameRing>,
    consumer: Consumer,
    tokens: Vec<String>,
}

struct ManagerState {
    desired_tokens: Vec<String>,
    auth_header: Option<String>,
    common_headers: HashMap<String, String>,
    workers: Vec<Worker>,
}

/// Builds, owns, and routes control to the per-connection worker stacks.
///
/// Sharding is static within a run: `set_tokens` while running is accepted
/// but takes effect on the next `stop()` / `start()`.
pub struct ShardManager {
    parser: Arc<TickParser>,
    store: Arc<LtpStore>,
    opts: ShardOptions,
    state: Mutex<ManagerState>,
    running: AtomicBool,
}

impl ShardManager {
    pub fn new(parser: Arc<TickParser>, store: Arc<LtpStore>, opts: ShardOptions) -> Self {
        Self {
            parser,
            store,
            state: Mutex::new(ManagerState {
                desired_tokens: Vec::new(),
                auth_header: opts.headers.get("Authorization").cloned(),
                common_headers: opts.headers.clone(),
                workers: Vec::new(),
            }),
            opts,
            running: AtomicBool::new(false),
        }
    }

    /// Replace the desired token universe (raw tokens, e.g. `"26000"`).
    pub fn set_tokens(&self, tokens: Vec<String>) {
        let mut state = self.state.lock();
        state.desired_tokens = tokens;
        if self.running.load(Ordering::SeqCst) {
            warn!("set_tokens while running: new partition applies on next start()");
        }
    }

    /// Provide or rotate the Authorization header value, e.g.
    /// `"Bearer <jwt>"`. Live transports pick it up on their next reconnect.
    pub fn set_access_token(&self, auth_header_value: impl Into<String>) {
        let mut state = self.state.lock();
        state.auth_header = Some(auth_header_value.into());
        let merged = merged_headers(&state.common_headers, &state.auth_header);
        for worker in &state.workers {
            worker.transport.set_headers(merged.clone());
        }
    }

    /// Replace the common handshake headers (merged with the auth header).
    pub fn set_common_headers(&self, headers: HashMap<String, String>) {
        let mut state = self.state.lock();
        state.common_headers = headers;
        let merged = merged_headers(&state.common_headers, &state.auth_header);
        for worker in &state.workers {
            worker.transport.set_headers(merged.clone());
        }
    }

    /// Build the worker fleet, start consumers, then transports, then issue
    /// the initial subscribe round. A second call while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.build_workers(&mut state)?;

        // Consumers first so queues drain from the first frame.
        for worker in &state.workers {
            worker.consumer.start();
        }
        for worker in &state.workers {
            worker.transport.start();
        }

        // Initial subscribe round; the resubscribe hook reissues the same
        // payloads on every connect.
        for worker in &state.workers {
            for payload in worker.reconciler.build_subscribe_batches() {
                if !worker.transport.send_text(&payload) {
                    debug!("initial subscribe deferred until transport connects");
                }
            }
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            workers = state.workers.len(),
            tokens = state.desired_tokens.len(),
            "shard manager started"
        );
        Ok(())
    }

    /// Stop transports first (no new frames), then consumers, then drop the
    /// worker stacks. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        for worker in &state.workers {
            worker.transport.stop();
        }
        for worker in &state.workers {
            worker.consumer.stop();
        }
        for worker in &state.workers {
            if !worker.ring.is_empty() {
                debug!(
                    queued = worker.ring.len(),
                    "discarding shard ring with undrained frames"
                );
            }
        }
        state.workers.clear();
        self.running.store(false, Ordering::SeqCst);
        info!("shard manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn desired_tokens_snapshot(&self) -> Vec<String> {
        self.state.lock().desired_tokens.clone()
    }

    /// Tokens seeded into each worker's reconciler, in shard order.
    pub fn worker_tokens(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .workers
            .iter()
            .map(|w| w.tokens.clone())
            .collect()
    }

    /// Send `payload` on every currently connected transport; true iff at
    /// least one send succeeded.
    pub fn debug_broadcast_text(&self, payload: &str) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.lock();
        let mut any = false;
        for worker in &state.workers {
            any |= worker.transport.send_text(payload);
        }
        any
    }

    fn build_workers(&self, state: &mut ManagerState) -> Result<()> {
        state.workers.clear();

        let mut shards = partition(&state.desired_tokens, self.opts.max_tokens_per_conn);
        if shards.is_empty() {
            // One idle worker keeps the lifecycle functional with no tokens.
            shards.push(Vec::new());
        }

        let merged = merged_headers(&state.common_headers, &state.auth_header);

        for tokens in shards {
            let prefix = self.opts.token_prefix.clone();
            let formatter = if prefix.is_empty() {
                None
            } else {
                Some(Box::new(move |t: &str| format!("{prefix}{t}"))
                    as Box<dyn Fn(&str) -> String + Send + Sync>)
            };
            let reconciler = Arc::new(SubscriptionReconciler::new(
                SubscriptionMode::Ltp,
                self.opts.subscribe_batch_size,
                formatter,
            ));
            if !tokens.is_empty() {
                reconciler.add_many(&tokens);
            }

            let ring = Arc::new(FrameRing::with_capacity(SHARD_RING_CAPACITY));
            let consumer = Consumer::new(ring.clone(), self.parser.clone(), self.store.clone());

            let transport = WsTransport::new(
                self.opts.wss_url.clone(),
                WsTransportOptions {
                    verify_peer: self.opts.verify_peer,
                    ca_file: self.opts.ca_file.clone(),
                    headers: merged.clone(),
                    ..Default::default()
                },
            )?;

            transport.on_state(Arc::new(|s| {
                info!(state = s, "shard ws state");
            }));

            let ring_sink = ring.clone();
            transport.on_message(Arc::new(move |frame| {
                if !ring_sink.try_push(frame) {
                    warn!("ingest ring full: dropped frame");
                }
            }));

            let resub = reconciler.clone();
            transport.on_resubscribe(Arc::new(move |t: &WsTransport| {
                for payload in resub.build_subscribe_batches() {
                    t.send_text(&payload);
                }
            }));

            state.workers.push(Worker {
                transport,
                reconciler,
                ring,
                consumer,
                tokens,
            });
        }
        Ok(())
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Contiguous chunks of at most `max_per_conn` tokens.
fn partition(tokens: &[String], max_per_conn: usize) -> Vec<Vec<String>> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let per_conn = if max_per_conn == 0 {
        DEFAULT_MAX_TOKENS_PER_CONN
    } else {
        max_per_conn
    };
    tokens.chunks(per_conn).map(|c| c.to_vec()).collect()
}

fn merged_headers(
    common: &HashMap<String, String>,
    auth: &Option<String>,
) -> HashMap<String, String> {
    let mut merged = common.clone();
    if let Some(auth) = auth {
        if !auth.is_empty() {
            merged.insert("Authorization".to_string(), auth.clone());
        }
    }
    merged
}
