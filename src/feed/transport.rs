//! TLS WebSocket transport with reconnect and resubscribe hooks.
//!
//! Each transport owns one OS thread running a current-thread tokio runtime;
//! that thread is the sole producer of inbound frames for its shard. Control
//! plane threads talk to the live connection through an outbound channel, so
//! `send_text` never touches the socket directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How often the session loop polls the run flag.
const CONTROL_TICK: Duration = Duration::from_millis(200);

/// Connection lifecycle options.
#[derive(Debug, Clone)]
pub struct WsTransportOptions {
    /// Application keepalive cadence; a ping unanswered by the next tick is
    /// treated as a read error.
    pub ping_interval: Duration,
    /// TCP + TLS + upgrade deadline per attempt.
    pub conn_timeout: Duration,
    pub verify_peer: bool,
    /// Extra root certificate appended to the system trust store.
    pub ca_file: Option<PathBuf>,
    /// Handshake headers applied to every connect attempt.
    pub headers: HashMap<String, String>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WsTransportOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            conn_timeout: Duration::from_secs(10),
            verify_peer: true,
            ca_file: None,
            headers: HashMap::new(),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
        }
    }
}

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    /// Delay to sleep before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempt += 1;
        delay
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(&'static str) + Send + Sync>;
pub type ResubscribeCallback = Arc<dyn Fn(&WsTransport) + Send + Sync>;

struct Inner {
    url: String,
    opts: WsTransportOptions,
    headers: RwLock<HashMap<String, String>>,
    state: RwLock<TransportState>,
    connected: AtomicBool,
    running: AtomicBool,
    on_message: RwLock<Option<MessageCallback>>,
    on_state: RwLock<Option<StateCallback>>,
    on_resubscribe: RwLock<Option<ResubscribeCallback>>,
    /// Sender into the live session's write half; replaced on each connect.
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// One `wss://` connection with automatic reconnect.
///
/// `start()` spawns the IO thread and returns immediately; callbacks fire on
/// that thread. `stop()` requests a graceful close and joins. Starting again
/// after `stop()` is unsupported.
pub struct WsTransport {
    inner: Arc<Inner>,
    owner: bool,
}

impl WsTransport {
    /// Rejects anything but a `wss://` URL.
    pub fn new(wss_url: impl Into<String>, opts: WsTransportOptions) -> Result<Self> {
        let url = wss_url.into();
        if !url.starts_with("wss://") {
            bail!("transport requires a wss:// url, got {url:?}");
        }
        let headers = opts.headers.clone();
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                opts,
                headers: RwLock::new(headers),
                state: RwLock::new(TransportState::Idle),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                on_message: RwLock::new(None),
                on_state: RwLock::new(None),
                on_resubscribe: RwLock::new(None),
                outbound: RwLock::new(None),
                handle: Mutex::new(None),
            }),
            owner: true,
        })
    }

    pub fn on_message(&self, cb: MessageCallback) {
        *self.inner.on_message.write() = Some(cb);
    }

    pub fn on_state(&self, cb: StateCallback) {
        *self.inner.on_state.write() = Some(cb);
    }

    /// Invoked from the IO thread after every successful connect, initial
    /// and reconnect alike, before the read loop starts.
    pub fn on_resubscribe(&self, cb: ResubscribeCallback) {
        *self.inner.on_resubscribe.write() = Some(cb);
    }

    /// Replace the handshake header map; the next connect attempt uses it.
    pub fn set_headers(&self, headers: HashMap<String, String>) {
        *self.inner.headers.write() = headers;
    }

    /// Spawn the IO thread. A second call while running is a no-op.
    pub fn start(&self) {
        let mut handle = self.inner.handle.lock();
        if handle.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let thread = thread::Builder::new()
            .name("ws-transport".to_string())
            .spawn(move || io_loop(inner))
            .expect("failed to spawn transport io thread");
        *handle = Some(thread);
        info!(url = %self.inner.url, "transport started");
    }

    /// Request termination, close the socket gracefully, join the IO thread.
    /// Idempotent and callable from any thread but the IO thread itself.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.inner.outbound.read().clone() {
            let _ = tx.send(Message::Close(None));
        }
        if let Some(thread) = self.inner.handle.lock().take() {
            let _ = thread.join();
        }
    }

    /// Queue a text frame. `false` unless currently connected.
    pub fn send_text(&self, payload: &str) -> bool {
        self.send(Message::Text(payload.to_string()))
    }

    /// Queue a binary frame. `false` unless currently connected.
    pub fn send_binary(&self, bytes: &[u8]) -> bool {
        self.send(Message::Binary(bytes.to_vec()))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.read()
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    fn send(&self, msg: Message) -> bool {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return false;
        }
        match self.inner.outbound.read().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if self.owner {
            self.stop();
        }
    }
}

fn io_loop(inner: Arc<Inner>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create transport runtime");

    // Handle passed to the resubscribe hook; non-owning so dropping it does
    // not stop this thread.
    let handle = WsTransport {
        inner: inner.clone(),
        owner: false,
    };

    let mut backoff = BackoffPolicy::new(inner.opts.backoff_initial, inner.opts.backoff_max);

    while inner.running.load(Ordering::SeqCst) {
        inner.transition(TransportState::Connecting);

        match rt.block_on(inner.establish()) {
            Ok(ws) => {
                backoff.reset();
                let session = rt.block_on(inner.stream_session(ws, &handle));
                inner.connected.store(false, Ordering::SeqCst);
                *inner.outbound.write() = None;
                match session {
                    Ok(()) => break,
                    Err(e) => warn!(url = %inner.url, error = %e, "ws session ended"),
                }
            }
            Err(e) => warn!(url = %inner.url, error = %e, "ws connect failed"),
        }

        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        inner.transition(TransportState::Reconnecting);
        let delay = backoff.next_delay();
        debug!(
            url = %inner.url,
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempt(),
            "reconnect backoff"
        );
        sleep_while_running(&inner.running, delay);
    }

    inner.connected.store(false, Ordering::SeqCst);
    *inner.outbound.write() = None;
    inner.transition(TransportState::Closed);
}

/// Backoff sleep that aborts promptly when stop is requested.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let mut remaining = total;
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        let chunk = remaining.min(Duration::from_millis(50));
        thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}

impl Inner {
    fn transition(&self, next: TransportState) {
        *self.state.write() = next;
        debug!(url = %self.url, state = %next, "transport state");
        let cb = self.on_state.read().clone();
        if let Some(cb) = cb {
            cb(next.as_str());
        }
    }

    fn dispatch_message(&self, frame: String) {
        let cb = self.on_message.read().clone();
        if let Some(cb) = cb {
            cb(frame);
        }
    }

    async fn establish(&self) -> Result<WsStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("failed to build websocket request")?;

        for (name, value) in self.headers.read().iter() {
            let Ok(name) = name.parse::<HeaderName>() else {
                warn!(header = %name, "skipping invalid handshake header name");
                continue;
            };
            let Ok(value) = value.parse::<HeaderValue>() else {
                warn!(header = %name, "skipping invalid handshake header value");
                continue;
            };
            request.headers_mut().insert(name, value);
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(16 * 1024 * 1024),
            max_frame_size: Some(4 * 1024 * 1024),
            ..Default::default()
        };

        let connect = connect_async_tls_with_config(
            request,
            Some(ws_config),
            false,
            Some(self.tls_connector()?),
        );
        let (stream, response) = timeout(self.opts.conn_timeout, connect)
            .await
            .map_err(|_| anyhow!("connect timeout after {:?}", self.opts.conn_timeout))?
            .context("websocket connect failed")?;

        debug!(url = %self.url, status = %response.status(), "websocket upgrade complete");
        Ok(stream)
    }

    fn tls_connector(&self) -> Result<Connector> {
        let mut builder = native_tls::TlsConnector::builder();
        if !self.opts.verify_peer {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        if let Some(path) = &self.opts.ca_file {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read ca file {}", path.display()))?;
            let cert = native_tls::Certificate::from_pem(&pem)
                .with_context(|| format!("invalid ca certificate {}", path.display()))?;
            builder.add_root_certificate(cert);
        }
        let connector = builder.build().context("failed to build tls connector")?;
        Ok(Connector::NativeTls(connector))
    }

    /// Run one connected session until error or shutdown. `Ok(())` means a
    /// requested stop; any `Err` sends the state machine to Reconnecting.
    async fn stream_session(&self, ws: WsStream, handle: &WsTransport) -> Result<()> {
        let (mut write, mut read) = ws.split();

        let (tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.write() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        self.transition(TransportState::Connected);

        // Reissue subscriptions before any frame of the new session is read.
        // The hook's sends land on the outbound channel and flush below.
        {
            let cb = self.on_resubscribe.read().clone();
            if let Some(cb) = cb {
                cb(handle);
            }
        }

        let mut ping = interval_at(
            Instant::now() + self.opts.ping_interval,
            self.opts.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut control = interval(CONTROL_TICK);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = control.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = ping.tick() => {
                    if awaiting_pong {
                        return Err(anyhow!(
                            "no pong within {:?}", self.opts.ping_interval
                        ));
                    }
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("ping send failed")?;
                    awaiting_pong = true;
                }
                out = out_rx.recv() => {
                    if let Some(msg) = out {
                        write.send(msg).await.context("outbound send failed")?;
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch_message(text),
                        Some(Ok(Message::Binary(data))) => {
                            self.dispatch_message(String::from_utf8_lossy(&data).into_owned());
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = false;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(anyhow!("server closed connection: {frame:?}"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(anyhow!(e)).context("ws read error"),
                        None => return Err(anyhow!("ws stream ended")),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_wss_url() {
        assert!(WsTransport::new("ws://example.com/feed", Default::default()).is_err());
        assert!(WsTransport::new("https://example.com", Default::default()).is_err());
        assert!(WsTransport::new("wss://example.com/feed", Default::default()).is_ok());
    }

    #[test]
    fn initial_state_is_idle_and_sends_fail() {
        let t = WsTransport::new("wss://example.com/feed", Default::default()).unwrap();
        assert_eq!(t.state(), TransportState::Idle);
        assert!(!t.is_connected());
        assert!(!t.send_text("{}"));
        assert!(!t.send_binary(b"\x00"));
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut backoff =
            BackoffPolicy::new(Duration::from_millis(500), Duration::from_millis(5000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5000));
        assert_eq!(backoff.attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn headers_replaceable_before_reconnect() {
        let t = WsTransport::new("wss://example.com/feed", Default::default()).unwrap();
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        t.set_headers(headers.clone());
        assert_eq!(
            t.inner.headers.read().get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
    }

    #[test]
    fn stop_without_start_is_safe() {
        let t = WsTransport::new("wss://example.com/feed", Default::default()).unwrap();
        t.stop();
        t.stop();
        assert_eq!(t.state(), TransportState::Idle);
    }

    #[test]
    fn unreachable_endpoint_cycles_to_reconnecting_and_stops() {
        let opts = WsTransportOptions {
            conn_timeout: Duration::from_millis(300),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(200),
            ..Default::default()
        };
        // Nothing listens on this port; connect fails fast.
        let t = WsTransport::new("wss://127.0.0.1:9/feed", opts).unwrap();

        let states: Arc<parking_lot::Mutex<Vec<&'static str>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let states_cb = states.clone();
        t.on_state(Arc::new(move |s| states_cb.lock().push(s)));

        t.start();
        t.start();
        std::thread::sleep(Duration::from_millis(600));
        t.stop();

        let seen = states.lock().clone();
        assert!(seen.contains(&"connecting"));
        assert!(seen.contains(&"reconnecting"));
        assert_eq!(seen.last(), Some(&"closed"));
        assert!(!t.is_connected());
    }
}
