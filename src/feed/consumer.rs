//! Per-shard consumer: drains the frame ring, parses, publishes to the store.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::parser::TickParser;
use super::ring::FrameRing;
use super::store::{Ltp, LtpStore};

/// Optional per-tick hook invoked after the store upsert.
pub type LtpSink = Box<dyn Fn(&Ltp) + Send + Sync>;

/// Owns a worker thread that moves frames from one shard's ring into the
/// shared store. Never blocks on I/O; yields when the ring is empty.
pub struct Consumer {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    ring: Arc<FrameRing>,
    parser: Arc<TickParser>,
    store: Arc<LtpStore>,
    sink: RwLock<Option<LtpSink>>,
    running: AtomicBool,
}

impl Consumer {
    pub fn new(ring: Arc<FrameRing>, parser: Arc<TickParser>, store: Arc<LtpStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ring,
                parser,
                store,
                sink: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Install or replace the per-tick sink. Takes effect on the next frame.
    pub fn set_sink(&self, sink: LtpSink) {
        *self.inner.sink.write() = Some(sink);
    }

    /// Spawn the worker thread. Calling again while running is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let thread = thread::Builder::new()
            .name("tick-consumer".to_string())
            .spawn(move || inner.run())
            .expect("failed to spawn consumer thread");
        *handle = Some(thread);
        info!("consumer started");
    }

    /// Clear the run flag and join the worker. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.handle.lock().take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn run(&self) {
        while self.running.load(Ordering::Relaxed) {
            let Some(frame) = self.ring.try_pop() else {
                thread::yield_now();
                continue;
            };

            // Malformed frames are common upstream; drop without noise.
            let Some(ltp) = self.parser.parse(&frame) else {
                continue;
            };
            self.store.upsert(ltp.clone());

            let sink = self.sink.read();
            if let Some(sink) = sink.as_ref() {
                if catch_unwind(AssertUnwindSafe(|| sink(&ltp))).is_err() {
                    error!(token = %ltp.token, "ltp sink panicked; tick delivered to store only");
                }
            }
        }
        if !self.ring.is_empty() {
            warn!(queued = self.ring.len(), "consumer stopped with frames still queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    fn build() -> (Arc<FrameRing>, Arc<LtpStore>, Consumer) {
        let ring = Arc::new(FrameRing::with_capacity(64));
        let parser = Arc::new(TickParser::new(""));
        let store = Arc::new(LtpStore::new());
        let consumer = Consumer::new(ring.clone(), parser, store.clone());
        (ring, store, consumer)
    }

    #[test]
    fn frames_flow_into_store() {
        let (ring, store, consumer) = build();
        consumer.start();

        ring.try_push(r#"{"token":"26000","ltp":101.5}"#.to_string());
        ring.try_push(r#"{"token":"26000","ltp":103.0}"#.to_string());
        ring.try_push(r#"{"token":"26001","ltp":202.25}"#.to_string());

        assert!(wait_until(Duration::from_millis(500), || store.len() == 2));
        assert_eq!(store.get("26000").unwrap().price, 103.0);
        assert_eq!(store.get("26001").unwrap().price, 202.25);
        consumer.stop();
    }

    #[test]
    fn malformed_frames_skipped() {
        let (ring, store, consumer) = build();
        consumer.start();

        ring.try_push("garbage".to_string());
        ring.try_push(r#"{"no":"fields"}"#.to_string());
        ring.try_push(r#"{"token":"26000","ltp":7.0}"#.to_string());

        assert!(wait_until(Duration::from_millis(500), || store.len() == 1));
        assert_eq!(store.get("26000").unwrap().price, 7.0);
        consumer.stop();
    }

    #[test]
    fn sink_receives_each_tick() {
        let (ring, store, consumer) = build();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_sink = seen.clone();
        consumer.set_sink(Box::new(move |_| {
            seen_sink.fetch_add(1, Ordering::SeqCst);
        }));
        consumer.start();

        for i in 0..10 {
            ring.try_push(format!(r#"{{"token":"2600{i}","ltp":{i}.5}}"#));
        }

        assert!(wait_until(Duration::from_millis(500), || {
            seen.load(Ordering::SeqCst) == 10
        }));
        assert_eq!(store.len(), 10);
        consumer.stop();
    }

    #[test]
    fn sink_panic_does_not_kill_worker() {
        let (ring, store, consumer) = build();
        consumer.set_sink(Box::new(|ltp| {
            if ltp.token == "bad" {
                panic!("sink blew up");
            }
        }));
        consumer.start();

        ring.try_push(r#"{"token":"bad","ltp":1.0}"#.to_string());
        ring.try_push(r#"{"token":"26000","ltp":2.0}"#.to_string());

        assert!(wait_until(Duration::from_millis(500), || store.len() == 2));
        assert_eq!(store.get("26000").unwrap().price, 2.0);
        consumer.stop();
    }

    #[test]
    fn start_is_idempotent_and_stop_joins() {
        let (_ring, _store, consumer) = build();
        consumer.start();
        consumer.start();
        assert!(consumer.is_running());
        consumer.stop();
        assert!(!consumer.is_running());
        consumer.stop();
    }
}
