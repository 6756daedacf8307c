//! Sharded market-data ingestion pipeline.
//!
//! Per shard: transport (WS read loop) → frame ring → consumer → shared
//! LTP store, with a reconciler tracking desired vs server-acknowledged
//! subscriptions.

pub mod consumer;
pub mod parser;
pub mod reconcile;
pub mod ring;
pub mod sharder;
pub mod store;
pub mod transport;

pub use consumer::Consumer;
pub use parser::TickParser;
pub use reconcile::{SubscriptionMode, SubscriptionReconciler};
pub use ring::FrameRing;
pub use sharder::{ShardManager, ShardOptions};
pub use store::{Ltp, LtpStore};
pub use transport::{BackoffPolicy, TransportState, WsTransport, WsTransportOptions};
