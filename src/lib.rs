//! Sharded TLS WebSocket market-data ingestion fabric.
//!
//! Maintains many concurrent authenticated WebSocket subscriptions to a
//! broker quote feed, reconciles desired instrument tokens against
//! server-acknowledged subscription state per connection, and publishes the
//! latest traded price per instrument into a concurrently readable store.

pub mod auth;
pub mod config;
pub mod feed;

pub use config::FabricConfig;
pub use feed::{Ltp, LtpStore, ShardManager, ShardOptions, TickParser};
