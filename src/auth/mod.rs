//! Broker authentication: TOTP generation and the login/refresh HTTP flow
//! that yields the bearer credential consumed by the shard manager.

pub mod session;
pub mod totp;

pub use session::{AuthClient, SessionTokens};
pub use totp::{Totp, TotpAlgorithm};
