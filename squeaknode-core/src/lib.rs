//! # squeaknode-core
//!
//! Node library for the squeak protocol: durable storage, the peer-to-peer
//! network layer, the Bitcoin and Lightning adapters, and the paid-unlock
//! exchange engine, all orchestrated by [`controller::SqueakController`].

pub mod bitcoin_client;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod exchange;
pub mod lightning_client;
pub mod network;
pub mod peer;
pub mod store;
pub mod types;
pub mod worker;

pub use config::Config;
pub use controller::SqueakController;
pub use error::{NodeError, Result};
pub use store::SqueakStore;

/// Milliseconds since the unix epoch. The store's clock for
/// `created_time_ms` and `liked_time_ms` columns.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Seconds since the unix epoch, for invoice timestamps and wire messages.
pub fn now_s() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
