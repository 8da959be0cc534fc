//! delayrelay Library
//!
//! A TCP relay that waits a fixed interval before dialing its backend, then
//! relays bytes in both directions. Used to simulate a slow-to-connect
//! intermediary when exercising client timeouts, retries and latency
//! tolerance.

pub mod config;
pub mod connection;
pub mod relay;
pub mod resource;
pub mod shutdown;

pub use config::Config;
pub use connection::RelayListener;
pub use resource::ResourceManager;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
