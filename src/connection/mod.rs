//! Connection Module
//!
//! The accept loop and the per-connection relay task.

pub mod backoff;
pub mod handler;
pub mod listener;

pub use handler::{handle_connection, RelayContext};
pub use listener::RelayListener;
