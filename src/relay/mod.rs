//! Data Relay Module
//!
//! Backend dialing and bidirectional data relay between client and backend.

pub mod engine;
pub mod session;

pub use engine::{copy_half, Direction, RelayEngine};
pub use session::{ConnectionStats, RelaySession};
