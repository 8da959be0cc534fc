//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Represents one client/backend pair for the lifetime of its relay task
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    /// Milliseconds after `start_time` of the most recent transfer
    last_activity_ms: AtomicU64,
}

/// Connection statistics for completed sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(session_id: String, client_addr: SocketAddr, backend_addr: SocketAddr) -> Self {
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, backend_addr
        );

        Self {
            session_id,
            client_addr,
            backend_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Fresh random session identifier
    pub fn generate_id() -> String {
        format!("relay_{}", Uuid::new_v4().simple())
    }

    /// Get bytes transferred upstream (client to backend)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get bytes transferred downstream (backend to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Get total bytes transferred
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    /// Get session duration
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Add bytes to upstream counter
    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    /// Add bytes to downstream counter
    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    /// Mark the session as active now
    pub fn touch(&self) {
        let now_ms = self.start_time.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Time since the last transfer in either direction
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start_time.elapsed().saturating_sub(last)
    }

    /// Generate connection statistics
    pub fn to_stats(&self) -> ConnectionStats {
        let duration = self.duration();

        ConnectionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            backend_addr: self.backend_addr,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            "Session {} completed: {} -> {} | Duration: {:?} | Up: {} bytes | Down: {} bytes | Total: {} bytes",
            self.session_id,
            self.client_addr,
            self.backend_addr,
            self.duration(),
            self.bytes_up(),
            self.bytes_down(),
            self.total_bytes(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RelaySession {
        RelaySession::new(
            "test_session".to_string(),
            "127.0.0.1:12345".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        )
    }

    #[test]
    fn test_counters_accumulate() {
        let session = session();
        assert_eq!(session.total_bytes(), 0);

        session.add_bytes_up(4);
        session.add_bytes_up(6);
        session.add_bytes_down(32);

        assert_eq!(session.bytes_up(), 10);
        assert_eq!(session.bytes_down(), 32);
        assert_eq!(session.total_bytes(), 42);

        let stats = session.to_stats();
        assert_eq!(
            stats,
            ConnectionStats {
                session_id: "test_session".to_string(),
                client_addr: "127.0.0.1:12345".parse().unwrap(),
                backend_addr: "127.0.0.1:8080".parse().unwrap(),
                duration_ms: stats.duration_ms,
                bytes_up: 10,
                bytes_down: 32,
                total_bytes: 42,
            }
        );
    }

    #[test]
    fn test_activity_resets_idle_time() {
        let session = session();
        std::thread::sleep(Duration::from_millis(30));
        assert!(session.idle_for() >= Duration::from_millis(30));

        session.add_bytes_down(1);
        assert!(session.idle_for() < Duration::from_millis(30));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = RelaySession::generate_id();
        let b = RelaySession::generate_id();
        assert!(a.starts_with("relay_"));
        assert_ne!(a, b);
    }
}
