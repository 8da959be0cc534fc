//! Resource Management
//!
//! Admission control for relay tasks. With `max_connections = 0` every
//! connection is admitted; otherwise a semaphore caps concurrent relays and
//! connections over the cap are turned away.

use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Resource manager that tracks and enforces the relay limit
pub struct ResourceManager {
    max_connections: usize,
    /// `None` when unlimited
    connection_semaphore: Option<Arc<Semaphore>>,
    active_connections: Arc<AtomicUsize>,
    stats: ResourceStats,
}

/// Resource usage statistics
#[derive(Debug, Default)]
struct ResourceStats {
    peak_connections: AtomicUsize,
    total_connections_accepted: AtomicUsize,
    total_connections_rejected: AtomicUsize,
}

/// Snapshot of resource usage for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUsageStats {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_connections_accepted: usize,
    pub total_connections_rejected: usize,
    pub max_connections: usize,
}

impl ResourceManager {
    /// Create a new resource manager; `0` means no limit
    pub fn new(max_connections: usize) -> Self {
        let connection_semaphore = if max_connections > 0 {
            Some(Arc::new(Semaphore::new(max_connections)))
        } else {
            None
        };

        Self {
            max_connections,
            connection_semaphore,
            active_connections: Arc::new(AtomicUsize::new(0)),
            stats: ResourceStats::default(),
        }
    }

    /// Try to acquire a connection slot without waiting
    pub fn acquire_connection_slot(&self) -> Result<ConnectionSlot> {
        let permit = match &self.connection_semaphore {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats
                        .total_connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Connection limit reached ({}), rejecting connection",
                        self.max_connections
                    );
                    return Err(anyhow::anyhow!("Connection limit reached"));
                }
            },
            None => None,
        };

        self.stats
            .total_connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        let current = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats
            .peak_connections
            .fetch_max(current, Ordering::Relaxed);

        debug!("Acquired connection slot, active connections: {}", current);
        Ok(ConnectionSlot {
            _permit: permit,
            active_connections: Arc::clone(&self.active_connections),
        })
    }

    /// Number of relay tasks currently holding a slot
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get current resource usage statistics
    pub fn get_stats(&self) -> ResourceUsageStats {
        ResourceUsageStats {
            active_connections: self.active_connections(),
            peak_connections: self.stats.peak_connections.load(Ordering::Relaxed),
            total_connections_accepted: self
                .stats
                .total_connections_accepted
                .load(Ordering::Relaxed),
            total_connections_rejected: self
                .stats
                .total_connections_rejected
                .load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// A connection slot held for the lifetime of one relay task
#[derive(Debug)]
pub struct ConnectionSlot {
    _permit: Option<OwnedSemaphorePermit>,
    active_connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let remaining = self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!("Released connection slot, active connections: {}", remaining);
    }
}
