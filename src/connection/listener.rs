//! Relay Listener
//!
//! Accepts inbound connections and hands each one to its own relay task.
//! Nothing a relay task does can stop the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, Instrument};

use super::backoff::AcceptBackoff;
use super::handler::{handle_connection, RelayContext};
use crate::config::Config;
use crate::relay::RelaySession;
use crate::resource::ResourceManager;
use crate::Result;

/// Listening socket plus the shared state its relay tasks read
pub struct RelayListener {
    listener: TcpListener,
    context: Arc<RelayContext>,
    resource_manager: Arc<ResourceManager>,
}

impl RelayListener {
    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind(config: &Config) -> Result<Self> {
        let bind_addr = config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind listener on {}", bind_addr))?;

        Ok(Self {
            listener,
            context: Arc::new(RelayContext::from_config(config)),
            resource_manager: Arc::new(ResourceManager::new(config.server.max_connections)),
        })
    }

    /// Address actually bound, useful when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    pub fn resource_manager(&self) -> Arc<ResourceManager> {
        Arc::clone(&self.resource_manager)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        let local_addr = self.local_addr()?;
        info!(
            "TCP relay listening on {}, {} delay per connection to {}",
            local_addr,
            humantime::format_duration(self.context.delay),
            self.context.backend
        );

        let mut backoff = AcceptBackoff::new();
        loop {
            let accepted = self.listener.accept().await;
            if let Some(delay) = self.on_accept(accepted, &mut backoff) {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Handle one accept result. Returns how long to pause before the next
    /// accept when it failed.
    fn on_accept(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        backoff: &mut AcceptBackoff,
    ) -> Option<Duration> {
        match accepted {
            Ok((stream, addr)) => {
                backoff.reset();
                self.dispatch(stream, addr);
                None
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    "Error accepting connection: {} (failure {}, retrying in {:?})",
                    e,
                    backoff.failures(),
                    delay
                );
                Some(delay)
            }
        }
    }

    /// Spawn the relay task for one accepted connection
    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        let slot = match self.resource_manager.acquire_connection_slot() {
            Ok(slot) => slot,
            Err(_) => {
                debug!("Closing connection from {} without relaying", addr);
                return;
            }
        };

        let session_id = RelaySession::generate_id();
        let span = info_span!("relay", session = %session_id, peer = %addr);
        let context = Arc::clone(&self.context);

        tokio::spawn(
            async move {
                let _slot = slot;
                let started = Instant::now();

                match handle_connection(&context, stream, addr, session_id).await {
                    Ok(stats) => debug!(
                        "Connection from {} closed after {:?}, {} bytes relayed",
                        addr,
                        started.elapsed(),
                        stats.total_bytes
                    ),
                    Err(e) => debug!(
                        "Connection from {} closed after {:?}: {:#}",
                        addr,
                        started.elapsed(),
                        e
                    ),
                }
            }
            .instrument(span),
        );
    }
}
