//! Per-connection relay task: delay, dial the backend, relay, tear down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::{BackendAddr, Config};
use crate::relay::{ConnectionStats, RelayEngine, RelaySession};
use crate::Result;

/// Everything a relay task needs, shared read-only by all tasks
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub engine: RelayEngine,
    pub backend: BackendAddr,
    pub delay: Duration,
}

impl RelayContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: RelayEngine::from_config(config),
            backend: config.backend.addr.clone(),
            delay: config.backend.delay,
        }
    }
}

/// Run one relay task to completion.
///
/// The client is owned here and closed on every return path, as is the
/// backend once dialed. A client that hangs up during the delay is only
/// noticed once the relay starts reading from it.
pub async fn handle_connection(
    ctx: &RelayContext,
    client: TcpStream,
    peer: SocketAddr,
    session_id: String,
) -> Result<ConnectionStats> {
    info!(
        "New connection from {} - delaying {} before backend connect",
        peer,
        humantime::format_duration(ctx.delay)
    );

    tokio::time::sleep(ctx.delay).await;

    let (backend, backend_addr) = match ctx.engine.connect_to_backend(&ctx.backend).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!("Backend connection failed: {:#}", e);
            return Err(e);
        }
    };

    info!("Connected to backend for {} ({})", peer, backend_addr);

    if let Err(e) = client.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on client connection {}: {}", peer, e);
    }

    let session = Arc::new(RelaySession::new(session_id, peer, backend_addr));
    ctx.engine.relay_data(&session, client, backend).await
}
