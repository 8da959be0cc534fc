//! Signal Handling
//!
//! The relay has no drain phase: once a termination signal arrives the
//! process exits and in-flight relays are closed with it.

use tokio::signal;
use tracing::info;

use crate::Result;

/// Wait for SIGTERM or SIGINT (Ctrl+C on Windows) and return the signal name
pub async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        info!("Received {}, exiting", name);
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, exiting");
        Ok("Ctrl+C")
    }
}
