//! delayrelay - TCP relay with a fixed delay before every backend connect
//!
//! Listens on `0.0.0.0:18080` and relays each client to `web:8080` two
//! seconds after it connects, unless configured otherwise.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use delayrelay::{
    config::{Config, ConfigManager, ConfigOverrides},
    shutdown, RelayListener,
};

/// CLI arguments for delayrelay
#[derive(Parser, Debug)]
#[command(name = "delayrelay")]
#[command(about = "TCP relay that delays every backend connect")]
#[command(version)]
#[command(long_about = "
delayrelay - TCP relay that delays every backend connect

Accepts TCP connections, waits a fixed delay, dials the backend and relays
bytes in both directions until either side closes. Use it to simulate a
slow-to-connect intermediary when testing client timeouts and retries.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables (only read when the config file does not exist)
4. Built-in defaults (listen 0.0.0.0:18080, backend web:8080, delay 2s)

Environment variables:
  DELAYRELAY_BIND_ADDR        - Bind address (e.g., 0.0.0.0:18080)
  DELAYRELAY_BACKEND_ADDR     - Backend host:port (e.g., web:8080)
  DELAYRELAY_DELAY            - Delay before backend connect (e.g., 2s, 500ms)
  DELAYRELAY_MAX_CONNECTIONS  - Maximum concurrent relays, 0 for unlimited
  DELAYRELAY_CONNECT_TIMEOUT  - Backend connect timeout (e.g., 10s)
  DELAYRELAY_IDLE_TIMEOUT     - Relay idle timeout (e.g., 5m)
  DELAYRELAY_HALF_CLOSE_TIMEOUT - Time the other side may stay open after one side closes (e.g., 10s)
  DELAYRELAY_BUFFER_SIZE      - Copy buffer size in bytes
  DELAYRELAY_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "delayrelay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 0.0.0.0:18080)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Backend address
    #[arg(long, help = "Backend host:port (e.g., web:8080)")]
    pub backend: Option<String>,

    /// Delay before each backend connect
    #[arg(short, long, value_parser = humantime::parse_duration, help = "Delay before backend connect (e.g., 2s)")]
    pub delay: Option<Duration>,

    /// Maximum number of concurrent relays
    #[arg(long, help = "Maximum number of concurrent relays, 0 for unlimited")]
    pub max_connections: Option<usize>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Backend connect timeout")]
    pub connect_timeout: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Relay idle timeout")]
    pub idle_timeout: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, help = "How long the other side may stay open after one side closes")]
    pub half_close_timeout: Option<Duration>,

    /// Buffer size in bytes
    #[arg(long, help = "Copy buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind: self.bind.clone(),
            port: self.port,
            backend: self.backend.clone(),
            delay: self.delay,
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            half_close_timeout: self.half_close_timeout,
            buffer_size: self.buffer_size,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let log_filter = init_tracing(&args);
    let config = load_config(&args)?;
    log_filter.apply_config(&config)?;

    info!("Starting delayrelay v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Backend: {}", config.backend.addr);
        info!("  Delay: {}", humantime::format_duration(config.backend.delay));
        info!(
            "  Max connections: {}",
            match config.server.max_connections {
                0 => "unlimited".to_string(),
                n => n.to_string(),
            }
        );
        info!(
            "  Connect timeout: {}",
            humantime::format_duration(config.backend.connect_timeout)
        );
        info!(
            "  Idle timeout: {}",
            humantime::format_duration(config.server.idle_timeout)
        );
        info!(
            "  Half-close timeout: {}",
            humantime::format_duration(config.server.half_close_timeout)
        );
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        return Ok(());
    }

    let listener = RelayListener::bind(&config).await?;

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = result {
                error!("Relay listener error: {:#}", e);
                return Err(e);
            }
        }
        result = shutdown::wait_for_signal() => {
            result.context("Failed to install signal handlers")?;
        }
    }

    Ok(())
}

/// Load configuration: CLI args > config file > environment > defaults
fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&args.overrides())?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    Ok(config)
}

/// Log filter installed before configuration is loaded
struct LogFilter {
    handle: reload::Handle<EnvFilter, Registry>,
    /// `RUST_LOG` or `--verbose` chose the level, so the config file does not
    fixed: bool,
}

impl LogFilter {
    /// Switch to the configured level once the configuration is known
    fn apply_config(&self, config: &Config) -> Result<()> {
        if self.fixed {
            return Ok(());
        }
        self.handle
            .reload(EnvFilter::new(&config.logging.level))
            .context("Failed to apply configured log level")
    }
}

/// Initialize tracing/logging
///
/// Runs before configuration loading so the loader's own messages are
/// logged. Until the configured level is applied the filter comes from
/// `RUST_LOG`, `--verbose` or `--log-level`, defaulting to `info`.
fn init_tracing(args: &CliArgs) -> LogFilter {
    let (env_filter, fixed) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) if args.verbose => (EnvFilter::new("debug"), true),
        Err(_) => (
            EnvFilter::new(args.log_level.as_deref().unwrap_or("info")),
            false,
        ),
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    LogFilter { handle, fixed }
}
