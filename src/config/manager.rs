//! Configuration Manager

use super::{BackendAddr, Config};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const MAX_TIMEOUT: Duration = Duration::from_secs(3600);
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Values supplied on the command line, applied over every other source
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub backend: Option<String>,
    pub delay: Option<Duration>,
    pub max_connections: Option<usize>,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub half_close_timeout: Option<Duration>,
    pub buffer_size: Option<usize>,
    pub log_level: Option<String>,
}

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::parse_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse a TOML document; missing sections and fields take their defaults
    pub fn parse_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from the process environment
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from defaults plus `DELAYRELAY_*` variables found by `lookup`
    pub fn load_from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(bind_addr) = lookup("DELAYRELAY_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid DELAYRELAY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(backend) = lookup("DELAYRELAY_BACKEND_ADDR") {
            config.backend.addr = backend
                .parse::<BackendAddr>()
                .with_context(|| format!("Invalid DELAYRELAY_BACKEND_ADDR: {}", backend))?;
        }

        if let Some(delay) = lookup("DELAYRELAY_DELAY") {
            config.backend.delay = humantime::parse_duration(&delay)
                .with_context(|| format!("Invalid DELAYRELAY_DELAY: {}", delay))?;
        }

        if let Some(max_conn) = lookup("DELAYRELAY_MAX_CONNECTIONS") {
            config.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid DELAYRELAY_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(timeout) = lookup("DELAYRELAY_CONNECT_TIMEOUT") {
            config.backend.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid DELAYRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(timeout) = lookup("DELAYRELAY_IDLE_TIMEOUT") {
            config.server.idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid DELAYRELAY_IDLE_TIMEOUT: {}", timeout))?;
        }

        if let Some(timeout) = lookup("DELAYRELAY_HALF_CLOSE_TIMEOUT") {
            config.server.half_close_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid DELAYRELAY_HALF_CLOSE_TIMEOUT: {}", timeout))?;
        }

        if let Some(buffer_size) = lookup("DELAYRELAY_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid DELAYRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(log_level) = lookup("DELAYRELAY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_backend_config()
            .with_context(|| "Backend configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_connections > 100000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        if self.server.buffer_size < 512 {
            bail!("buffer_size must be at least 512 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.idle_timeout.is_zero() {
            bail!("idle_timeout must be greater than 0");
        }

        if self.server.idle_timeout > MAX_TIMEOUT {
            bail!("idle_timeout cannot exceed 1 hour");
        }

        if self.server.half_close_timeout.is_zero() {
            bail!("half_close_timeout must be greater than 0");
        }

        if self.server.half_close_timeout > MAX_TIMEOUT {
            bail!("half_close_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_backend_config(&self) -> Result<()> {
        if self.backend.addr.host.is_empty() {
            bail!("backend.addr has an empty host");
        }

        if self.backend.addr.port == 0 {
            bail!("backend.addr port must be greater than 0");
        }

        if self.backend.delay > MAX_TIMEOUT {
            bail!("delay cannot exceed 1 hour");
        }

        if self.backend.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.backend.connect_timeout > MAX_TIMEOUT {
            bail!("connect_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(bind_str) = overrides.bind.as_deref() {
            self.server.bind_addr = bind_str
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid bind address: {}", bind_str))?;
            tracing::info!("CLI override: bind address set to {}", self.server.bind_addr);
        }

        if let Some(port) = overrides.port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(backend) = overrides.backend.as_deref() {
            self.backend.addr = backend
                .parse::<BackendAddr>()
                .with_context(|| format!("Invalid backend address: {}", backend))?;
            tracing::info!("CLI override: backend set to {}", self.backend.addr);
        }

        if let Some(delay) = overrides.delay {
            self.backend.delay = delay;
            tracing::info!("CLI override: delay set to {:?}", delay);
        }

        if let Some(max_conn) = overrides.max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(timeout) = overrides.connect_timeout {
            self.backend.connect_timeout = timeout;
            tracing::info!("CLI override: connect timeout set to {:?}", timeout);
        }

        if let Some(timeout) = overrides.idle_timeout {
            self.server.idle_timeout = timeout;
            tracing::info!("CLI override: idle timeout set to {:?}", timeout);
        }

        if let Some(timeout) = overrides.half_close_timeout {
            self.server.half_close_timeout = timeout;
            tracing::info!("CLI override: half-close timeout set to {:?}", timeout);
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(level) = overrides.log_level.as_deref() {
            self.logging.level = level.to_string();
        }

        Ok(())
    }
}
