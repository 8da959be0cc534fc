//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Default listening address: all interfaces, port 18080
pub const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 18080);

/// Default backend host, expected to resolve via container DNS
pub const DEFAULT_BACKEND_HOST: &str = "web";

/// Default backend port
pub const DEFAULT_BACKEND_PORT: u16 = 8080;

/// Default delay applied before every backend connect
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

/// Listener side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Maximum concurrent relay tasks, `0` means unlimited
    pub max_connections: usize,
    /// Copy buffer size per relay direction
    pub buffer_size: usize,
    /// Relay is torn down after this long without traffic in either direction
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long the other direction may stay open once one side has closed
    #[serde(with = "humantime_serde")]
    pub half_close_timeout: Duration,
}

/// Backend side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub addr: BackendAddr,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// Backend address as `host:port`, resolved on every dial
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for BackendAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("backend address '{}' is missing a port", s))?;

        // [::1]:8080
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.contains(&['[', ']'][..]) {
            anyhow::bail!("backend address '{}' has unbalanced brackets", s);
        }
        if host.is_empty() {
            anyhow::bail!("backend address '{}' has an empty host", s);
        }
        if host.contains(':') && !s.starts_with('[') {
            anyhow::bail!("IPv6 backend address '{}' must be written as [addr]:port", s);
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("backend address '{}' has an invalid port: {}", s, e))?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for BackendAddr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendAddr> for String {
    fn from(addr: BackendAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR,
            max_connections: 0,
            buffer_size: 8192,
            idle_timeout: Duration::from_secs(300),
            half_close_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: BackendAddr::new(DEFAULT_BACKEND_HOST, DEFAULT_BACKEND_PORT),
            delay: DEFAULT_DELAY,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
