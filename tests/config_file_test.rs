//! Configuration file loading tests

use anyhow::Result;
use delayrelay::config::{BackendAddr, ConfigManager};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_full_config_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("delayrelay.toml");

    fs::write(
        &config_path,
        r#"
[server]
bind_addr = "127.0.0.1:28080"
max_connections = 128
buffer_size = 16384
idle_timeout = "90s"

[backend]
addr = "api.internal:9000"
delay = "3s"
connect_timeout = "4s"

[logging]
level = "debug"
"#,
    )?;

    let config = ConfigManager::load_from_file(&config_path)?;

    assert_eq!(config.server.bind_addr, "127.0.0.1:28080".parse()?);
    assert_eq!(config.server.max_connections, 128);
    assert_eq!(config.server.buffer_size, 16384);
    assert_eq!(config.server.idle_timeout, Duration::from_secs(90));
    assert_eq!(config.backend.addr, BackendAddr::new("api.internal", 9000));
    assert_eq!(config.backend.delay, Duration::from_secs(3));
    assert_eq!(config.backend.connect_timeout, Duration::from_secs(4));
    assert_eq!(config.logging.level, "debug");

    Ok(())
}

#[test]
fn test_missing_config_file_uses_defaults() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = ConfigManager::load_from_file(&temp_dir.path().join("absent.toml"))?;

    assert_eq!(config.server.bind_addr.port(), 18080);
    assert_eq!(config.backend.addr.to_string(), "web:8080");
    assert_eq!(config.backend.delay, Duration::from_secs(2));

    Ok(())
}

#[test]
fn test_invalid_config_file_is_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("bad.toml");

    fs::write(
        &config_path,
        r#"
[server]
buffer_size = 10
"#,
    )?;

    let err = ConfigManager::load_from_file(&config_path).unwrap_err();
    assert!(format!("{:#}", err).contains("buffer_size"));

    fs::write(&config_path, "[backend]\ndelay = \"forever\"\n")?;
    let err = ConfigManager::load_from_file(&config_path).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));

    Ok(())
}
