//! Configuration Manager

use super::{Config, CreatorKind};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config.validate().context("Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn load_from_vars<F>(var: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(bind_addr) = var("TERMLINK_BIND_ADDR") {
            config.endpoint.addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid TERMLINK_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(backlog) = var("TERMLINK_BACKLOG") {
            config.endpoint.backlog = backlog
                .parse::<u8>()
                .with_context(|| format!("Invalid TERMLINK_BACKLOG (0-255): {}", backlog))?;
        }

        if let Some(accepts) = var("TERMLINK_CONCURRENT_ACCEPTS") {
            config.endpoint.concurrent_accepts = accepts
                .parse::<u8>()
                .with_context(|| format!("Invalid TERMLINK_CONCURRENT_ACCEPTS (0-255): {}", accepts))?;
        }

        if let Some(buffer_size) = var("TERMLINK_BUFFER_SIZE") {
            config.host.socket_buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TERMLINK_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(timeout) = var("TERMLINK_SHUTDOWN_TIMEOUT") {
            config.shutdown.timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TERMLINK_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Some(log_level) = var("TERMLINK_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_endpoint_config()
            .context("Endpoint configuration validation failed")?;

        self.validate_host_config()
            .context("Host configuration validation failed")?;

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", VALID_LOG_LEVELS.join(", "));
        }

        if self.shutdown.timeout.is_zero() {
            bail!("shutdown.timeout must be greater than 0");
        }

        if self.shutdown.timeout > Duration::from_secs(600) {
            bail!("shutdown.timeout cannot exceed 10 minutes");
        }

        Ok(())
    }

    fn validate_endpoint_config(&self) -> Result<()> {
        if self.endpoint.mode == CreatorKind::Connect && self.endpoint.addr.port() == 0 {
            bail!("connect mode requires a non-zero port");
        }

        if self.endpoint.mode == CreatorKind::Listen && self.endpoint.concurrent_accepts == 0 {
            tracing::warn!("concurrent_accepts is 0, the listener will not accept any connections");
        }

        Ok(())
    }

    fn validate_host_config(&self) -> Result<()> {
        if self.host.socket_buffer_size < 1024 {
            bail!("socket_buffer_size must be at least 1024 bytes");
        }

        if self.host.socket_buffer_size > 1048576 {
            bail!("socket_buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    /// Merge configuration with CLI arguments
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli_args(
        &mut self,
        bind_addr: Option<&str>,
        port: Option<u16>,
        connect: bool,
        backlog: Option<u8>,
        concurrent_accepts: Option<u8>,
        buffer_size: Option<usize>,
        echo: bool,
    ) -> Result<()> {
        if let Some(addr) = bind_addr {
            self.endpoint.addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid bind address: {}", addr))?;
        }

        if let Some(port) = port {
            self.endpoint.addr.set_port(port);
        }

        if connect {
            self.endpoint.mode = CreatorKind::Connect;
        }

        if let Some(backlog) = backlog {
            self.endpoint.backlog = backlog;
        }

        if let Some(accepts) = concurrent_accepts {
            self.endpoint.concurrent_accepts = accepts;
        }

        if let Some(size) = buffer_size {
            self.host.socket_buffer_size = size;
        }

        if echo {
            self.host.echo = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[endpoint]
addr = "0.0.0.0:2323"
backlog = 5
concurrent_accepts = 2
security = "none"
compression = "compressed"

[host]
socket_buffer_size = 16384
echo = true

[shutdown]
timeout = "3s"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.endpoint.addr.port(), 2323);
        assert_eq!(config.endpoint.backlog, 5);
        assert_eq!(config.endpoint.concurrent_accepts, 2);
        assert_eq!(config.endpoint.compression, crate::connection::CompressionMode::Compressed);
        assert_eq!(config.host.socket_buffer_size, 16384);
        assert!(config.host.echo);
        assert_eq!(config.shutdown.timeout, Duration::from_secs(3));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_backlog_out_of_range_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[endpoint]\nbacklog = 300\n").unwrap();

        assert!(ConfigManager::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.endpoint.addr, EndpointConfig::default().addr);
    }

    #[test]
    fn test_load_from_vars() {
        let config = ConfigManager::load_from_vars(vars(&[
            ("TERMLINK_BIND_ADDR", "127.0.0.1:9000"),
            ("TERMLINK_CONCURRENT_ACCEPTS", "8"),
            ("TERMLINK_SHUTDOWN_TIMEOUT", "2s"),
            ("TERMLINK_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint.addr.port(), 9000);
        assert_eq!(config.endpoint.concurrent_accepts, 8);
        assert_eq!(config.shutdown.timeout, Duration::from_secs(2));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_vars_rejected() {
        assert!(ConfigManager::load_from_vars(vars(&[("TERMLINK_BACKLOG", "256")])).is_err());
        assert!(ConfigManager::load_from_vars(vars(&[("TERMLINK_BUFFER_SIZE", "10")])).is_err());
        assert!(ConfigManager::load_from_vars(vars(&[("TERMLINK_LOG_LEVEL", "loud")])).is_err());
    }

    #[test]
    fn test_connect_mode_requires_port() {
        let mut config = Config::default();
        config.endpoint.mode = CreatorKind::Connect;
        config.endpoint.addr.set_port(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_with_cli_args() {
        let mut config = Config::default();
        config
            .merge_with_cli_args(Some("10.0.0.1:23"), Some(2424), true, Some(1), Some(3), None, true)
            .unwrap();

        assert_eq!(config.endpoint.addr, "10.0.0.1:2424".parse::<SocketAddr>().unwrap());
        assert_eq!(config.endpoint.mode, CreatorKind::Connect);
        assert_eq!(config.endpoint.backlog, 1);
        assert_eq!(config.endpoint.concurrent_accepts, 3);
        assert!(config.host.echo);
    }

    #[test]
    fn test_listener_config_from_config() {
        let mut config = Config::default();
        config.endpoint.backlog = 5;
        config.endpoint.concurrent_accepts = 2;

        let listener = config.listener_config(None);
        assert_eq!(listener.endpoint(), config.endpoint.addr);
        assert_eq!(listener.backlog(), 5);
        assert_eq!(listener.concurrent_accepts(), 2);
        assert!(listener.crypto_provider().is_none());
    }
}
