//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{CompressionMode, PayloadTransform, SecurityMode};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub host: HostConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
}

/// Which kind of connection creator to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatorKind {
    /// Accept inbound connections
    #[default]
    Listen,
    /// Dial one outbound connection
    Connect,
}

impl fmt::Display for CreatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatorKind::Listen => write!(f, "listen"),
            CreatorKind::Connect => write!(f, "connect"),
        }
    }
}

/// Endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub mode: CreatorKind,
    pub addr: SocketAddr,
    pub backlog: u8,
    pub concurrent_accepts: u8,
    pub security: SecurityMode,
    pub compression: CompressionMode,
}

/// Host policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub socket_buffer_size: usize,
    /// Send received payloads back to the sender
    pub echo: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            mode: CreatorKind::Listen,
            addr: SocketAddr::from(([127, 0, 0, 1], 4040)),
            backlog: 16,
            concurrent_accepts: 4,
            security: SecurityMode::None,
            compression: CompressionMode::None,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            socket_buffer_size: 8192,
            echo: false,
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

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Runtime listener configuration for this endpoint
    pub fn listener_config(&self, crypto_provider: Option<Arc<dyn PayloadTransform>>) -> ListenerConfig {
        let config = ListenerConfig::new(self.endpoint.addr)
            .with_backlog(self.endpoint.backlog)
            .with_concurrent_accepts(self.endpoint.concurrent_accepts)
            .with_security(self.endpoint.security)
            .with_compression(self.endpoint.compression);

        match crypto_provider {
            Some(provider) => config.with_crypto_provider(provider),
            None => config,
        }
    }
}

/// Immutable configuration of one connection creator.
///
/// For an acceptor `endpoint` is the local address to listen on; for an
/// outbound connector it is the remote address to dial.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    endpoint: SocketAddr,
    backlog: u8,
    concurrent_accepts: u8,
    security: SecurityMode,
    compression: CompressionMode,
    crypto_provider: Option<Arc<dyn PayloadTransform>>,
}

impl ListenerConfig {
    /// One outstanding accept, a backlog of 16, no security or compression
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            backlog: 16,
            concurrent_accepts: 1,
            security: SecurityMode::None,
            compression: CompressionMode::None,
            crypto_provider: None,
        }
    }

    pub fn with_backlog(mut self, backlog: u8) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_concurrent_accepts(mut self, concurrent_accepts: u8) -> Self {
        self.concurrent_accepts = concurrent_accepts;
        self
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_crypto_provider(mut self, provider: Arc<dyn PayloadTransform>) -> Self {
        self.crypto_provider = Some(provider);
        self
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn backlog(&self) -> u8 {
        self.backlog
    }

    pub fn concurrent_accepts(&self) -> u8 {
        self.concurrent_accepts
    }

    pub fn security(&self) -> SecurityMode {
        self.security
    }

    pub fn compression(&self) -> CompressionMode {
        self.compression
    }

    pub fn crypto_provider(&self) -> Option<&Arc<dyn PayloadTransform>> {
        self.crypto_provider.as_ref()
    }
}
