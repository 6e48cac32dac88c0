//! Error Types
//!
//! Errors surfaced to the connection host. Setup and per-completion failures
//! are `AcceptorError`s; failures that belong to a single connection are
//! `ConnectionError`s.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::{CompressionMode, ConnectionId, ConnectionState, SecurityMode};

/// Boxed error produced by host-supplied payload transforms and framing policies
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by connection creators (acceptors and connectors)
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("connection creator has already been started")]
    AlreadyStarted,

    #[error("connection creator was stopped before it started")]
    StoppedDuringStart,

    #[error("failed to bind listening endpoint {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("accept failed on {endpoint}: {source}")]
    Accept {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare transport from {peer}: {source}")]
    Prepare {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to construct connection for {peer}: {source}")]
    Construct {
        peer: SocketAddr,
        #[source]
        source: ConnectionError,
    },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("disconnect of {id} did not shut the transport down cleanly: {source}")]
    Disconnect {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },
}

/// Errors scoped to a single managed connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("security mode {0} requires a crypto provider")]
    MissingCryptoProvider(SecurityMode),

    #[error("compression mode {0} requires a compressor from the host")]
    MissingCompressor(CompressionMode),

    #[error("connection {id} is {actual}, expected {expected}")]
    InvalidState {
        id: ConnectionId,
        expected: ConnectionState,
        actual: ConnectionState,
    },

    #[error("connection {0} is not active")]
    NotActive(ConnectionId),

    #[error("payload transform '{stage}' failed: {source}")]
    Transform {
        stage: String,
        #[source]
        source: BoxError,
    },

    #[error("framing policy failed: {0}")]
    Framing(#[source] BoxError),

    #[error("outbound queue of connection {0} is closed")]
    OutboundClosed(ConnectionId),
}

impl ConnectionError {
    /// Wrap a transform failure with the name of the stage that produced it
    pub fn transform(stage: &str, source: anyhow::Error) -> Self {
        ConnectionError::Transform {
            stage: stage.to_string(),
            source: source.into(),
        }
    }
}
