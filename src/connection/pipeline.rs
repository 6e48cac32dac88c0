//! Payload Pipeline
//!
//! Security and compression stages applied to every payload a connection
//! sends or receives. The algorithms themselves come from outside the crate:
//! the crypto provider is part of the listener configuration and the
//! compressor is supplied by the host.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

/// Transport security applied to connection payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    None,
    Encrypted,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::None => write!(f, "none"),
            SecurityMode::Encrypted => write!(f, "encrypted"),
        }
    }
}

/// Payload compression applied to connection payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    None,
    Compressed,
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMode::None => write!(f, "none"),
            CompressionMode::Compressed => write!(f, "compressed"),
        }
    }
}

/// A reversible payload transformation (a crypto provider or a compressor)
pub trait PayloadTransform: Send + Sync + fmt::Debug {
    /// Short name used in logs and error messages
    fn name(&self) -> &str;

    /// Transform an outgoing payload
    fn encode(&self, payload: Bytes) -> anyhow::Result<Bytes>;

    /// Reverse `encode` on an incoming payload
    fn decode(&self, payload: Bytes) -> anyhow::Result<Bytes>;
}

/// Ordered set of payload stages for one connection
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    /// Stages in outbound order
    stages: Vec<Arc<dyn PayloadTransform>>,
}

impl Pipeline {
    /// Build the pipeline for the given modes.
    ///
    /// Outbound payloads are compressed before they are encrypted.
    pub fn build(
        security: SecurityMode,
        compression: CompressionMode,
        crypto_provider: Option<&Arc<dyn PayloadTransform>>,
        compressor: Option<Arc<dyn PayloadTransform>>,
    ) -> Result<Self, ConnectionError> {
        let mut stages = Vec::with_capacity(2);

        if compression == CompressionMode::Compressed {
            let compressor = compressor.ok_or(ConnectionError::MissingCompressor(compression))?;
            stages.push(compressor);
        }

        if security == SecurityMode::Encrypted {
            let provider = crypto_provider.ok_or(ConnectionError::MissingCryptoProvider(security))?;
            stages.push(Arc::clone(provider));
        }

        Ok(Self { stages })
    }

    /// Whether the pipeline leaves payloads untouched
    pub fn is_passthrough(&self) -> bool {
        self.stages.is_empty()
    }

    /// Names of the stages in outbound order
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Apply every stage to an outgoing payload
    pub fn encode(&self, payload: Bytes) -> Result<Bytes, ConnectionError> {
        self.stages.iter().try_fold(payload, |data, stage| {
            stage
                .encode(data)
                .map_err(|e| ConnectionError::transform(stage.name(), e))
        })
    }

    /// Undo every stage on an incoming payload, last stage first
    pub fn decode(&self, payload: Bytes) -> Result<Bytes, ConnectionError> {
        self.stages.iter().rev().try_fold(payload, |data, stage| {
            stage
                .decode(data)
                .map_err(|e| ConnectionError::transform(stage.name(), e))
        })
    }
}
