//! Outbound Connector
//!
//! The dialing counterpart of the acceptor: one connect attempt to the
//! configured endpoint, adopted as a managed connection on success. There is
//! no retry; a failed attempt is reported to the host.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::ListenerConfig;
use crate::connection::{ConnectionOrigin, ManagedConnection};
use crate::error::AcceptorError;
use crate::host::ConnectionHost;
use crate::lifecycle::{wait_closed, ConnectionCreator, ConnectionLifecycle, CreatorState};

/// Dials one outbound connection
pub struct OutboundConnector {
    lifecycle: Arc<ConnectionLifecycle>,
}

impl OutboundConnector {
    pub fn new(config: ListenerConfig, host: Arc<dyn ConnectionHost>) -> Self {
        Self {
            lifecycle: Arc::new(ConnectionLifecycle::new(config, host)),
        }
    }

    /// Spawn the connect attempt.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), AcceptorError> {
        self.lifecycle.begin_start()?;
        self.lifecycle.complete_start()?;

        let lifecycle = Arc::clone(&self.lifecycle);
        let mut closed = lifecycle.close_signal();
        let endpoint = lifecycle.config().endpoint();
        info!("Connecting to {}", endpoint);

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => {
                    debug!("Connect to {} cancelled", endpoint);
                    return;
                }
                result = TcpStream::connect(endpoint) => result,
            };

            let result = result.and_then(|stream| {
                stream.set_nodelay(true)?;
                Ok(stream)
            });

            match result {
                Ok(_) if !lifecycle.is_started() => {
                    debug!("Dropping connection to {} made while stopping", endpoint);
                }
                Ok(stream) => {
                    lifecycle.adopt(Box::new(stream), endpoint, ConnectionOrigin::Connected);
                }
                Err(e) if lifecycle.is_stopped() => {
                    debug!("Suppressing connect failure to {} while stopping: {}", endpoint, e);
                }
                Err(source) => {
                    lifecycle
                        .host()
                        .report_exception(&AcceptorError::Connect { endpoint, source });
                }
            }
        });

        Ok(())
    }

    /// Cancel a pending connect attempt; established connections keep running
    pub fn stop(&self) {
        if self.lifecycle.stop() {
            info!("Stopped connector for {}", self.lifecycle.config().endpoint());
        }
    }

    pub fn state(&self) -> CreatorState {
        self.lifecycle.state()
    }

    pub fn connections(&self) -> Vec<Arc<ManagedConnection>> {
        self.lifecycle.connections()
    }
}

impl ConnectionCreator for OutboundConnector {
    fn start(&self) -> Result<(), AcceptorError> {
        OutboundConnector::start(self)
    }

    fn stop(&self) {
        OutboundConnector::stop(self)
    }

    fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.lifecycle
    }
}

impl Drop for OutboundConnector {
    fn drop(&mut self) {
        self.stop();
    }
}
