//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT (or a programmatic trigger), then stops the
//! connection creator and gives live connections a bounded amount of time to
//! close.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::connection::DisconnectCause;
use crate::host::ConnectionRegistry;
use crate::lifecycle::ConnectionCreator;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Notification for shutdown completion
    shutdown_complete: Arc<Notify>,
    /// How long connections get to close
    timeout: Duration,
}

/// What a shutdown left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub disconnects_initiated: usize,
    pub remaining_connections: usize,
    pub elapsed: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            shutdown_complete: Arc::new(Notify::new()),
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Get a handle to wait for shutdown completion
    pub fn completion_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_complete)
    }

    /// Request shutdown without an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no subscribers");
        }
    }

    /// Wait for SIGTERM, SIGINT, Ctrl+C or `trigger`, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");
        let mut triggered = self.subscribe();

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = triggered.recv() => {
                    info!("Shutdown requested, initiating graceful shutdown");
                    return Ok(());
                }
            }
        }

        #[cfg(windows)]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = triggered.recv() => {
                    info!("Shutdown requested, initiating graceful shutdown");
                    return Ok(());
                }
            }
        }

        self.trigger();
        Ok(())
    }

    /// Stop the creator, disconnect its connections and wait for the host to
    /// see them removed
    pub async fn shutdown_creator<C: ConnectionCreator>(
        &self,
        creator: &C,
        registry: &ConnectionRegistry,
    ) -> ShutdownReport {
        info!("Initiating graceful shutdown ({} state)", creator.state());
        let start_time = Instant::now();

        creator.stop();
        let disconnects_initiated = creator.lifecycle().disconnect_all(DisconnectCause::Shutdown);

        info!(
            "Waiting for {} connections to close (timeout: {:?})",
            registry.active_count(),
            self.timeout
        );
        let drained = registry.wait_until_empty(self.timeout).await;

        let report = ShutdownReport {
            disconnects_initiated,
            remaining_connections: registry.active_count(),
            elapsed: start_time.elapsed(),
        };

        if drained {
            info!("All connections closed gracefully in {:?}", report.elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still registered",
                report.elapsed, report.remaining_connections
            );
        }

        self.shutdown_complete.notify_waiters();
        report
    }

    /// Wait for shutdown completion with timeout
    pub async fn wait_for_completion(&self) -> Result<()> {
        tokio::time::timeout(
            self.timeout + Duration::from_secs(5),
            self.shutdown_complete.notified(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Shutdown completion timeout"))?;

        Ok(())
    }
}
