//! Connection Acceptor Implementation
//!
//! Binds the listening endpoint and keeps a fixed number of accept
//! operations in flight. Every completion first re-arms a replacement accept
//! and only then turns its transport into a managed connection, so a burst of
//! inbound connections never lowers the number of outstanding accepts.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::stats::{AcceptorStats, AcceptorStatsSnapshot};
use super::transport::{AcceptFuture, Bind, Listen, TcpBinder};
use crate::config::ListenerConfig;
use crate::connection::{ConnectionOrigin, ManagedConnection};
use crate::error::AcceptorError;
use crate::host::ConnectionHost;
use crate::lifecycle::{wait_closed, ConnectionCreator, ConnectionLifecycle, CreatorState};

/// Accepts inbound connections on one endpoint
pub struct ConnectionAcceptor<B: Bind = TcpBinder> {
    lifecycle: Arc<ConnectionLifecycle>,
    binder: B,
    listener: Mutex<Option<Arc<B::Listener>>>,
    local_addr: OnceLock<SocketAddr>,
    stats: Arc<AcceptorStats>,
}

impl ConnectionAcceptor<TcpBinder> {
    /// Create a TCP acceptor
    pub fn new(config: ListenerConfig, host: Arc<dyn ConnectionHost>) -> Self {
        Self::with_binder(config, host, TcpBinder)
    }
}

impl<B: Bind> ConnectionAcceptor<B> {
    /// Create an acceptor over a custom listening transport
    pub fn with_binder(config: ListenerConfig, host: Arc<dyn ConnectionHost>, binder: B) -> Self {
        Self {
            lifecycle: Arc::new(ConnectionLifecycle::new(config, host)),
            binder,
            listener: Mutex::new(None),
            local_addr: OnceLock::new(),
            stats: Arc::new(AcceptorStats::default()),
        }
    }

    /// Bind, listen and issue the configured number of accept operations.
    ///
    /// Returns the bound local address. A bind or listen failure stops the
    /// acceptor, is reported to the host once and is returned to the caller.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<SocketAddr, AcceptorError> {
        self.lifecycle.begin_start()?;

        let config = Arc::clone(self.lifecycle.config());
        let endpoint = config.endpoint();
        let buffer_size = self.lifecycle.host().socket_buffer_size();

        info!(
            "Binding listener to {} (backlog {}, {} concurrent accepts)",
            endpoint,
            config.backlog(),
            config.concurrent_accepts()
        );

        let bound = self
            .binder
            .bind(endpoint, u32::from(config.backlog()), buffer_size)
            .and_then(|listener| {
                let local_addr = listener.local_addr()?;
                Ok((listener, local_addr))
            });

        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.lifecycle.stop();
                self.stats.record_setup_failure();

                let err = AcceptorError::Bind { endpoint, source };
                self.lifecycle.host().report_exception(&err);
                return Err(err);
            }
        };

        let listener = Arc::new(listener);
        *self.lock_listener() = Some(Arc::clone(&listener));
        let _ = self.local_addr.set(local_addr);

        if let Err(e) = self.lifecycle.complete_start() {
            warn!("Acceptor for {} was stopped while starting", endpoint);
            self.lock_listener().take();
            return Err(e);
        }

        let slots = usize::from(config.concurrent_accepts());
        self.stats.open_slots(slots);
        for _ in 0..slots {
            AcceptSlot {
                listener: Arc::clone(&listener),
                lifecycle: Arc::clone(&self.lifecycle),
                config: Arc::clone(&config),
                local_addr,
                stats: Arc::clone(&self.stats),
                closed: self.lifecycle.close_signal(),
            }
            .arm();
        }

        info!("Listening on {} with {} outstanding accepts", local_addr, slots);
        Ok(local_addr)
    }

    /// Close the listening resource.
    ///
    /// Idempotent, and a no-op before `start`. Connections that were already
    /// accepted keep running.
    pub fn stop(&self) {
        if !self.lifecycle.stop() {
            return;
        }

        // Outstanding accepts observe the close signal and release their
        // handles; the socket closes with the last one.
        let listener = self.lock_listener().take();
        drop(listener);

        match self.local_addr.get() {
            Some(addr) => info!("Stopped listening on {}", addr),
            None => info!("Stopped acceptor for {}", self.lifecycle.config().endpoint()),
        }
    }

    pub fn state(&self) -> CreatorState {
        self.lifecycle.state()
    }

    pub fn is_listening(&self) -> bool {
        self.lifecycle.is_started()
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        self.lifecycle.config()
    }

    pub fn stats(&self) -> AcceptorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Live counters, for sampling while the acceptor runs
    pub fn stats_handle(&self) -> Arc<AcceptorStats> {
        Arc::clone(&self.stats)
    }

    /// Accept slots opened and not yet retired
    pub fn active_slots(&self) -> usize {
        self.stats.active_slots()
    }

    /// Accepted connections that have not finished disconnecting
    pub fn connections(&self) -> Vec<Arc<ManagedConnection>> {
        self.lifecycle.connections()
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Arc<B::Listener>>> {
        self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<B: Bind> ConnectionCreator for ConnectionAcceptor<B> {
    fn start(&self) -> Result<(), AcceptorError> {
        ConnectionAcceptor::start(self).map(|_| ())
    }

    fn stop(&self) {
        ConnectionAcceptor::stop(self)
    }

    fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.lifecycle
    }
}

impl<B: Bind> Drop for ConnectionAcceptor<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Completion context of one outstanding accept.
///
/// Carries everything a completion needs so that concurrent completions
/// share nothing mutable beyond the listening handle itself.
struct AcceptSlot<L: Listen> {
    listener: Arc<L>,
    lifecycle: Arc<ConnectionLifecycle>,
    config: Arc<ListenerConfig>,
    local_addr: SocketAddr,
    stats: Arc<AcceptorStats>,
    closed: watch::Receiver<bool>,
}

impl<L: Listen> AcceptSlot<L> {
    /// Issue the accept operation and wait for it on a separate task
    fn arm(self) {
        let accept = Arc::clone(&self.listener).accept();
        self.stats.record_issued();
        tokio::spawn(self.complete(accept));
    }

    /// Same slot, fresh operation
    fn replacement(&self) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
            lifecycle: Arc::clone(&self.lifecycle),
            config: Arc::clone(&self.config),
            local_addr: self.local_addr,
            stats: Arc::clone(&self.stats),
            closed: self.closed.clone(),
        }
    }

    async fn complete(mut self, accept: AcceptFuture<L::Stream>) {
        let result = tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => {
                self.stats.retire_slot();
                return;
            }
            result = accept => result,
        };

        if !self.lifecycle.is_started() {
            self.stats.retire_slot();
            match result {
                Ok((_, peer)) => debug!("Dropping connection from {} accepted while stopping", peer),
                Err(e) => {
                    self.stats.record_suppressed();
                    debug!("Suppressing accept failure on {} while stopping: {}", self.local_addr, e);
                }
            }
            return;
        }

        // The replacement takes over this slot before anything else happens
        self.replacement().arm();
        self.stats.record_completed();

        match result {
            Ok((stream, peer)) => self.on_accepted(stream, peer),
            Err(source) => {
                self.stats.record_failure();
                self.lifecycle.host().report_exception(&AcceptorError::Accept {
                    endpoint: self.local_addr,
                    source,
                });
            }
        }
    }

    fn on_accepted(&self, stream: L::Stream, peer: SocketAddr) {
        debug!(
            "Accepted connection from {} on {} ({:?} security, {:?} compression)",
            peer,
            self.local_addr,
            self.config.security(),
            self.config.compression()
        );

        if let Err(source) = self.listener.prepare(&stream, peer) {
            self.stats.record_failure();
            self.lifecycle
                .host()
                .report_exception(&AcceptorError::Prepare { peer, source });
            return;
        }

        if self
            .lifecycle
            .adopt(Box::new(stream), peer, ConnectionOrigin::Accepted)
            .is_some()
        {
            self.stats.record_connection();
        }
    }
}
