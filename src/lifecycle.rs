//! Connection Lifecycle
//!
//! State and behaviour shared by every kind of connection creator. An
//! acceptor and an outbound connector each embed one `ConnectionLifecycle`
//! and implement `ConnectionCreator` on top of it; `Creator` picks between
//! the two at runtime.
//!
//! ```text
//! NotStarted ──start──▶ Starting ──▶ Started ──stop──▶ Stopped
//!                          └────── setup failure ────────▲
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::acceptor::ConnectionAcceptor;
use crate::config::{CreatorKind, ListenerConfig};
use crate::connection::{BoxedTransport, ConnectionId, ConnectionOrigin, DisconnectCause, ManagedConnection};
use crate::connector::OutboundConnector;
use crate::error::AcceptorError;
use crate::host::ConnectionHost;

/// Lifecycle state of a connection creator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CreatorState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
    /// Terminal
    Stopped = 3,
}

impl CreatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CreatorState::NotStarted,
            1 => CreatorState::Starting,
            2 => CreatorState::Started,
            _ => CreatorState::Stopped,
        }
    }
}

impl fmt::Display for CreatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CreatorState::NotStarted => "not started",
            CreatorState::Starting => "starting",
            CreatorState::Started => "started",
            CreatorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Resolves once the close signal is raised or its sender is gone
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Configuration, host handle, state and co-owned connections of one creator
pub struct ConnectionLifecycle {
    config: Arc<ListenerConfig>,
    host: Arc<dyn ConnectionHost>,
    state: AtomicU8,
    closed: watch::Sender<bool>,
    connections: Mutex<HashMap<ConnectionId, Arc<ManagedConnection>>>,
}

impl ConnectionLifecycle {
    /// Create a lifecycle; the configuration is frozen from here on
    pub fn new(config: ListenerConfig, host: Arc<dyn ConnectionHost>) -> Self {
        let (closed, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            host,
            state: AtomicU8::new(CreatorState::NotStarted as u8),
            closed,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn ConnectionHost> {
        &self.host
    }

    pub fn state(&self) -> CreatorState {
        CreatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_started(&self) -> bool {
        self.state() == CreatorState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == CreatorState::Stopped
    }

    /// Receiver that observes `stop`
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Claim the single permitted start
    pub(crate) fn begin_start(&self) -> Result<(), AcceptorError> {
        self.state
            .compare_exchange(
                CreatorState::NotStarted as u8,
                CreatorState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|_| AcceptorError::AlreadyStarted)
    }

    /// Finish a start that `stop` did not interrupt
    pub(crate) fn complete_start(&self) -> Result<(), AcceptorError> {
        self.state
            .compare_exchange(
                CreatorState::Starting as u8,
                CreatorState::Started as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|_| AcceptorError::StoppedDuringStart)
    }

    /// Move to `Stopped` and raise the close signal.
    ///
    /// Returns `true` only for the call that actually stopped the creator;
    /// stopping a creator that never started, or stopping twice, does nothing.
    pub fn stop(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            match CreatorState::from_u8(current) {
                CreatorState::NotStarted | CreatorState::Stopped => return false,
                CreatorState::Starting | CreatorState::Started => {}
            }

            match self.state.compare_exchange(
                current,
                CreatorState::Stopped as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.closed.send_replace(true);
        true
    }

    /// Turn a fresh transport into a registered, initialized connection.
    ///
    /// Construction failures go straight to the host. Once the connection
    /// exists, failures are routed through its own disconnect instead.
    pub fn adopt(
        self: &Arc<Self>,
        transport: BoxedTransport,
        peer: SocketAddr,
        origin: ConnectionOrigin,
    ) -> Option<Arc<ManagedConnection>> {
        let conn = match ManagedConnection::new(self, transport, peer, origin) {
            Ok(conn) => conn,
            Err(source) => {
                self.host.report_exception(&AcceptorError::Construct { peer, source });
                return None;
            }
        };

        self.lock_connections().insert(conn.id(), Arc::clone(&conn));
        self.host.add_connection(Arc::clone(&conn));

        if let Err(e) = conn.initialize() {
            warn!("Failed to initialize connection {} from {}: {}", conn.id(), peer, e);
            conn.begin_disconnect(DisconnectCause::Fault(e.to_string()));
        }

        Some(conn)
    }

    /// Drop this creator's reference to a disposed connection
    pub(crate) fn release(&self, id: &ConnectionId) {
        if self.lock_connections().remove(id).is_some() {
            debug!("Released connection {}", id);
        }
    }

    /// Connections this creator still co-owns
    pub fn connections(&self) -> Vec<Arc<ManagedConnection>> {
        self.lock_connections().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Begin disconnecting every co-owned connection.
    ///
    /// `stop` leaves connections running; this is the teardown cascade.
    /// Returns how many disconnects this call initiated.
    pub fn disconnect_all(&self, cause: DisconnectCause) -> usize {
        let connections = self.connections();
        let initiated = connections
            .iter()
            .filter(|conn| conn.begin_disconnect(cause.clone()))
            .count();

        if initiated > 0 {
            info!("Disconnecting {} of {} connections ({})", initiated, connections.len(), cause);
        }
        initiated
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ManagedConnection>>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Start/stop capability shared by every connection creator
pub trait ConnectionCreator {
    /// Start creating connections; allowed once per instance
    fn start(&self) -> Result<(), AcceptorError>;

    /// Stop creating connections; idempotent
    fn stop(&self);

    fn lifecycle(&self) -> &Arc<ConnectionLifecycle>;

    fn state(&self) -> CreatorState {
        self.lifecycle().state()
    }
}

/// A connection creator of either kind
pub enum Creator {
    Listener(ConnectionAcceptor),
    Connector(OutboundConnector),
}

impl Creator {
    /// Build the creator the configuration asks for
    pub fn new(kind: CreatorKind, config: ListenerConfig, host: Arc<dyn ConnectionHost>) -> Self {
        match kind {
            CreatorKind::Listen => Creator::Listener(ConnectionAcceptor::new(config, host)),
            CreatorKind::Connect => Creator::Connector(OutboundConnector::new(config, host)),
        }
    }

    pub fn kind(&self) -> CreatorKind {
        match self {
            Creator::Listener(_) => CreatorKind::Listen,
            Creator::Connector(_) => CreatorKind::Connect,
        }
    }
}

impl ConnectionCreator for Creator {
    fn start(&self) -> Result<(), AcceptorError> {
        match self {
            Creator::Listener(acceptor) => ConnectionCreator::start(acceptor),
            Creator::Connector(connector) => ConnectionCreator::start(connector),
        }
    }

    fn stop(&self) {
        match self {
            Creator::Listener(acceptor) => ConnectionCreator::stop(acceptor),
            Creator::Connector(connector) => ConnectionCreator::stop(connector),
        }
    }

    fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        match self {
            Creator::Listener(acceptor) => ConnectionCreator::lifecycle(acceptor),
            Creator::Connector(connector) => ConnectionCreator::lifecycle(connector),
        }
    }
}
