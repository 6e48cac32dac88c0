//! Connection Registry
//!
//! A ready-made `ConnectionHost` that tracks live connections by id, counts
//! lifecycle events and republishes them on a broadcast channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{ConnectionHost, FramingPolicy, RawFraming};
use crate::connection::{ConnectionId, ManagedConnection, PayloadTransform};
use crate::error::AcceptorError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MAX_RETAINED_EXCEPTIONS: usize = 256;

/// Something the registry observed
#[derive(Debug, Clone)]
pub enum HostEvent {
    Added(ConnectionId),
    Removed(ConnectionId),
    Exception(String),
    Received { id: ConnectionId, payload: Bytes },
}

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub total_added: usize,
    pub total_removed: usize,
    pub total_exceptions: usize,
    pub payloads_delivered: usize,
}

#[derive(Debug, Default)]
struct Counters {
    added: AtomicUsize,
    removed: AtomicUsize,
    exceptions: AtomicUsize,
    delivered: AtomicUsize,
}

/// Host implementation keyed by connection id
pub struct ConnectionRegistry {
    socket_buffer_size: usize,
    framing: Arc<dyn FramingPolicy>,
    compressor: Option<Arc<dyn PayloadTransform>>,
    echo: bool,
    connections: RwLock<HashMap<ConnectionId, Arc<ManagedConnection>>>,
    recent_exceptions: Mutex<VecDeque<String>>,
    counters: Counters,
    events: broadcast::Sender<HostEvent>,
}

impl ConnectionRegistry {
    /// Create a registry with raw framing and no compressor
    pub fn new(socket_buffer_size: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            socket_buffer_size,
            framing: Arc::new(RawFraming),
            compressor: None,
            echo: false,
            connections: RwLock::new(HashMap::new()),
            recent_exceptions: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            events,
        }
    }

    /// Use a different framing policy
    pub fn with_framing(mut self, framing: Arc<dyn FramingPolicy>) -> Self {
        self.framing = framing;
        self
    }

    /// Supply a compressor for connections configured for compression
    pub fn with_compressor(mut self, compressor: Arc<dyn PayloadTransform>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Send every delivered payload straight back to its connection
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Look up a live connection
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ManagedConnection>> {
        self.read_connections().get(id).cloned()
    }

    /// All live connections
    pub fn connections(&self) -> Vec<Arc<ManagedConnection>> {
        self.read_connections().values().cloned().collect()
    }

    /// Number of live connections
    pub fn active_count(&self) -> usize {
        self.read_connections().len()
    }

    /// Most recent exception messages, oldest first
    pub fn exceptions(&self) -> Vec<String> {
        self.recent_exceptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_connections: self.active_count(),
            total_added: self.counters.added.load(Ordering::Relaxed),
            total_removed: self.counters.removed.load(Ordering::Relaxed),
            total_exceptions: self.counters.exceptions.load(Ordering::Relaxed),
            payloads_delivered: self.counters.delivered.load(Ordering::Relaxed),
        }
    }

    /// Wait until every registered connection has been removed.
    ///
    /// Returns `false` if connections were still registered when the timeout
    /// elapsed.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let start_time = Instant::now();
        let mut last_count = self.active_count();

        while last_count > 0 {
            if start_time.elapsed() >= timeout {
                warn!("{} connections still registered after {:?}", last_count, timeout);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;

            let current_count = self.active_count();
            if current_count != last_count {
                debug!("Registered connections: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        true
    }

    fn read_connections(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Arc<ManagedConnection>>> {
        self.connections.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_connections(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<ManagedConnection>>> {
        self.connections.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: HostEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl ConnectionHost for ConnectionRegistry {
    fn socket_buffer_size(&self) -> usize {
        self.socket_buffer_size
    }

    fn framing(&self) -> Arc<dyn FramingPolicy> {
        Arc::clone(&self.framing)
    }

    fn compressor(&self) -> Option<Arc<dyn PayloadTransform>> {
        self.compressor.clone()
    }

    fn add_connection(&self, conn: Arc<ManagedConnection>) {
        let id = conn.id();
        let peer = conn.peer_addr();

        let previous = self.write_connections().insert(id, conn);
        if previous.is_some() {
            error!("Connection {} was registered twice", id);
        }

        self.counters.added.fetch_add(1, Ordering::Relaxed);
        info!("Registered connection {} from {}", id, peer);
        self.publish(HostEvent::Added(id));
    }

    fn remove_connection(&self, conn: &Arc<ManagedConnection>) {
        let id = conn.id();

        match self.write_connections().remove(&id) {
            Some(removed) => {
                self.counters.removed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Unregistered connection {} from {} after {:?}",
                    id,
                    removed.peer_addr(),
                    removed.age()
                );
                self.publish(HostEvent::Removed(id));
            }
            None => {
                warn!("Removal requested for unknown connection {}", id);
            }
        }
    }

    fn report_exception(&self, err: &AcceptorError) {
        error!("Connection error: {}", err);
        self.counters.exceptions.fetch_add(1, Ordering::Relaxed);

        let message = err.to_string();
        {
            let mut recent = self
                .recent_exceptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if recent.len() == MAX_RETAINED_EXCEPTIONS {
                recent.pop_front();
            }
            recent.push_back(message.clone());
        }

        self.publish(HostEvent::Exception(message));
    }

    fn deliver(&self, conn: &Arc<ManagedConnection>, payload: Bytes) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        debug!("Connection {} delivered {} bytes", conn.id(), payload.len());

        if self.echo {
            if let Err(e) = conn.send(payload.clone()) {
                warn!("Failed to echo payload on {}: {}", conn.id(), e);
            }
        }

        self.publish(HostEvent::Received {
            id: conn.id(),
            payload,
        });
    }
}
