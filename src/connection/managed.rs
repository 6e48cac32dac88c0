//! Managed Connection Implementation
//!
//! A `ManagedConnection` owns one accepted (or dialed) transport together
//! with its I/O task and its disconnect procedure.
//!
//! ```text
//! Created ──initialize──▶ Active ──begin_disconnect──▶ Disconnecting ──▶ Disposed
//!    └──────────begin_disconnect────────────────────────▲
//! ```
//!
//! Exactly one party ever holds the transport: the connection itself until
//! `initialize` hands it to the I/O task, or whichever of the two performs
//! the final shutdown. That party disposes the connection, so the host sees
//! exactly one `remove_connection` per connection no matter how many
//! disconnect requests race.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::pipeline::{Pipeline, SecurityMode};
use crate::config::ListenerConfig;
use crate::error::{AcceptorError, ConnectionError};
use crate::host::{ConnectionHost, FramingPolicy};
use crate::lifecycle::{wait_closed, ConnectionLifecycle};

/// Smallest read buffer a connection will use regardless of host policy
const MIN_READ_BUFFER: usize = 512;

/// Any bidirectional byte stream a connection can run over
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased transport owned by a connection
pub type BoxedTransport = Box<dyn Transport>;

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new unique connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Created = 0,
    Active = 1,
    Disconnecting = 2,
    /// Terminal
    Disposed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::Active,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disposed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Created => "created",
            ConnectionState::Active => "active",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// How the transport came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    Accepted,
    Connected,
}

/// Why a connection is going away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The application asked for it
    Local,
    /// The peer closed its side
    RemoteClosed,
    /// Application shutdown
    Shutdown,
    /// An unrecoverable error on this connection
    Fault(String),
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::Local => write!(f, "closed locally"),
            DisconnectCause::RemoteClosed => write!(f, "closed by peer"),
            DisconnectCause::Shutdown => write!(f, "shutdown"),
            DisconnectCause::Fault(reason) => write!(f, "fault: {}", reason),
        }
    }
}

/// One transport under lifecycle management
pub struct ManagedConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    origin: ConnectionOrigin,
    created_at: Instant,
    owner: Weak<ConnectionLifecycle>,
    config: Arc<ListenerConfig>,
    host: Arc<dyn ConnectionHost>,
    framing: Arc<dyn FramingPolicy>,
    buffer_size: usize,
    state: AtomicU8,
    /// Held until the I/O task or the disconnect path takes it
    transport: Mutex<Option<BoxedTransport>>,
    pipeline: OnceLock<Pipeline>,
    outbound: OnceLock<mpsc::UnboundedSender<Bytes>>,
    closing: watch::Sender<bool>,
    cause: Mutex<Option<DisconnectCause>>,
}

impl ManagedConnection {
    /// Wrap a transport for the given lifecycle owner.
    ///
    /// Fails when the configured security mode cannot be honoured; in that
    /// case no connection exists and the transport is dropped.
    pub fn new(
        owner: &Arc<ConnectionLifecycle>,
        transport: BoxedTransport,
        peer_addr: SocketAddr,
        origin: ConnectionOrigin,
    ) -> Result<Arc<Self>, ConnectionError> {
        let config = Arc::clone(owner.config());
        if config.security() == SecurityMode::Encrypted && config.crypto_provider().is_none() {
            return Err(ConnectionError::MissingCryptoProvider(config.security()));
        }

        let host = Arc::clone(owner.host());
        let (closing, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            peer_addr,
            origin,
            created_at: Instant::now(),
            owner: Arc::downgrade(owner),
            framing: host.framing(),
            buffer_size: host.socket_buffer_size().max(MIN_READ_BUFFER),
            config,
            host,
            state: AtomicU8::new(ConnectionState::Created as u8),
            transport: Mutex::new(Some(transport)),
            pipeline: OnceLock::new(),
            outbound: OnceLock::new(),
            closing,
            cause: Mutex::new(None),
        });

        debug!("Created connection {} for {} ({:?})", conn.id, peer_addr, origin);
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Time since the connection was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The cause recorded by the first disconnect request
    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        self.lock_cause().clone()
    }

    /// Names of the payload stages, empty until initialized
    pub fn pipeline_stages(&self) -> Vec<String> {
        self.pipeline.get().map(Pipeline::stage_names).unwrap_or_default()
    }

    /// Apply the security/compression pipeline and start the I/O task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Created {
            return Err(self.invalid_state(ConnectionState::Created, state));
        }

        let pipeline = Pipeline::build(
            self.config.security(),
            self.config.compression(),
            self.config.crypto_provider(),
            self.host.compressor(),
        )?;

        let Some(transport) = self.lock_transport().take() else {
            // A disconnect got here first
            return Err(self.invalid_state(ConnectionState::Created, self.state()));
        };

        let stages = pipeline.stage_names();
        let _ = self.pipeline.set(pipeline);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.outbound.set(outbound_tx);

        let closing = self.closing.subscribe();
        tokio::spawn(Arc::clone(self).run(transport, outbound_rx, closing));

        match self.transition(ConnectionState::Created, ConnectionState::Active) {
            Ok(()) => {
                info!(
                    "Connection {} from {} is active (pipeline: {})",
                    self.id,
                    self.peer_addr,
                    if stages.is_empty() { "passthrough".to_string() } else { stages.join(" -> ") }
                );
            }
            Err(actual) => {
                debug!("Connection {} became {} during initialization", self.id, actual);
            }
        }

        Ok(())
    }

    /// Queue a payload for sending.
    ///
    /// Any failure here is unrecoverable for the connection and starts its
    /// disconnect.
    pub fn send(self: &Arc<Self>, payload: Bytes) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Active {
            return Err(ConnectionError::NotActive(self.id));
        }

        let result = self.frame_outbound(payload).and_then(|frame| {
            let outbound = self.outbound.get().ok_or(ConnectionError::NotActive(self.id))?;
            outbound
                .send(frame)
                .map_err(|_| ConnectionError::OutboundClosed(self.id))
        });

        if let Err(ref e) = result {
            self.begin_disconnect(DisconnectCause::Fault(e.to_string()));
        }
        result
    }

    /// Start disconnecting.
    ///
    /// Returns `true` if this call initiated the disconnect and `false` if one
    /// was already under way or finished.
    pub fn begin_disconnect(self: &Arc<Self>, cause: DisconnectCause) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            match ConnectionState::from_u8(current) {
                ConnectionState::Disconnecting | ConnectionState::Disposed => {
                    debug!("Connection {} already disconnecting, ignoring ({})", self.id, cause);
                    return false;
                }
                ConnectionState::Created | ConnectionState::Active => {}
            }

            match self.state.compare_exchange(
                current,
                ConnectionState::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        match &cause {
            DisconnectCause::Fault(reason) => {
                warn!("Disconnecting {} from {}: {}", self.id, self.peer_addr, reason)
            }
            _ => info!("Disconnecting {} from {} ({})", self.id, self.peer_addr, cause),
        }
        *self.lock_cause() = Some(cause);

        self.closing.send_replace(true);

        // Never handed to an I/O task: shut it down here
        let idle = self.lock_transport().take();
        if let Some(mut transport) = idle {
            let conn = Arc::clone(self);
            tokio::spawn(async move {
                let result = transport.shutdown().await;
                conn.finish(result);
            });
        }

        true
    }

    #[instrument(skip_all, fields(connection_id = %self.id, peer = %self.peer_addr))]
    async fn run(
        self: Arc<Self>,
        transport: BoxedTransport,
        mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
        mut closing: watch::Receiver<bool>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(transport);
        let mut buffer = BytesMut::with_capacity(self.buffer_size);

        let cause = loop {
            tokio::select! {
                _ = wait_closed(&mut closing) => break None,
                read = reader.read_buf(&mut buffer) => match read {
                    Ok(0) => break Some(DisconnectCause::RemoteClosed),
                    Ok(n) => {
                        trace!("Read {} bytes", n);
                        if let Err(e) = self.dispatch_inbound(&mut buffer) {
                            break Some(DisconnectCause::Fault(e.to_string()));
                        }
                    }
                    Err(e) => break Some(DisconnectCause::Fault(format!("read failed: {}", e))),
                },
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = writer.write_all(&frame).await {
                        break Some(DisconnectCause::Fault(format!("write failed: {}", e)));
                    }
                }
            }
        };

        if let Some(cause) = cause {
            self.begin_disconnect(cause);
        }

        let result = writer.shutdown().await;
        self.finish(result);
    }

    fn dispatch_inbound(self: &Arc<Self>, buffer: &mut BytesMut) -> Result<(), ConnectionError> {
        let pipeline = self.pipeline.get().ok_or(ConnectionError::NotActive(self.id))?;

        while let Some(frame) = self
            .framing
            .decode(buffer)
            .map_err(|e| ConnectionError::Framing(e.into()))?
        {
            let payload = pipeline.decode(frame)?;
            self.host.deliver(self, payload);
        }
        Ok(())
    }

    fn frame_outbound(&self, payload: Bytes) -> Result<Bytes, ConnectionError> {
        let pipeline = self.pipeline.get().ok_or(ConnectionError::NotActive(self.id))?;
        let payload = pipeline.encode(payload)?;

        let mut frame = BytesMut::with_capacity(payload.len());
        self.framing
            .encode(payload, &mut frame)
            .map_err(|e| ConnectionError::Framing(e.into()))?;
        Ok(frame.freeze())
    }

    /// Final step of every disconnect: runs once, by whoever held the transport
    fn finish(self: &Arc<Self>, shutdown: io::Result<()>) {
        let previous = self.state.swap(ConnectionState::Disposed as u8, Ordering::SeqCst);
        if ConnectionState::from_u8(previous) == ConnectionState::Disposed {
            return;
        }

        match shutdown {
            Ok(()) => {}
            // The peer already tore the socket down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                debug!("Connection {} was already disconnected: {}", self.id, e);
            }
            Err(source) => {
                self.host.report_exception(&AcceptorError::Disconnect { id: self.id, source });
            }
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.release(&self.id);
        }
        self.host.remove_connection(self);

        info!("Connection {} from {} disposed after {:?}", self.id, self.peer_addr, self.age());
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    fn invalid_state(&self, expected: ConnectionState, actual: ConnectionState) -> ConnectionError {
        ConnectionError::InvalidState {
            id: self.id,
            expected,
            actual,
        }
    }

    fn lock_transport(&self) -> MutexGuard<'_, Option<BoxedTransport>> {
        self.transport.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cause(&self) -> MutexGuard<'_, Option<DisconnectCause>> {
        self.cause.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("origin", &self.origin)
            .field("state", &self.state())
            .finish()
    }
}
