//! Shared helpers for integration tests: an in-memory listening transport,
//! a transport whose shutdown fails, a sampling host and event-waiting
//! utilities.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};

use termlink::acceptor::{AcceptFuture, Bind, Listen};
use termlink::connection::{ManagedConnection, PayloadTransform};
use termlink::host::{ConnectionHost, ConnectionRegistry, FramingPolicy, HostEvent};
use termlink::AcceptorError;

type Incoming = io::Result<(DuplexStream, SocketAddr)>;

pub const MOCK_ENDPOINT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4040);
const DUPLEX_CAPACITY: usize = 8192;

/// Test-side controls for a mock listener
#[derive(Clone)]
pub struct MockHandle {
    incoming: mpsc::UnboundedSender<Incoming>,
    accept_calls: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    poisoned: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl MockHandle {
    /// Complete one outstanding accept with a fresh in-memory stream.
    ///
    /// Returns the client end; dropping it closes the connection.
    pub fn connect(&self, peer_port: u16) -> DuplexStream {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), peer_port);
        // A closed listener simply never sees it
        let _ = self.incoming.send(Ok((server, peer)));
        client
    }

    /// Complete one outstanding accept with an error
    pub fn fail_accept(&self, kind: io::ErrorKind) {
        let _ = self
            .incoming
            .send(Err(io::Error::new(kind, "mock accept failure")));
    }

    /// Make `prepare` fail for streams from this peer port
    pub fn poison(&self, peer_port: u16) {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), peer_port);
        self.poisoned.lock().unwrap().insert(peer);
    }

    /// Accept operations issued so far
    pub fn accept_calls(&self) -> usize {
        self.accept_calls.load(Ordering::SeqCst)
    }

    /// Accept operations issued and not yet resolved or abandoned
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Binds `MockListener`s, or fails to when asked to
pub struct MockBinder {
    listener: Mutex<Option<MockListener>>,
    fail_bind: bool,
}

pub struct MockListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    accept_calls: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    poisoned: Arc<Mutex<HashSet<SocketAddr>>>,
}

/// Counts one accept as pending until it resolves or is dropped
struct PendingAccept(Arc<AtomicUsize>);

impl PendingAccept {
    fn issue(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(pending))
    }
}

impl Drop for PendingAccept {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn mock_transport() -> (MockBinder, MockHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let accept_calls = Arc::new(AtomicUsize::new(0));
    let pending = Arc::new(AtomicUsize::new(0));
    let poisoned = Arc::new(Mutex::new(HashSet::new()));

    let listener = MockListener {
        incoming: tokio::sync::Mutex::new(rx),
        accept_calls: Arc::clone(&accept_calls),
        pending: Arc::clone(&pending),
        poisoned: Arc::clone(&poisoned),
    };
    let binder = MockBinder {
        listener: Mutex::new(Some(listener)),
        fail_bind: false,
    };
    let handle = MockHandle {
        incoming: tx,
        accept_calls,
        pending,
        poisoned,
    };

    (binder, handle)
}

impl MockBinder {
    /// A binder whose bind always fails with `AddrInUse`
    pub fn failing() -> Self {
        Self {
            listener: Mutex::new(None),
            fail_bind: true,
        }
    }
}

impl Bind for MockBinder {
    type Listener = MockListener;

    fn bind(&self, _endpoint: SocketAddr, _backlog: u32, _buffer_size: usize) -> io::Result<MockListener> {
        if self.fail_bind {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "mock endpoint in use"));
        }
        self.listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mock listener already bound"))
    }
}

impl Listen for MockListener {
    type Stream = DuplexStream;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(MOCK_ENDPOINT)
    }

    fn accept(self: Arc<Self>) -> AcceptFuture<DuplexStream> {
        self.accept_calls.fetch_add(1, Ordering::SeqCst);
        let pending = PendingAccept::issue(&self.pending);
        Box::pin(async move {
            let _pending = pending;
            let mut incoming = self.incoming.lock().await;
            match incoming.recv().await {
                Some(result) => result,
                None => std::future::pending().await,
            }
        })
    }

    fn prepare(&self, _stream: &DuplexStream, peer: SocketAddr) -> io::Result<()> {
        if self.poisoned.lock().unwrap().contains(&peer) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "mock prepare failure"));
        }
        Ok(())
    }
}

/// In-memory transport whose orderly shutdown always fails
pub struct BrokenShutdown(DuplexStream);

impl BrokenShutdown {
    /// Returns the transport and the peer end
    pub fn pair() -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        (Self(server), client)
    }
}

impl AsyncRead for BrokenShutdown {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for BrokenShutdown {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "shutdown refused")))
    }
}

type Sampler = Box<dyn Fn() -> (usize, usize) + Send + Sync>;

/// Registry wrapper that takes a sample each time a connection is added
pub struct SamplingHost {
    inner: Arc<ConnectionRegistry>,
    sampler: OnceLock<Sampler>,
    samples: Mutex<Vec<(usize, usize)>>,
}

impl SamplingHost {
    pub fn new(inner: Arc<ConnectionRegistry>) -> Self {
        Self {
            inner,
            sampler: OnceLock::new(),
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Install the sampler; only the first call takes effect
    pub fn sample_with<F>(&self, sampler: F)
    where
        F: Fn() -> (usize, usize) + Send + Sync + 'static,
    {
        let _ = self.sampler.set(Box::new(sampler));
    }

    /// Samples in registration order
    pub fn samples(&self) -> Vec<(usize, usize)> {
        self.samples.lock().unwrap().clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner
    }
}

impl ConnectionHost for SamplingHost {
    fn socket_buffer_size(&self) -> usize {
        self.inner.socket_buffer_size()
    }

    fn framing(&self) -> Arc<dyn FramingPolicy> {
        self.inner.framing()
    }

    fn compressor(&self) -> Option<Arc<dyn PayloadTransform>> {
        self.inner.compressor()
    }

    fn add_connection(&self, conn: Arc<ManagedConnection>) {
        if let Some(sampler) = self.sampler.get() {
            let sample = sampler();
            self.samples.lock().unwrap().push(sample);
        }
        self.inner.add_connection(conn);
    }

    fn remove_connection(&self, conn: &Arc<ManagedConnection>) {
        self.inner.remove_connection(conn);
    }

    fn report_exception(&self, err: &AcceptorError) {
        self.inner.report_exception(err);
    }

    fn deliver(&self, conn: &Arc<ManagedConnection>, payload: Bytes) {
        self.inner.deliver(conn, payload);
    }
}

/// Wait for the next event matching `predicate`, skipping others
pub async fn next_event<F>(events: &mut broadcast::Receiver<HostEvent>, predicate: F) -> HostEvent
where
    F: Fn(&HostEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for host event")
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}
