//! Listening Transport
//!
//! The seam between the acceptor and the socket layer. `TcpBinder` is the
//! production implementation; anything that can hand out streams through
//! concurrent accept calls can stand in for it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use crate::connection::Transport;

/// An in-flight accept operation
pub type AcceptFuture<S> = Pin<Box<dyn Future<Output = io::Result<(S, SocketAddr)>> + Send + 'static>>;

/// Creates listening resources
pub trait Bind: Send + Sync + 'static {
    type Listener: Listen;

    /// Bind `endpoint` and start listening with the given backlog.
    ///
    /// `buffer_size` is the host's socket buffer policy.
    fn bind(&self, endpoint: SocketAddr, backlog: u32, buffer_size: usize) -> io::Result<Self::Listener>;
}

/// A bound listening resource that supports many outstanding accepts at once
pub trait Listen: Send + Sync + 'static {
    type Stream: Transport;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Issue one accept operation.
    ///
    /// The operation is issued when this is called; the returned future only
    /// reports its completion.
    fn accept(self: Arc<Self>) -> AcceptFuture<Self::Stream>;

    /// Apply per-stream options to a freshly accepted transport
    fn prepare(&self, stream: &Self::Stream, peer: SocketAddr) -> io::Result<()>;
}

/// Binds TCP listeners through `tokio::net::TcpSocket`
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBinder;

impl Bind for TcpBinder {
    type Listener = TcpListener;

    fn bind(&self, endpoint: SocketAddr, backlog: u32, buffer_size: usize) -> io::Result<TcpListener> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        #[cfg(unix)]
        socket.set_reuseaddr(true)?;

        // Accepted sockets inherit buffer sizes set before listen()
        let size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
        socket.set_recv_buffer_size(size)?;
        socket.set_send_buffer_size(size)?;

        socket.bind(endpoint)?;
        debug!("Bound TCP socket to {} (buffer size {})", endpoint, buffer_size);

        socket.listen(backlog)
    }
}

impl Listen for TcpListener {
    type Stream = TcpStream;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }

    fn accept(self: Arc<Self>) -> AcceptFuture<TcpStream> {
        Box::pin(async move { TcpListener::accept(&self).await })
    }

    fn prepare(&self, stream: &TcpStream, _peer: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_binder_accepts() {
        let listener = Arc::new(TcpBinder.bind("127.0.0.1:0".parse().unwrap(), 4, 8192).unwrap());
        let addr = Listen::local_addr(listener.as_ref()).unwrap();

        let accept = Arc::clone(&listener).accept();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = accept.await.unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        listener.prepare(&stream, peer).unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_binder_rejects_port_in_use() {
        let first = TcpBinder.bind("127.0.0.1:0".parse().unwrap(), 1, 8192).unwrap();
        let addr = Listen::local_addr(&first).unwrap();

        assert!(TcpBinder.bind(addr, 1, 8192).is_err());
    }
}
