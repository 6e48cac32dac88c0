//! Connection Host
//!
//! The host is the application's side of the seam: it keeps the registry of
//! live connections, receives error reports and supplies the buffer-size and
//! framing policy every new connection is built with.

pub mod registry;

pub use registry::{ConnectionRegistry, HostEvent, RegistryStats};

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::connection::{ManagedConnection, PayloadTransform};
use crate::error::AcceptorError;

/// Callbacks and policy the acceptor and its connections rely on
pub trait ConnectionHost: Send + Sync + 'static {
    /// Socket buffer size applied to every new transport
    fn socket_buffer_size(&self) -> usize;

    /// Framing policy handed to every new connection
    fn framing(&self) -> Arc<dyn FramingPolicy>;

    /// Compressor used when a connection is configured for compression
    fn compressor(&self) -> Option<Arc<dyn PayloadTransform>> {
        None
    }

    /// A connection was constructed and is about to be initialized
    fn add_connection(&self, conn: Arc<ManagedConnection>);

    /// A connection finished disconnecting
    fn remove_connection(&self, conn: &Arc<ManagedConnection>);

    /// An error that no connection could absorb
    fn report_exception(&self, err: &AcceptorError);

    /// A decoded inbound payload
    fn deliver(&self, _conn: &Arc<ManagedConnection>, _payload: Bytes) {}
}

/// Splits an inbound byte stream into messages and frames outbound ones
pub trait FramingPolicy: Send + Sync + fmt::Debug {
    /// Take the next complete message out of `src`, if one is buffered
    fn decode(&self, src: &mut BytesMut) -> anyhow::Result<Option<Bytes>>;

    /// Append the framed form of `payload` to `dst`
    fn encode(&self, payload: Bytes, dst: &mut BytesMut) -> anyhow::Result<()>;
}

/// Pass-through framing: whatever has arrived is one message
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFraming;

impl FramingPolicy for RawFraming {
    fn decode(&self, src: &mut BytesMut) -> anyhow::Result<Option<Bytes>> {
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split().freeze()))
        }
    }

    fn encode(&self, payload: Bytes, dst: &mut BytesMut) -> anyhow::Result<()> {
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_framing_takes_everything_buffered() {
        let framing = RawFraming;
        let mut buf = BytesMut::from(&b"ls -la\n"[..]);

        let frame = framing.decode(&mut buf).unwrap();
        assert_eq!(frame.as_deref(), Some(&b"ls -la\n"[..]));
        assert!(buf.is_empty());
        assert!(framing.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_raw_framing_encode_appends() {
        let framing = RawFraming;
        let mut dst = BytesMut::from(&b"a"[..]);
        framing.encode(Bytes::from_static(b"bc"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"abc");
    }
}
