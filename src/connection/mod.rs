//! Connection Management Module
//!
//! Managed connections and the payload pipeline they apply.

pub mod managed;
pub mod pipeline;

pub use managed::{
    BoxedTransport, ConnectionId, ConnectionOrigin, ConnectionState, DisconnectCause, ManagedConnection, Transport,
};
pub use pipeline::{CompressionMode, PayloadTransform, Pipeline, SecurityMode};
