//! TermLink Library
//!
//! The connection endpoint embedded in the terminal application: an
//! asynchronous acceptor that keeps a fixed number of accept operations in
//! flight, and the lifecycle management of every connection it produces.
//!
//! The application plugs in through [`host::ConnectionHost`]; it never
//! reaches into acceptor or connection internals.

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod shutdown;

pub use acceptor::ConnectionAcceptor;
pub use config::{Config, ListenerConfig};
pub use connection::{ConnectionId, ConnectionState, DisconnectCause, ManagedConnection};
pub use connector::OutboundConnector;
pub use error::{AcceptorError, ConnectionError};
pub use host::{ConnectionHost, ConnectionRegistry};
pub use lifecycle::{ConnectionCreator, ConnectionLifecycle, Creator, CreatorState};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application-level plumbing
pub type Result<T> = anyhow::Result<T>;
