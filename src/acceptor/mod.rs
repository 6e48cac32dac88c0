//! Connection Acceptor Module
//!
//! Listens on an endpoint and turns inbound transports into managed
//! connections.

pub mod listener;
pub mod stats;
pub mod transport;

pub use listener::ConnectionAcceptor;
pub use stats::{AcceptorStats, AcceptorStatsSnapshot};
pub use transport::{AcceptFuture, Bind, Listen, TcpBinder};
