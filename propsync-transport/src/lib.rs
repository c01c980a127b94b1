//! # propsync-transport
//!
//! Unix domain socket transport for propsync.
//!
//! This crate provides:
//! - Endpoint naming (Linux abstract namespace or filesystem paths)
//! - Framed connections driven by the protocol crate's frame decoder
//! - A connection acceptor with a connection cap
//! - A reconnecting client with randomized exponential backoff

pub mod acceptor;
pub mod backoff;
pub mod client;
pub mod connection;
pub mod endpoint;
pub mod error;

pub use acceptor::{AcceptorConfig, ConnectionAcceptor, DEFAULT_MAX_CONNECTIONS};
pub use backoff::{Backoff, BackoffConfig};
pub use client::ReconnectingClient;
pub use connection::{ConnectionHandler, ConnectionId, FramedConnection};
pub use endpoint::Endpoint;
pub use error::TransportError;
