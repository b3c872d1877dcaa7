//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Client side:
//!     listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking for graceful shutdown)
//!     → Hand off to HTTP layer
//!
//! Backend side:
//!     connector.rs (keepalive.rs idle pool first, then TCP connect)
//!     → tls.rs (optional TLS handshake on fresh connections)
//!     → Hand off to the upstream request
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Byte streams are boxed trait objects so TLS, TCP and in-memory test
//!   pipes share one code path

pub mod connection;
pub mod connector;
pub mod keepalive;
pub mod listener;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;
