//! Backend connection establishment.
//!
//! # Responsibilities
//! - Open a connection to a selected peer, preferring an idle pooled one
//! - Take connections back once an attempt is over
//!
//! # Design Decisions
//! - The connect deadline is applied by the caller, so every connector
//!   gets the same timeout handling
//! - `release` is called exactly once per successful `connect`

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::load_balancer::PeerPick;
use crate::net::keepalive::KeepalivePool;
use crate::net::BoxedStream;

/// An open backend connection owned by one upstream request.
pub struct BackendConnection {
    pub stream: BoxedStream,
    pub addr: SocketAddr,
    /// Came out of the keepalive pool.
    pub reused: bool,
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("addr", &self.addr)
            .field("reused", &self.reused)
            .finish()
    }
}

#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, peer: &PeerPick) -> io::Result<BackendConnection>;

    /// Give a connection back; `reusable` when the response was fully read
    /// and the backend did not ask to close.
    fn release(&self, conn: BackendConnection, reusable: bool);

    /// Connections may be kept open between requests.
    fn keepalive(&self) -> bool {
        false
    }
}

/// Plain TCP connector with an optional idle pool.
#[derive(Debug, Default)]
pub struct TcpConnector {
    pool: Option<Arc<KeepalivePool>>,
}

impl TcpConnector {
    pub fn new(pool: Option<Arc<KeepalivePool>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &PeerPick) -> io::Result<BackendConnection> {
        if let Some(stream) = self.pool.as_ref().and_then(|p| p.take(peer.addr)) {
            tracing::trace!(peer = %peer.addr, "Reusing keepalive connection");
            return Ok(BackendConnection {
                stream,
                addr: peer.addr,
                reused: true,
            });
        }

        let stream = TcpStream::connect(peer.addr).await?;
        stream.set_nodelay(true)?;
        Ok(BackendConnection {
            stream: Box::new(stream),
            addr: peer.addr,
            reused: false,
        })
    }

    fn release(&self, conn: BackendConnection, reusable: bool) {
        match &self.pool {
            Some(pool) if reusable => pool.put(conn.addr, conn.stream),
            _ => drop(conn),
        }
    }

    fn keepalive(&self) -> bool {
        self.pool.is_some()
    }
}
