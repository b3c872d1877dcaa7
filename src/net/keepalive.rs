//! Idle backend connection cache.
//!
//! # Responsibilities
//! - Keep up to `capacity` idle connections per upstream group
//! - Hand back the most recently parked connection for an address
//! - Drop connections that idled for too long
//!
//! # Design Decisions
//! - No liveness probe on checkout: a parked connection the backend has
//!   since closed fails on first use and is retried at no cost

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::net::BoxedStream;

const MAX_IDLE_AGE: Duration = Duration::from_secs(60);

struct Idle {
    addr: SocketAddr,
    stream: BoxedStream,
    parked: Instant,
}

/// LRU cache of idle connections for one group.
pub struct KeepalivePool {
    capacity: usize,
    max_idle: Duration,
    idle: Mutex<VecDeque<Idle>>,
}

impl fmt::Debug for KeepalivePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepalivePool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl KeepalivePool {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_idle(capacity, MAX_IDLE_AGE)
    }

    pub fn with_max_idle(capacity: usize, max_idle: Duration) -> Self {
        Self {
            capacity,
            max_idle,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Most recently parked live connection to `addr`.
    pub fn take(&self, addr: SocketAddr) -> Option<BoxedStream> {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let max_idle = self.max_idle;
        idle.retain(|c| c.parked.elapsed() < max_idle);

        let pos = idle.iter().rposition(|c| c.addr == addr)?;
        idle.remove(pos).map(|c| c.stream)
    }

    /// Park a connection, evicting the oldest one when full.
    pub fn put(&self, addr: SocketAddr, stream: BoxedStream) {
        if self.capacity == 0 {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        if idle.len() >= self.capacity {
            idle.pop_front();
        }
        idle.push_back(Idle {
            addr,
            stream,
            parked: Instant::now(),
        });
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}
