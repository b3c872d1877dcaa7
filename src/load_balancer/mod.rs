//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → upstream group identified
//!     → pool.rs (registry: group name → selector + connector)
//!     → PeerSelector::init (per-request PeerSet)
//!     → PeerSet::get_next (round_robin.rs, smooth weights)
//!     → attempt against the peer
//!     → PeerSet::report_outcome (success / failed / next / down)
//! ```
//!
//! # Design Decisions
//! - Selection state is shared per group; the per-request view only
//!   remembers which servers were already tried
//! - Every `get_next` is paired with exactly one `report_outcome`
//! - Backup servers are only used once the primary tier is exhausted

pub mod backend;
pub mod pool;
pub mod round_robin;

use std::fmt;
use std::net::SocketAddr;

pub use pool::{RegistryError, UpstreamHandle, UpstreamRegistry};
pub use round_robin::RoundRobin;

/// A server handed out for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPick {
    pub addr: SocketAddr,
    /// Declared name, used for Host/SNI.
    pub name: String,
    /// Position inside its tier.
    pub index: usize,
    pub backup: bool,
}

impl fmt::Display for PeerPick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// How an attempt against a peer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    Success,
    /// Counts towards `max_fails`.
    Failed,
    /// Move on without blaming the peer (403/404, stale keepalive).
    Next,
    PermanentlyDown,
}

/// Group-wide selector shared by all requests.
pub trait PeerSelector: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Per-request peer set.
    fn init(&self) -> Box<dyn PeerSet>;
}

/// Per-request view of a group.
pub trait PeerSet: Send {
    /// Attempts this group allows for one request.
    fn tries(&self) -> usize;

    /// Next server to try, `None` when no live server is left.
    fn get_next(&mut self) -> Option<PeerPick>;

    fn report_outcome(&mut self, peer: &PeerPick, outcome: PeerOutcome);
}
