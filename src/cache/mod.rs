//! Response cache collaborator.
//!
//! # Data Flow
//! ```text
//! Upstream request (before the first connect):
//!     → lookup(key): Hit | Miss | Stale | Updating
//!     → Hit: served without contacting a backend
//!     → Miss/Stale: begin_write(key) claims the entry
//! Finalization:
//!     → commit(handle, response) when the body is complete and cacheable
//!     → abandon(handle) otherwise
//! ```
//!
//! # Design Decisions
//! - The upstream core only sees this trait; it never knows how entries
//!   are stored
//! - One writer per key; a second request sees `Updating` while the
//!   first one refreshes an expired entry

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;

use crate::upstream::headers::OutboundHeaders;

pub use memory::MemoryCache;

/// A complete response as stored.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: OutboundHeaders,
    pub body: Bytes,
    pub stored_at: SystemTime,
    pub valid_for: Duration,
}

impl CachedResponse {
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        match now.duration_since(self.stored_at) {
            Ok(age) => age < self.valid_for,
            Err(_) => true,
        }
    }
}

/// Result of a lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(Arc<CachedResponse>),
    Miss,
    /// Expired, nobody is refreshing it.
    Stale(Arc<CachedResponse>),
    /// Expired, another request is refreshing it.
    Updating(Arc<CachedResponse>),
}

impl Lookup {
    pub fn label(&self) -> &'static str {
        match self {
            Lookup::Hit(_) => "hit",
            Lookup::Miss => "miss",
            Lookup::Stale(_) => "stale",
            Lookup::Updating(_) => "updating",
        }
    }
}

/// Exclusive right to write one key.
#[derive(Debug, PartialEq, Eq)]
pub struct WriteHandle {
    pub key: String,
    token: u64,
}

impl WriteHandle {
    pub(crate) fn new(key: String, token: u64) -> Self {
        Self { key, token }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("write handle for \"{0}\" no longer owns the entry")]
    LostOwnership(String),
}

pub trait Cache: Send + Sync + fmt::Debug {
    fn lookup(&self, key: &str) -> Lookup;

    /// Claim `key` for writing. `None` when another writer holds it.
    fn begin_write(&self, key: &str) -> Option<WriteHandle>;

    fn commit(&self, handle: WriteHandle, response: CachedResponse) -> Result<(), CacheError>;

    fn abandon(&self, handle: WriteHandle);
}
