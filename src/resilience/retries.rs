//! Retry classification and budget.
//!
//! # Responsibilities
//! - Classify a failed attempt into a `FailureKind`
//! - Map a kind to the status a client sees when retries stop
//! - Track the per-request attempt budget and cross-attempt deadline
//!
//! # Design Decisions
//! - The set of retryable kinds is a bitmask built once from config
//! - A budget is decremented when a peer is released, never on connect
//! - The deadline is measured from the first attempt's start

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Why an attempt against one backend did not produce a usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Socket-level failure while connecting, sending or receiving.
    Error,
    Timeout,
    /// Unparseable or oversized response head.
    InvalidHeader,
    Http500,
    Http502,
    Http503,
    Http504,
    Http403,
    Http404,
    /// No peer left to try.
    NoLive,
}

impl FailureKind {
    const ALL: [FailureKind; 10] = [
        FailureKind::Error,
        FailureKind::Timeout,
        FailureKind::InvalidHeader,
        FailureKind::Http500,
        FailureKind::Http502,
        FailureKind::Http503,
        FailureKind::Http504,
        FailureKind::Http403,
        FailureKind::Http404,
        FailureKind::NoLive,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Kind for an upstream status in the retryable error class.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            500 => Some(FailureKind::Http500),
            502 => Some(FailureKind::Http502),
            503 => Some(FailureKind::Http503),
            504 => Some(FailureKind::Http504),
            403 => Some(FailureKind::Http403),
            404 => Some(FailureKind::Http404),
            _ => None,
        }
    }

    /// Status surfaced to the client when this failure ends the request.
    pub fn terminal_status(self) -> u16 {
        match self {
            FailureKind::Timeout => 504,
            FailureKind::Http500 => 500,
            FailureKind::Http403 => 403,
            FailureKind::Http404 => 404,
            _ => 502,
        }
    }

    /// 403/404 say nothing about the peer's health.
    pub fn counts_against_peer(self) -> bool {
        !matches!(self, FailureKind::Http403 | FailureKind::Http404)
    }

    pub fn name(self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::InvalidHeader => "invalid_header",
            FailureKind::Http500 => "http_500",
            FailureKind::Http502 => "http_502",
            FailureKind::Http503 => "http_503",
            FailureKind::Http504 => "http_504",
            FailureKind::Http403 => "http_403",
            FailureKind::Http404 => "http_404",
            FailureKind::NoLive => "no_live",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown failure kind \"{0}\"")]
pub struct UnknownFailureKind(pub String);

/// Set of failure kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureMask(u16);

impl FailureMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, kind: FailureKind) -> Self {
        self.0 |= kind.bit();
        self
    }

    pub fn contains(&self, kind: FailureKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse config names; "off" clears the set. Unknown names are
    /// returned to the caller, `extra` lists names it handles itself.
    pub fn parse<'a, I>(names: I, extra: &[&str]) -> Result<Self, UnknownFailureKind>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut mask = Self::empty();
        for name in names {
            let name = name.trim().to_ascii_lowercase();
            if name == "off" {
                mask = Self::empty();
                continue;
            }
            if extra.contains(&name.as_str()) {
                continue;
            }
            match FailureKind::ALL
                .iter()
                .find(|k| k.name() == name && **k != FailureKind::NoLive)
            {
                Some(kind) => mask = mask.with(*kind),
                None => return Err(UnknownFailureKind(name)),
            }
        }
        Ok(mask)
    }
}

/// Attempts left for one request plus the overall retry deadline.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    tries: usize,
    started: Instant,
    deadline: Option<Duration>,
}

impl RetryBudget {
    /// `cap` of zero keeps the peer-derived count.
    pub fn new(peer_tries: usize, cap: usize, deadline: Option<Duration>) -> Self {
        let tries = if cap > 0 { peer_tries.min(cap) } else { peer_tries };
        Self {
            tries,
            started: Instant::now(),
            deadline,
        }
    }

    pub fn remaining(&self) -> usize {
        self.tries
    }

    /// One attempt has been spent.
    pub fn consume(&mut self) {
        self.tries = self.tries.saturating_sub(1);
    }

    /// Give back an attempt that should not count (pooled connection
    /// failing before anything was sent).
    pub fn refund(&mut self) {
        self.tries += 1;
    }

    pub fn deadline_elapsed(&self) -> bool {
        match self.deadline {
            Some(limit) => self.started.elapsed() >= limit,
            None => false,
        }
    }
}
