//! Backend server abstraction.
//!
//! # Responsibilities
//! - Represent a single declared backend server
//! - Track smooth-weighted-round-robin weights
//! - Track failures inside the `fail_timeout` window

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;

/// Static description of a backend server.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Resolved socket address.
    pub addr: SocketAddr,
    /// Name as declared, used for Host/SNI and logs.
    pub name: String,
    pub weight: i64,
    pub max_fails: u32,
    pub fail_timeout: Duration,
}

impl Backend {
    pub fn from_config(addr: SocketAddr, config: &ServerConfig) -> Self {
        Self {
            addr,
            name: config.address.clone(),
            weight: i64::from(config.weight.max(1)),
            max_fails: config.max_fails,
            fail_timeout: Duration::from_millis(config.fail_timeout_ms),
        }
    }
}

/// Mutable selection state of one backend, guarded by its tier's lock.
#[derive(Debug, Clone)]
pub struct BackendState {
    pub current_weight: i64,
    pub effective_weight: i64,
    pub fails: u32,
    /// Last failure.
    pub accessed: Option<Instant>,
    /// Start of the current failure window.
    pub checked: Option<Instant>,
    pub down: bool,
}

impl BackendState {
    pub fn new(backend: &Backend, down: bool) -> Self {
        Self {
            current_weight: 0,
            effective_weight: backend.weight,
            fails: 0,
            accessed: None,
            checked: None,
            down,
        }
    }

    /// Skipped while it has failed `max_fails` times inside the window.
    pub fn is_available(&self, backend: &Backend, now: Instant) -> bool {
        if self.down {
            return false;
        }
        if backend.max_fails == 0 || self.fails < backend.max_fails {
            return true;
        }
        match self.checked {
            Some(checked) => now.duration_since(checked) > backend.fail_timeout,
            None => true,
        }
    }

    /// Record a failed attempt.
    pub fn mark_failure(&mut self, backend: &Backend, now: Instant) {
        self.fails += 1;
        self.accessed = Some(now);
        self.checked = Some(now);

        if backend.max_fails > 0 {
            self.effective_weight -= backend.weight / i64::from(backend.max_fails);
            if self.effective_weight < 0 {
                self.effective_weight = 0;
            }
        }
    }

    /// A success clears the failure count once the window was re-checked.
    pub fn mark_success(&mut self) {
        let rechecked = match (self.accessed, self.checked) {
            (Some(accessed), Some(checked)) => accessed < checked,
            _ => false,
        };
        if rechecked {
            self.fails = 0;
        }
    }
}
