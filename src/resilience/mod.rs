//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against a backend:
//!     → timeouts.rs (connect/send/read deadline per operation)
//!     → On failure: retries.rs (classify, check mask/budget/deadline)
//!     → load_balancer (peer released as failed or "next")
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every backend operation has a deadline
//! - Retries are bounded by a per-request budget and an overall deadline
//! - A request body streamed from the client is never replayed

pub mod retries;
pub mod timeouts;

pub use retries::{FailureKind, FailureMask, RetryBudget};
pub use timeouts::{IoStep, Timeouts};
