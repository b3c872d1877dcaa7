//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (structured fields: request_id, peer, attempt, kind)
//!     → metrics.rs (counters and histograms)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, pretty or compact)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through every upstream log line
//! - Metric updates are plain macro calls; no handles are stored
//! - Without an installed recorder every metric call is a no-op

pub mod logging;
pub mod metrics;
