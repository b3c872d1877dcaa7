//! Metrics collection and exposition.
//!
//! # Metrics
//! - `upstream_attempts_total` (counter): attempts by peer
//! - `upstream_failures_total` (counter): failed attempts by failure kind
//! - `upstream_responses_total` (counter): final responses by status
//! - `upstream_response_duration_seconds` (histogram): time to finalize
//! - `upstream_relay_bytes_total` (counter): body bytes by relay mode
//! - `upstream_spill_bytes_total` (counter): bytes written to spill files
//! - `upstream_cache_total` (counter): cache lookups by result
//!
//! # Design Decisions
//! - Labels for peer, failure kind, status and relay mode only
//! - Prometheus exporter runs its own listener, off the request path

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

pub const ATTEMPTS_TOTAL: &str = "upstream_attempts_total";
pub const FAILURES_TOTAL: &str = "upstream_failures_total";
pub const RESPONSES_TOTAL: &str = "upstream_responses_total";
pub const RESPONSE_DURATION: &str = "upstream_response_duration_seconds";
pub const RELAY_BYTES_TOTAL: &str = "upstream_relay_bytes_total";
pub const SPILL_BYTES_TOTAL: &str = "upstream_spill_bytes_total";
pub const CACHE_TOTAL: &str = "upstream_cache_total";

/// Start the Prometheus scrape endpoint. Must run inside the runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_attempt(peer: &str) {
    counter!(ATTEMPTS_TOTAL, "peer" => peer.to_string()).increment(1);
}

pub fn record_failure(kind: &'static str) {
    counter!(FAILURES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_response(status: u16, started: Instant) {
    counter!(RESPONSES_TOTAL, "status" => status.to_string()).increment(1);
    histogram!(RESPONSE_DURATION).record(started.elapsed().as_secs_f64());
}

pub fn record_relay_bytes(mode: &'static str, bytes: u64) {
    if bytes > 0 {
        counter!(RELAY_BYTES_TOTAL, "mode" => mode).increment(bytes);
    }
}

pub fn record_spill_bytes(bytes: u64) {
    counter!(SPILL_BYTES_TOTAL).increment(bytes);
}

pub fn record_cache(status: &'static str) {
    counter!(CACHE_TOTAL, "status" => status).increment(1);
}
