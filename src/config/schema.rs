//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Client-facing listener configuration.
    pub listener: ListenerConfig,

    /// Named upstream groups.
    pub upstreams: Vec<UpstreamGroupConfig>,

    /// Route definitions mapping requests to upstream groups.
    pub routes: Vec<RouteConfig>,

    /// Default proxy settings, used by routes without their own block.
    pub proxy: ProxySettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,

    /// Time allowed for a client to send a complete request head.
    pub client_header_timeout_ms: u64,

    /// Time allowed between two successive reads of a client body.
    pub client_body_timeout_ms: u64,

    /// Largest accepted client request head.
    pub client_header_buffer_size: usize,

    /// Request bodies larger than this are spooled to a temp file.
    pub client_body_buffer_size: usize,

    /// Idle time before a keepalive client connection is closed.
    pub keepalive_timeout_ms: u64,

    /// Time allowed between two successive writes to a client.
    pub send_timeout_ms: u64,

    /// Upper bound on `X-Accel-Redirect` hops for one request.
    pub max_internal_redirects: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            client_header_timeout_ms: 60_000,
            client_body_timeout_ms: 60_000,
            client_header_buffer_size: 8 * 1024,
            client_body_buffer_size: 16 * 1024,
            keepalive_timeout_ms: 75_000,
            send_timeout_ms: 60_000,
            max_internal_redirects: 10,
        }
    }
}

/// A named group of backend servers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamGroupConfig {
    /// Group name referenced by routes.
    pub name: String,

    /// Servers in declaration order.
    pub servers: Vec<ServerConfig>,

    /// Idle connections kept per group for reuse (0 disables keepalive).
    #[serde(default)]
    pub keepalive: usize,
}

/// Backend server declaration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted round robin (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Failures within `fail_timeout_ms` before the server is skipped.
    /// Zero disables failure accounting.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Failure window, and how long a failed server is skipped.
    #[serde(default = "default_fail_timeout_ms")]
    pub fail_timeout_ms: u64,

    /// Permanently marked unavailable.
    #[serde(default)]
    pub down: bool,

    /// Only used when every primary server is unavailable.
    #[serde(default)]
    pub backup: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout_ms() -> u64 {
    10_000
}

/// Route configuration mapping requests to upstream groups.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging and named internal redirects.
    pub name: String,

    /// Host header to match (exact, case-insensitive).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Upstream group name to forward to.
    pub upstream: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    /// Per-route proxy settings replacing the `[proxy]` defaults.
    #[serde(default)]
    pub proxy: Option<ProxySettings>,
}

/// Fixed-size buffer set used by the buffered relay.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BuffersConfig {
    pub count: usize,
    pub size: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            count: 8,
            size: 4096,
        }
    }
}

/// A `from` prefix rewritten to `to`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

/// Per-route upstream behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Size of the backend read buffer; bounds the response head.
    pub buffer_size: usize,

    /// In-memory buffer set for the buffered relay.
    pub buffers: BuffersConfig,

    /// Relay responses through the buffered pipe.
    pub buffering: bool,

    /// Bytes handed to the client but not yet confirmed written before
    /// the relay stops handing out more.
    pub busy_buffers_size: usize,

    /// Let `X-Accel-Buffering` switch the relay mode.
    pub change_buffering: bool,

    /// Read the whole client body before contacting a backend.
    pub request_buffering: bool,

    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub read_timeout_ms: u64,

    /// Failure kinds that move on to the next server.
    pub next_upstream: Vec<String>,

    /// Upper bound on attempts (0 = number of servers).
    pub next_upstream_tries: usize,

    /// Deadline across all attempts (0 = none).
    pub next_upstream_timeout_ms: u64,

    /// Keep serving the backend after the client went away.
    pub ignore_client_abort: bool,

    /// Statuses replaced by the relay's own error page.
    pub intercept_errors: Vec<u16>,

    pub hide_headers: Vec<String>,
    pub pass_headers: Vec<String>,

    /// Control headers whose processing is disabled.
    pub ignore_headers: Vec<String>,

    /// `Location`/`Refresh` prefix rewrites.
    pub redirect: Vec<RewriteRule>,

    /// `Set-Cookie` domain rewrites.
    pub cookie_domain: Vec<RewriteRule>,

    /// `Set-Cookie` path rewrites.
    pub cookie_path: Vec<RewriteRule>,

    /// Spill file cap in bytes (0 disables spilling for plain relaying).
    pub max_temp_file_size: u64,

    /// Bytes written to the spill file in one go.
    pub temp_file_write_size: usize,

    /// Directory for spill files (system temp dir when unset).
    pub temp_path: Option<String>,

    /// Persist successful responses to `store_path`.
    pub store: bool,

    /// Path template; `{uri}` is replaced with the request path.
    pub store_path: Option<String>,

    pub cache: CacheSettings,

    pub tls: UpstreamTlsSettings,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            buffers: BuffersConfig::default(),
            buffering: true,
            busy_buffers_size: 8192,
            change_buffering: true,
            request_buffering: true,
            connect_timeout_ms: 60_000,
            send_timeout_ms: 60_000,
            read_timeout_ms: 60_000,
            next_upstream: vec!["error".to_string(), "timeout".to_string()],
            next_upstream_tries: 0,
            next_upstream_timeout_ms: 0,
            ignore_client_abort: false,
            intercept_errors: Vec::new(),
            hide_headers: Vec::new(),
            pass_headers: Vec::new(),
            ignore_headers: Vec::new(),
            redirect: Vec::new(),
            cookie_domain: Vec::new(),
            cookie_path: Vec::new(),
            max_temp_file_size: 1024 * 1024 * 1024,
            temp_file_write_size: 8192,
            temp_path: None,
            store: false,
            store_path: None,
            cache: CacheSettings::default(),
            tls: UpstreamTlsSettings::default(),
        }
    }
}

/// Validity for responses with the listed statuses (empty = 200, 301, 302).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheValidRule {
    #[serde(default)]
    pub statuses: Vec<u16>,
    /// Applies to every status not matched by another rule.
    #[serde(default)]
    pub any: bool,
    pub secs: u64,
}

/// Response cache behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,

    /// Validity by status when response headers set none.
    pub valid: Vec<CacheValidRule>,

    /// Failure kinds (plus "updating") that allow serving a stale entry.
    pub use_stale: Vec<String>,

    /// Request headers that skip the cache lookup.
    pub bypass: Vec<String>,

    /// Request headers that prevent saving the response.
    pub no_cache: Vec<String>,

    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            valid: Vec::new(),
            use_stale: Vec::new(),
            bypass: Vec::new(),
            no_cache: Vec::new(),
            max_entries: 10_000,
        }
    }
}

/// TLS towards backends.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamTlsSettings {
    pub enabled: bool,

    /// Verify the backend certificate chain and name.
    pub verify: bool,

    /// PEM bundle of trusted roots (required when `verify`).
    pub ca_file: Option<String>,

    /// SNI / verification name (defaults to the server address host).
    pub server_name: Option<String>,
}

impl Default for UpstreamTlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            verify: true,
            ca_file: None,
            server_name: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" or "compact".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
