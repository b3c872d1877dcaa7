//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RelayConfig (validated, immutable)
//!     → runtime.rs (UpstreamConf per route: masks, policies, TLS)
//!     → shared via Arc to all requests
//!
//! On reload signal:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of the live runtime
//!     → new requests observe new config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Anything derived from config (masks, hide lists) is computed once

pub mod loader;
pub mod runtime;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use runtime::{CachePolicy, UpstreamConf};
pub use schema::{
    BuffersConfig, CacheSettings, CacheValidRule, ListenerConfig, ObservabilityConfig,
    ProxySettings, RelayConfig, RewriteRule, RouteConfig, ServerConfig, UpstreamGroupConfig,
    UpstreamTlsSettings,
};
pub use validation::{validate_config, ValidationError};
