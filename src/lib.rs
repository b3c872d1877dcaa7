//! Reverse proxy that relays client requests to upstream server groups.
//!
//! Each request runs through a connect/send/header/relay state machine with
//! failover to the next server, buffered or direct body relay, protocol
//! upgrades and optional response caching.

pub mod cache;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod resilience;
pub mod routing;
pub mod upstream;

pub use config::RelayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
