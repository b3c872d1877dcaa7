//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing upstreams)
//! - Validate value ranges (sizes and timeouts > 0, known names)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{ProxySettings, RelayConfig};
use crate::resilience::FailureMask;
use crate::upstream::dispatch::IGNORABLE;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field}: \"{value}\" is not a socket address")]
    Address { field: String, value: String },
    #[error("{0} must be greater than zero")]
    Zero(String),
    #[error("duplicate {kind} \"{name}\"")]
    Duplicate { kind: &'static str, name: String },
    #[error("upstream \"{0}\" has no servers")]
    NoServers(String),
    #[error("route \"{route}\" references unknown upstream \"{upstream}\"")]
    UnknownUpstream { route: String, upstream: String },
    #[error("{scope}: {message}")]
    Invalid { scope: String, message: String },
}

pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::Address {
            field: "listener.bind_address".into(),
            value: listener.bind_address.clone(),
        });
    }
    for (field, value) in [
        ("listener.max_connections", listener.max_connections as u64),
        ("listener.client_header_buffer_size", listener.client_header_buffer_size as u64),
        ("listener.client_header_timeout_ms", listener.client_header_timeout_ms),
        ("listener.client_body_timeout_ms", listener.client_body_timeout_ms),
        ("listener.send_timeout_ms", listener.send_timeout_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero(field.into()));
        }
    }

    let mut upstreams = HashSet::new();
    for group in &config.upstreams {
        if !upstreams.insert(group.name.as_str()) {
            errors.push(ValidationError::Duplicate {
                kind: "upstream",
                name: group.name.clone(),
            });
        }
        if group.servers.is_empty() {
            errors.push(ValidationError::NoServers(group.name.clone()));
        }
        for server in &group.servers {
            if server.weight == 0 {
                errors.push(ValidationError::Zero(format!(
                    "upstream \"{}\" server {} weight",
                    group.name, server.address
                )));
            }
        }
    }

    validate_proxy("proxy", &config.proxy, &mut errors);

    let mut routes = HashSet::new();
    for route in &config.routes {
        if !routes.insert(route.name.as_str()) {
            errors.push(ValidationError::Duplicate {
                kind: "route",
                name: route.name.clone(),
            });
        }
        if !upstreams.contains(route.upstream.as_str()) {
            errors.push(ValidationError::UnknownUpstream {
                route: route.name.clone(),
                upstream: route.upstream.clone(),
            });
        }
        if let Some(proxy) = &route.proxy {
            validate_proxy(&format!("route \"{}\"", route.name), proxy, &mut errors);
        }
    }

    let observability = &config.observability;
    if !matches!(observability.log_format.as_str(), "pretty" | "compact") {
        errors.push(invalid(
            "observability",
            format!("unknown log_format \"{}\"", observability.log_format),
        ));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::Address {
            field: "observability.metrics_address".into(),
            value: observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn invalid(scope: &str, message: String) -> ValidationError {
    ValidationError::Invalid {
        scope: scope.to_string(),
        message,
    }
}

fn validate_proxy(scope: &str, proxy: &ProxySettings, errors: &mut Vec<ValidationError>) {
    for (field, value) in [
        ("buffer_size", proxy.buffer_size as u64),
        ("buffers.count", proxy.buffers.count as u64),
        ("buffers.size", proxy.buffers.size as u64),
        ("connect_timeout_ms", proxy.connect_timeout_ms),
        ("send_timeout_ms", proxy.send_timeout_ms),
        ("read_timeout_ms", proxy.read_timeout_ms),
        ("temp_file_write_size", proxy.temp_file_write_size as u64),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero(format!("{scope}.{field}")));
        }
    }

    let total = proxy.buffers.count.saturating_sub(1) * proxy.buffers.size;
    if proxy.buffers.count > 1 && proxy.busy_buffers_size >= total {
        errors.push(invalid(
            scope,
            format!("busy_buffers_size must be less than {total} (all buffers but one)"),
        ));
    }

    if let Err(e) = FailureMask::parse(&proxy.next_upstream, &[]) {
        errors.push(invalid(scope, format!("next_upstream: {e}")));
    }
    if let Err(e) = FailureMask::parse(&proxy.cache.use_stale, &["updating"]) {
        errors.push(invalid(scope, format!("cache.use_stale: {e}")));
    }

    for name in &proxy.ignore_headers {
        if !IGNORABLE.contains(&name.to_ascii_lowercase().as_str()) {
            errors.push(invalid(scope, format!("ignore_headers: \"{name}\" cannot be ignored")));
        }
    }

    for status in &proxy.intercept_errors {
        if !(300..=599).contains(status) {
            errors.push(invalid(scope, format!("intercept_errors: {status} is not an error status")));
        }
    }

    if proxy.store && proxy.store_path.is_none() {
        errors.push(invalid(scope, "store requires store_path".into()));
    }
    if proxy.tls.enabled && proxy.tls.verify && proxy.tls.ca_file.is_none() {
        errors.push(invalid(scope, "tls.verify requires tls.ca_file".into()));
    }
    if proxy.cache.enabled && proxy.cache.max_entries == 0 {
        errors.push(ValidationError::Zero(format!("{scope}.cache.max_entries")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{RouteConfig, ServerConfig, UpstreamGroupConfig};

    fn base() -> RelayConfig {
        RelayConfig {
            upstreams: vec![UpstreamGroupConfig {
                name: "app".into(),
                servers: vec![ServerConfig {
                    address: "127.0.0.1:9001".into(),
                    weight: 1,
                    max_fails: 1,
                    fail_timeout_ms: 10_000,
                    down: false,
                    backup: false,
                }],
                keepalive: 0,
            }],
            routes: vec![RouteConfig {
                name: "all".into(),
                host: None,
                path_prefix: None,
                upstream: "app".into(),
                priority: 0,
                proxy: None,
            }],
            ..RelayConfig::default()
        }
    }

    #[test]
    fn default_shaped_config_is_valid() {
        assert_eq!(validate_config(&base()), Ok(()));
    }

    #[test]
    fn unknown_failure_kind_is_reported() {
        let mut config = base();
        config.proxy.next_upstream = vec!["error".into(), "sometimes".into()];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("sometimes"));
    }

    #[test]
    fn updating_is_accepted_only_for_stale() {
        let mut config = base();
        config.proxy.cache.use_stale = vec!["timeout".into(), "updating".into()];
        assert_eq!(validate_config(&config), Ok(()));

        config.proxy.next_upstream = vec!["error".into(), "updating".into()];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("updating"));
    }

    #[test]
    fn collects_every_problem() {
        let mut config = base();
        config.listener.bind_address = "nowhere".into();
        config.routes[0].upstream = "missing".into();
        config.proxy.ignore_headers = vec!["Content-Type".into()];
        config.proxy.store = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
    }
}
