//! Per-route runtime settings derived from `ProxySettings`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::loader::ConfigError;
use crate::config::schema::{BuffersConfig, CacheSettings, CacheValidRule, ProxySettings};
use crate::http::request::ClientRequest;
use crate::net::tls::UpstreamTls;
use crate::resilience::{FailureMask, Timeouts};
use crate::upstream::dispatch::HeaderPolicy;

/// Statuses cached by a rule without an explicit status list.
const DEFAULT_VALID_STATUSES: &[u16] = &[200, 301, 302];

/// Immutable upstream behaviour of one route.
#[derive(Debug, Clone)]
pub struct UpstreamConf {
    pub timeouts: Timeouts,
    pub buffer_size: usize,
    pub buffers: BuffersConfig,
    pub busy_buffers_size: usize,
    pub buffering: bool,
    pub change_buffering: bool,
    pub request_buffering: bool,
    pub next_upstream: FailureMask,
    pub next_upstream_tries: usize,
    pub next_upstream_timeout: Option<Duration>,
    pub ignore_client_abort: bool,
    pub intercept_errors: Vec<u16>,
    pub headers: HeaderPolicy,
    pub max_temp_file_size: u64,
    pub temp_file_write_size: usize,
    pub temp_path: Option<PathBuf>,
    /// Path template when completed responses are stored.
    pub store: Option<String>,
    pub cache: Option<CachePolicy>,
    pub tls: Option<Arc<UpstreamTls>>,
}

impl UpstreamConf {
    pub fn from_settings(route: &str, settings: &ProxySettings) -> Result<Self, ConfigError> {
        let next_upstream = FailureMask::parse(&settings.next_upstream, &[])
            .map_err(|source| ConfigError::FailureKind {
                route: route.to_string(),
                source,
            })?;

        let cache = if settings.cache.enabled {
            Some(CachePolicy::from_settings(route, &settings.cache)?)
        } else {
            None
        };

        let tls = if settings.tls.enabled {
            let tls = UpstreamTls::from_settings(&settings.tls).map_err(|source| ConfigError::Tls {
                route: route.to_string(),
                source,
            })?;
            Some(Arc::new(tls))
        } else {
            None
        };

        Ok(Self {
            timeouts: Timeouts {
                connect: Duration::from_millis(settings.connect_timeout_ms),
                send: Duration::from_millis(settings.send_timeout_ms),
                read: Duration::from_millis(settings.read_timeout_ms),
            },
            buffer_size: settings.buffer_size,
            buffers: settings.buffers,
            busy_buffers_size: settings.busy_buffers_size,
            buffering: settings.buffering,
            change_buffering: settings.change_buffering,
            request_buffering: settings.request_buffering,
            next_upstream,
            next_upstream_tries: settings.next_upstream_tries,
            next_upstream_timeout: (settings.next_upstream_timeout_ms > 0)
                .then(|| Duration::from_millis(settings.next_upstream_timeout_ms)),
            ignore_client_abort: settings.ignore_client_abort,
            intercept_errors: settings.intercept_errors.clone(),
            headers: HeaderPolicy::from_settings(settings),
            max_temp_file_size: settings.max_temp_file_size,
            temp_file_write_size: settings.temp_file_write_size,
            temp_path: settings.temp_path.as_ref().map(PathBuf::from),
            store: settings
                .store
                .then(|| settings.store_path.clone())
                .flatten(),
            cache,
            tls,
        })
    }

    pub fn intercepts(&self, status: u16) -> bool {
        self.intercept_errors.contains(&status)
    }

    /// Destination of a stored response for `path`.
    pub fn store_path(&self, path: &str) -> Option<PathBuf> {
        let template = self.store.as_ref()?;
        let relative = path.trim_start_matches('/');
        Some(PathBuf::from(template.replace("{uri}", relative)))
    }
}

/// Cache behaviour of one route.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    valid: Vec<CacheValidRule>,
    pub use_stale: FailureMask,
    /// Serve a stale entry while another request refreshes it.
    pub stale_updating: bool,
    bypass: Vec<String>,
    no_cache: Vec<String>,
    pub max_entries: usize,
}

impl CachePolicy {
    pub fn from_settings(route: &str, settings: &CacheSettings) -> Result<Self, ConfigError> {
        let use_stale = FailureMask::parse(&settings.use_stale, &["updating"]).map_err(|source| {
            ConfigError::FailureKind {
                route: route.to_string(),
                source,
            }
        })?;
        Ok(Self {
            valid: settings.valid.clone(),
            use_stale,
            stale_updating: settings
                .use_stale
                .iter()
                .any(|n| n.trim().eq_ignore_ascii_case("updating")),
            bypass: lower_all(&settings.bypass),
            no_cache: lower_all(&settings.no_cache),
            max_entries: settings.max_entries,
        })
    }

    /// Validity from the per-status table.
    pub fn valid_for(&self, status: u16) -> Option<Duration> {
        let explicit = self.valid.iter().find(|rule| {
            if rule.statuses.is_empty() {
                !rule.any && DEFAULT_VALID_STATUSES.contains(&status)
            } else {
                rule.statuses.contains(&status)
            }
        });
        explicit
            .or_else(|| self.valid.iter().find(|rule| rule.any))
            .map(|rule| Duration::from_secs(rule.secs))
            .filter(|d| !d.is_zero())
    }

    /// Skip the lookup for this request.
    pub fn bypasses(&self, request: &ClientRequest) -> bool {
        matches_any(&self.bypass, request)
    }

    /// Do not save the response to this request.
    pub fn no_cache(&self, request: &ClientRequest) -> bool {
        matches_any(&self.no_cache, request)
    }
}

fn lower_all(names: &[String]) -> Vec<String> {
    names.iter().map(|n| n.to_ascii_lowercase()).collect()
}

/// A header counts when present with a value other than "" or "0".
fn matches_any(names: &[String], request: &ClientRequest) -> bool {
    names
        .iter()
        .any(|name| request.header(name).is_some_and(|v| !v.is_empty() && v != "0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::parse_request_head;

    #[test]
    fn builds_masks_and_flags() {
        let mut settings = ProxySettings::default();
        settings.next_upstream = vec!["error".into(), "http_503".into()];
        settings.next_upstream_timeout_ms = 1500;
        settings.store = true;
        settings.store_path = Some("/var/store/{uri}".into());

        let conf = UpstreamConf::from_settings("r", &settings).unwrap();
        assert!(conf.next_upstream.contains(crate::resilience::FailureKind::Http503));
        assert_eq!(conf.next_upstream_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(
            conf.store_path("/a/b.html"),
            Some(PathBuf::from("/var/store/a/b.html"))
        );
        assert!(conf.cache.is_none());
        assert!(conf.tls.is_none());
    }

    #[test]
    fn valid_table_lookup() {
        let settings = CacheSettings {
            enabled: true,
            valid: vec![
                CacheValidRule { statuses: vec![404], any: false, secs: 5 },
                CacheValidRule { statuses: vec![], any: false, secs: 60 },
                CacheValidRule { statuses: vec![], any: true, secs: 1 },
            ],
            use_stale: vec!["error".into(), "updating".into()],
            ..CacheSettings::default()
        };
        let policy = CachePolicy::from_settings("r", &settings).unwrap();
        assert_eq!(policy.valid_for(200), Some(Duration::from_secs(60)));
        assert_eq!(policy.valid_for(404), Some(Duration::from_secs(5)));
        assert_eq!(policy.valid_for(500), Some(Duration::from_secs(1)));
        assert!(policy.stale_updating);
        assert!(policy.use_stale.contains(crate::resilience::FailureKind::Error));
    }

    #[test]
    fn bypass_predicates_read_request_headers() {
        let settings = CacheSettings {
            enabled: true,
            bypass: vec!["X-No-Cache".into()],
            ..CacheSettings::default()
        };
        let policy = CachePolicy::from_settings("r", &settings).unwrap();

        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nX-No-Cache: 1\r\n\r\n";
        let (req, _) = parse_request_head(raw, 8192).unwrap().unwrap();
        assert!(policy.bypasses(&req));

        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nX-No-Cache: 0\r\n\r\n";
        let (req, _) = parse_request_head(raw, 8192).unwrap().unwrap();
        assert!(!policy.bypasses(&req));
        assert!(!policy.no_cache(&req));
    }
}
