//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Compile route configs into matchers plus an upstream context
//! - Look up the matching route for a request
//! - Resolve `@name` targets of internal redirects
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Explicit NoMatch rather than silent default

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, MemoryCache};
use crate::config::{ConfigError, RelayConfig, RouteConfig, UpstreamConf};
use crate::http::request::ClientRequest;
use crate::load_balancer::UpstreamRegistry;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};
use crate::upstream::UpstreamContext;

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub priority: u32,
    pub upstream: String,
    matcher: AndMatcher,
    pub context: UpstreamContext,
}

impl Route {
    fn compile(
        config: &RouteConfig,
        defaults: &crate::config::ProxySettings,
        registry: &UpstreamRegistry,
        client_body_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &config.host {
            matchers.push(Box::new(HostMatcher::new(host)));
        }
        if let Some(prefix) = &config.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix)));
        }

        let upstream = registry
            .get(&config.upstream)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownUpstream {
                route: config.name.clone(),
                upstream: config.upstream.clone(),
            })?;
        let settings = config.proxy.as_ref().unwrap_or(defaults);
        let conf = UpstreamConf::from_settings(&config.name, settings)?;
        let cache = conf
            .cache
            .as_ref()
            .map(|policy| Arc::new(MemoryCache::new(policy.max_entries)) as Arc<dyn Cache>);

        Ok(Self {
            name: config.name.clone(),
            priority: config.priority,
            upstream: config.upstream.clone(),
            matcher: AndMatcher::new(matchers),
            context: UpstreamContext {
                conf: Arc::new(conf),
                upstream,
                cache,
                client_body_timeout,
            },
        })
    }

    pub fn matches(&self, req: &ClientRequest) -> bool {
        self.matcher.matches(req)
    }
}

/// Result of a route lookup.
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Matched(&'a Route),
    NoMatch,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
    by_name: HashMap<String, usize>,
}

impl Router {
    pub fn build(config: &RelayConfig, registry: &UpstreamRegistry) -> Result<Self, ConfigError> {
        let client_body_timeout = Duration::from_millis(config.listener.client_body_timeout_ms);
        let mut routes = config
            .routes
            .iter()
            .map(|route| Route::compile(route, &config.proxy, registry, client_body_timeout))
            .collect::<Result<Vec<_>, _>>()?;
        // Stable sort keeps config order among equal priorities.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));

        let by_name = routes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        tracing::debug!(routes = routes.len(), "Router built");
        Ok(Self { routes, by_name })
    }

    pub fn match_request(&self, req: &ClientRequest) -> RouteMatch<'_> {
        match self.routes.iter().find(|r| r.matches(req)) {
            Some(route) => RouteMatch::Matched(route),
            None => RouteMatch::NoMatch,
        }
    }

    /// Route named by an `@name` redirect target.
    pub fn by_name(&self, name: &str) -> Option<&Route> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.by_name.get(name).map(|&i| &self.routes[i])
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
