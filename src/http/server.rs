//! HTTP server: accept loop and per-connection request handling.
//!
//! # Responsibilities
//! - Accept connections within the configured limit
//! - Read requests (keepalive and pipelining) and match routes
//! - Read or stream request bodies per route settings
//! - Run the upstream request and act on its completion (error pages,
//!   internal redirects, keepalive)
//! - Drain live connections on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;

use crate::config::{ConfigError, ListenerConfig, RelayConfig};
use crate::http::connection::{BodyError, ClientConnection, ReadRequest};
use crate::http::request::{ClientRequest, RequestBody};
use crate::load_balancer::UpstreamRegistry;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::Listener;
use crate::net::BoxedStream;
use crate::routing::{Route, RouteMatch, Router};
use crate::upstream::{Completion, UpstreamRequest};

/// How long shutdown waits for open connections.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything derived from one configuration; swapped whole on reload.
#[derive(Debug)]
pub struct Runtime {
    pub listener: ListenerConfig,
    pub router: Router,
}

impl Runtime {
    pub fn build(config: &RelayConfig) -> Result<Self, ConfigError> {
        let registry = UpstreamRegistry::from_config(&config.upstreams)?;
        let router = Router::build(config, &registry)?;
        Ok(Self {
            listener: config.listener.clone(),
            router,
        })
    }
}

/// HTTP server for the relay.
#[derive(Debug, Clone)]
pub struct HttpServer {
    runtime: Arc<ArcSwap<Runtime>>,
    tracker: ConnectionTracker,
}

impl HttpServer {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime: Arc::new(ArcSwap::from_pointee(runtime)),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Build a runtime from `config` and make new requests use it.
    pub fn reload(&self, config: &RelayConfig) -> Result<(), ConfigError> {
        let runtime = Runtime::build(config)?;
        self.runtime.store(Arc::new(runtime));
        tracing::info!(routes = config.routes.len(), upstreams = config.upstreams.len(), "Configuration applied");
        Ok(())
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Accept until shutdown, then drain.
    pub async fn run(&self, listener: Listener, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let _ = stream.set_nodelay(true);
                        let runtime = Arc::clone(&self.runtime);
                        let guard = self.tracker.track();
                        tokio::spawn(async move {
                            serve_connection(runtime, Box::new(stream), Some(peer)).await;
                            drop(guard);
                            drop(permit);
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!(active = self.tracker.active_count(), "Draining connections");
        if !self.tracker.wait_idle(DRAIN_TIMEOUT).await {
            tracing::warn!(active = self.tracker.active_count(), "Connections still open after drain timeout");
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Serve requests on one client connection until it closes.
pub async fn serve_connection(runtime: Arc<ArcSwap<Runtime>>, io: BoxedStream, client_addr: Option<SocketAddr>) {
    let send_timeout = Duration::from_millis(runtime.load().listener.send_timeout_ms);
    let mut conn = ClientConnection::new(io, send_timeout);
    let mut first = true;

    loop {
        let rt = runtime.load_full();
        let listener = &rt.listener;
        let header_timeout = Duration::from_millis(listener.client_header_timeout_ms);
        let idle = if first {
            header_timeout
        } else {
            Duration::from_millis(listener.keepalive_timeout_ms)
        };
        first = false;

        let mut request = match conn
            .read_request(listener.client_header_buffer_size, idle, header_timeout)
            .await
        {
            ReadRequest::Request(request) => request,
            ReadRequest::Closed => return,
            ReadRequest::Invalid(e) => {
                tracing::info!(client = ?client_addr, error = %e, "Invalid client request");
                let _ = conn.send_bare_error(e.status()).await;
                return;
            }
            ReadRequest::TimedOut => {
                tracing::info!(client = ?client_addr, "client timed out sending request header");
                let _ = conn.send_bare_error(408).await;
                return;
            }
        };
        request.client_addr = client_addr;

        if !handle_request(&rt, &mut conn, request).await {
            return;
        }
    }
}

/// Handle one request; returns whether the connection stays open.
async fn handle_request(rt: &Runtime, conn: &mut ClientConnection, mut request: ClientRequest) -> bool {
    tracing::debug!(request_id = %request.id, method = %request.method, uri = %request.uri, "Request received");

    let mut route = match rt.router.match_request(&request) {
        RouteMatch::Matched(route) => route,
        RouteMatch::NoMatch => {
            tracing::warn!(request_id = %request.id, uri = %request.uri, "No route matched");
            let _ = conn.send_error_page(404, vec![], &request).await;
            return conn.keepalive() && !request.has_body();
        }
    };

    let mut body = match read_body(rt, route, conn, &request).await {
        Ok(body) => body,
        Err(status) => {
            if let Some(status) = status {
                let _ = conn.send_error_page(status, vec![], &request).await;
            }
            return false;
        }
    };

    let mut redirects = 0;
    loop {
        let completion = {
            let mut upstream = UpstreamRequest::new(&route.context, &request, &mut body, conn);
            upstream.run().await
        };

        match completion {
            Completion::Responded { .. } => return conn.keepalive() && body.is_replayable(),
            Completion::ErrorPage { status, headers } => {
                let _ = conn.send_error_page(status, headers, &request).await;
                return conn.keepalive() && body.is_replayable();
            }
            Completion::Aborted | Completion::ClientClosed => return false,
            Completion::InternalRedirect(uri) => {
                redirects += 1;
                if redirects > rt.listener.max_internal_redirects {
                    tracing::error!(request_id = %request.id, uri = %uri, "rewrite or internal redirection cycle");
                    let _ = conn.send_error_page(500, vec![], &request).await;
                    return false;
                }

                let next = if uri.starts_with('@') {
                    rt.router.by_name(&uri)
                } else {
                    request = request.redirected(&uri);
                    body = RequestBody::Empty;
                    match rt.router.match_request(&request) {
                        RouteMatch::Matched(route) => Some(route),
                        RouteMatch::NoMatch => None,
                    }
                };
                match next {
                    Some(next) => route = next,
                    None => {
                        tracing::warn!(request_id = %request.id, uri = %uri, "Internal redirect target not found");
                        let _ = conn.send_error_page(404, vec![], &request).await;
                        return false;
                    }
                }
                if !body.is_replayable() {
                    body = RequestBody::Empty;
                }
                tracing::debug!(request_id = %request.id, route = %route.name, "Internal redirect");
            }
        }
    }
}

/// Read the body the way the route wants it. `Err(Some(status))` asks for
/// an error page, `Err(None)` for a silent close.
async fn read_body(
    rt: &Runtime,
    route: &Route,
    conn: &mut ClientConnection,
    request: &ClientRequest,
) -> Result<RequestBody, Option<u16>> {
    if !request.has_body() {
        return Ok(RequestBody::Empty);
    }
    let conf = &route.context.conf;
    // Chunked bodies have no length to announce, so they are always read first.
    if !conf.request_buffering && !request.chunked {
        return Ok(RequestBody::Streaming {
            length: request.content_length.unwrap_or(0),
        });
    }

    let limit = Duration::from_millis(rt.listener.client_body_timeout_ms);
    conn.read_body(request, rt.listener.client_body_buffer_size, conf.temp_path.as_deref(), limit)
        .await
        .map_err(|e| {
            tracing::info!(request_id = %request.id, error = %e, "Failed to read client body");
            match e {
                BodyError::TimedOut => Some(408),
                BodyError::Chunked(_) => Some(400),
                BodyError::Io(_) => Some(500),
                BodyError::Closed => None,
            }
        })
}
