//! Upstream request engine.
//!
//! # Data Flow
//! ```text
//! UpstreamRequest::run
//!     → cache lookup (Hit → ServeCached)
//!     → Connect  (peer from PeerSet, connect timeout, TLS on fresh sockets)
//!     → Send     (request head + body, send timeout)
//!     → ReadHeader (probe client, read timeout, dispatch table)
//!     → Relay    (Buffered | Direct | Upgrade)
//!     → Finalize (peer released, connection pooled or closed, cache commit)
//!
//! Any stage failing with a retryable kind goes through Next, which either
//! loops back to Connect or terminates (stale entry or error status).
//! ```
//!
//! # Design Decisions
//! - Every stage returns the next `Step`; `run` is the only loop, so
//!   finalization cannot be reached twice by accident
//! - The budget is spent when a peer is released, a pooled connection that
//!   fails before its body went out gets the attempt back
//! - `Drop` tears down whatever `finalize` did not get to (cancelled task)

pub mod attempt;
pub mod buffer;
pub mod cache_control;
mod cached;
mod connect;
pub mod dispatch;
mod finalize;
mod header;
pub mod headers;
mod relay;
mod send;
pub mod spill;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use thiserror::Error;

use crate::cache::{Cache, CachedResponse, WriteHandle};
use crate::config::UpstreamConf;
use crate::http::connection::ClientConnection;
use crate::http::request::{ClientRequest, RequestBody};
use crate::load_balancer::{PeerOutcome, PeerPick, PeerSet, UpstreamHandle};
use crate::net::connector::BackendConnection;
use crate::protocol::{Http1Adapter, ProtocolAdapter};
use crate::resilience::{FailureKind, RetryBudget};

pub use attempt::AttemptState;
pub use relay::RelayMode;

use dispatch::ResponseMeta;
use headers::OutboundHead;
use spill::TempFileSpill;

/// Next stage of the state machine.
#[derive(Debug)]
enum Step {
    Connect,
    Send,
    ReadHeader,
    Relay(RelayMode),
    Next(FailureKind),
    ServeCached(Arc<CachedResponse>),
    Finalize(Outcome),
}

/// Why the request is being finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Response relayed (or served) to its end.
    Done,
    /// Error status; an error page if the head is not out yet, an aborted
    /// connection otherwise.
    Status(u16),
    ClientClosed,
    /// `X-Accel-Redirect` from the backend.
    Redirect(String),
}

/// What the connection handler has to do after the upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Responded { status: u16 },
    ErrorPage {
        status: u16,
        headers: Vec<(String, String)>,
    },
    InternalRedirect(String),
    /// The head went out but the body could not be completed.
    Aborted,
    ClientClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Finalized,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinalizeError {
    #[error("upstream request already finalized")]
    AlreadyFinalized,
}

/// Per-route collaborators of an upstream request.
#[derive(Debug, Clone)]
pub struct UpstreamContext {
    pub conf: Arc<UpstreamConf>,
    pub upstream: UpstreamHandle,
    pub cache: Option<Arc<dyn Cache>>,
    /// Read timeout for a body streamed from the client.
    pub client_body_timeout: Duration,
}

#[derive(Debug, Default)]
struct Flags {
    request_sent: bool,
    /// The body is read from the client while sending, it cannot be sent
    /// twice.
    body_streamed: bool,
    upgrade: bool,
    buffering: bool,
    cacheable: bool,
    store: bool,
    client_gone: bool,
    response_complete: bool,
    from_cache: bool,
}

/// One client request forwarded to an upstream group.
pub struct UpstreamRequest<'a> {
    conf: Arc<UpstreamConf>,
    upstream: UpstreamHandle,
    peers: Box<dyn PeerSet>,
    adapter: Box<dyn ProtocolAdapter>,
    cache: Option<Arc<dyn Cache>>,
    client_body_timeout: Duration,

    request: &'a ClientRequest,
    body: &'a mut RequestBody,
    downstream: &'a mut ClientConnection,

    peer: Option<PeerPick>,
    connection: Option<BackendConnection>,
    input: BytesMut,
    out_head: Option<OutboundHead>,
    meta: ResponseMeta,
    attempts: Vec<AttemptState>,
    budget: RetryBudget,
    flags: Flags,
    phase: Phase,
    spill: TempFileSpill,
    cache_write: Option<WriteHandle>,
    stale: Option<Arc<CachedResponse>>,
    valid_for: Option<Duration>,
    /// Extra headers for an intercepted error page.
    error_headers: Vec<(String, String)>,
    relayed: u64,
    started: Instant,
}

impl std::fmt::Debug for UpstreamRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRequest")
            .field("request_id", &self.request.id)
            .field("peer", &self.peer)
            .field("attempts", &self.attempts.len())
            .field("phase", &self.phase)
            .finish()
    }
}

impl<'a> UpstreamRequest<'a> {
    pub fn new(
        ctx: &UpstreamContext,
        request: &'a ClientRequest,
        body: &'a mut RequestBody,
        downstream: &'a mut ClientConnection,
    ) -> Self {
        let peers = ctx.upstream.selector.init();
        let budget = RetryBudget::new(
            peers.tries(),
            ctx.conf.next_upstream_tries,
            ctx.conf.next_upstream_timeout,
        );
        let adapter = Box::new(Http1Adapter::new(ctx.upstream.connector.keepalive()));
        let flags = Flags {
            body_streamed: !body.is_replayable(),
            ..Flags::default()
        };

        Self {
            conf: ctx.conf.clone(),
            upstream: ctx.upstream.clone(),
            peers,
            adapter,
            cache: ctx.cache.clone(),
            client_body_timeout: ctx.client_body_timeout,
            request,
            body,
            downstream,
            peer: None,
            connection: None,
            input: BytesMut::with_capacity(ctx.conf.buffer_size),
            out_head: None,
            meta: ResponseMeta::default(),
            attempts: Vec::new(),
            budget,
            flags,
            phase: Phase::Active,
            spill: TempFileSpill::new(ctx.conf.temp_path.clone()),
            cache_write: None,
            stale: None,
            valid_for: None,
            error_headers: Vec::new(),
            relayed: 0,
            started: Instant::now(),
        }
    }

    /// Replace the backend protocol adapter.
    pub fn with_adapter(mut self, adapter: Box<dyn ProtocolAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn attempts(&self) -> &[AttemptState] {
        &self.attempts
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Attempts still allowed.
    pub fn remaining_tries(&self) -> usize {
        self.budget.remaining()
    }

    /// Drive the request to completion.
    pub async fn run(&mut self) -> Completion {
        let mut step = self.start();
        loop {
            step = match step {
                Step::Connect => self.connect().await,
                Step::Send => self.send().await,
                Step::ReadHeader => self.read_header().await,
                Step::Relay(mode) => self.relay(mode).await,
                Step::Next(kind) => self.next_upstream(kind),
                Step::ServeCached(entry) => self.serve_cached(entry).await,
                Step::Finalize(outcome) => {
                    return match self.finalize(outcome).await {
                        Ok(completion) => completion,
                        Err(e) => {
                            tracing::error!(request_id = %self.request.id, error = %e, "Finalize reached twice");
                            Completion::Aborted
                        }
                    };
                }
            };
        }
    }

    /// Release the current peer, spending one attempt.
    fn release_peer(&mut self, outcome: PeerOutcome) {
        if let Some(peer) = self.peer.take() {
            self.peers.report_outcome(&peer, outcome);
            self.budget.consume();
        }
    }

    /// Close the backend connection without pooling it.
    fn close_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.upstream.connector.release(conn, false);
        }
    }

    fn current_attempt(&mut self) -> Option<&mut AttemptState> {
        self.attempts.last_mut()
    }

    /// Watch for the client going away while waiting on the backend.
    fn probes_client(&self) -> bool {
        !self.conf.ignore_client_abort && !self.flags.cacheable && !self.flags.store
    }
}

impl Drop for UpstreamRequest<'_> {
    fn drop(&mut self) {
        if self.phase == Phase::Finalized {
            return;
        }
        self.phase = Phase::Finalized;
        tracing::debug!(request_id = %self.request.id, "Upstream request dropped before finalize");
        if let Some(peer) = self.peer.take() {
            self.peers.report_outcome(&peer, PeerOutcome::Success);
        }
        self.close_connection();
        if let (Some(cache), Some(handle)) = (self.cache.as_ref(), self.cache_write.take()) {
            cache.abandon(handle);
        }
        self.spill.release();
    }
}
