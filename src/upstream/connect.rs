//! Cache lookup, connecting and failover.

use http::Method;
use tokio::time::timeout;

use crate::cache::Lookup;
use crate::load_balancer::PeerOutcome;
use crate::net::connector::BackendConnection;
use crate::observability::metrics;
use crate::resilience::FailureKind;

use super::attempt::AttemptState;
use super::{Step, UpstreamRequest};

/// Key of a cached response: host plus full request target.
pub(crate) fn cache_key(host: Option<&str>, uri: &str) -> String {
    format!("{}{}", host.unwrap_or(""), uri)
}

impl UpstreamRequest<'_> {
    /// Consult the cache before the first connect.
    pub(super) fn start(&mut self) -> Step {
        let (Some(cache), Some(policy)) = (self.cache.clone(), self.conf.cache.as_ref()) else {
            return Step::Connect;
        };
        if !matches!(self.request.method, Method::GET | Method::HEAD) {
            return Step::Connect;
        }

        let key = cache_key(self.request.host_name().as_deref(), &self.request.uri);
        if policy.bypasses(self.request) {
            metrics::record_cache("bypass");
        } else {
            let lookup = cache.lookup(&key);
            metrics::record_cache(lookup.label());
            tracing::debug!(request_id = %self.request.id, key = %key, result = lookup.label(), "Cache lookup");
            match lookup {
                Lookup::Hit(entry) => return Step::ServeCached(entry),
                Lookup::Updating(entry) if policy.stale_updating => return Step::ServeCached(entry),
                Lookup::Updating(entry) | Lookup::Stale(entry) => self.stale = Some(entry),
                Lookup::Miss => {}
            }
        }

        if !self.request.is_head() && !policy.no_cache(self.request) {
            self.cache_write = cache.begin_write(&key);
            self.flags.cacheable = self.cache_write.is_some();
        }
        Step::Connect
    }

    pub(super) async fn connect(&mut self) -> Step {
        let Some(peer) = self.peers.get_next() else {
            tracing::error!(request_id = %self.request.id, "no live upstreams");
            return Step::Next(FailureKind::NoLive);
        };

        metrics::record_attempt(&peer.name);
        self.attempts.push(AttemptState::new(peer.clone()));
        self.peer = Some(peer.clone());
        self.adapter.reinit();
        self.input.clear();
        self.flags.request_sent = false;

        let connector = self.upstream.connector.clone();
        let conn = match timeout(self.conf.timeouts.connect, connector.connect(&peer)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                tracing::warn!(request_id = %self.request.id, peer = %peer, error = %e, "connect() failed");
                return Step::Next(FailureKind::Error);
            }
            Err(_) => {
                tracing::warn!(request_id = %self.request.id, peer = %peer, "upstream timed out while connecting");
                return Step::Next(FailureKind::Timeout);
            }
        };

        let conn = match (&self.conf.tls, conn.reused) {
            (Some(tls), false) => {
                let BackendConnection { stream, addr, reused } = conn;
                match timeout(self.conf.timeouts.connect, tls.handshake(stream, &peer)).await {
                    Ok(Ok(stream)) => BackendConnection { stream, addr, reused },
                    Ok(Err(e)) => {
                        tracing::warn!(request_id = %self.request.id, peer = %peer, error = %e, "TLS handshake failed");
                        return Step::Next(FailureKind::Error);
                    }
                    Err(_) => {
                        tracing::warn!(request_id = %self.request.id, peer = %peer, "upstream timed out during TLS handshake");
                        return Step::Next(FailureKind::Timeout);
                    }
                }
            }
            _ => conn,
        };

        tracing::debug!(request_id = %self.request.id, peer = %peer, reused = conn.reused, "Connected to upstream");
        if let Some(attempt) = self.current_attempt() {
            attempt.connected();
        }
        self.connection = Some(conn);
        Step::Send
    }

    /// Another peer may be tried for this kind of failure.
    pub(super) fn retry_allowed(&self, kind: FailureKind) -> bool {
        self.conf.next_upstream.contains(kind)
            && !(self.flags.request_sent && self.flags.body_streamed)
            && !self.budget.deadline_elapsed()
    }

    pub(super) fn next_upstream(&mut self, kind: FailureKind) -> Step {
        metrics::record_failure(kind.name());
        if let Some(attempt) = self.current_attempt() {
            attempt.failure = Some(kind);
            attempt.finish();
        }
        if kind == FailureKind::Timeout {
            tracing::error!(request_id = %self.request.id, peer = ?self.peer.as_ref().map(|p| p.addr), "upstream timed out");
        }

        let reused = self.connection.as_ref().is_some_and(|c| c.reused);
        let zero_cost = reused
            && kind == FailureKind::Error
            && (!self.flags.request_sent || !self.flags.body_streamed);

        if self.peer.is_some() {
            let outcome = if zero_cost || !kind.counts_against_peer() {
                PeerOutcome::Next
            } else {
                PeerOutcome::Failed
            };
            self.release_peer(outcome);
            if zero_cost {
                self.budget.refund();
            }
        }
        self.close_connection();

        if self.flags.client_gone {
            return Step::Finalize(super::Outcome::ClientClosed);
        }
        if kind == FailureKind::NoLive || self.budget.remaining() == 0 || !self.retry_allowed(kind) {
            return self.terminate(kind);
        }

        tracing::info!(
            request_id = %self.request.id,
            kind = %kind,
            remaining = self.budget.remaining(),
            "Trying next upstream"
        );
        Step::Connect
    }

    /// No further attempt: a stale entry if allowed, else the error status.
    fn terminate(&mut self, kind: FailureKind) -> Step {
        let use_stale = self
            .conf
            .cache
            .as_ref()
            .is_some_and(|policy| policy.use_stale.contains(kind));
        if use_stale {
            if let Some(entry) = self.stale.take() {
                tracing::info!(request_id = %self.request.id, kind = %kind, "Serving stale cached response");
                metrics::record_cache("stale");
                return Step::ServeCached(entry);
            }
        }
        Step::Finalize(super::Outcome::Status(kind.terminal_status()))
    }
}
