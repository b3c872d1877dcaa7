//! Ending an upstream request.

use std::time::SystemTime;

use crate::cache::CachedResponse;
use crate::load_balancer::PeerOutcome;
use crate::observability::metrics;
use crate::resilience::timeouts::IoStep;

use super::attempt::summarize;
use super::{Completion, FinalizeError, Outcome, Phase, UpstreamRequest};

/// Status logged for a client that went away.
const CLIENT_CLOSED: u16 = 499;

impl UpstreamRequest<'_> {
    /// Release everything the request holds and tell the caller what is
    /// left to do. Only the first call does anything.
    pub async fn finalize(&mut self, outcome: Outcome) -> Result<Completion, FinalizeError> {
        if self.phase == Phase::Finalized {
            return Err(FinalizeError::AlreadyFinalized);
        }
        self.phase = Phase::Finalized;

        if let Some(attempt) = self.attempts.last_mut() {
            attempt.bytes = self.relayed;
            attempt.finish();
        }
        let complete = self.flags.response_complete && outcome == Outcome::Done;

        if let Some(peer) = self.peer.take() {
            self.peers.report_outcome(&peer, PeerOutcome::Success);
        }
        if let Some(conn) = self.connection.take() {
            let reusable =
                complete && !self.flags.upgrade && self.input.is_empty() && self.adapter.keepalive();
            self.upstream.connector.release(conn, reusable);
        }

        self.finish_cache(complete).await;
        if self.flags.store && complete {
            if let Some(dest) = self.conf.store_path(self.request.path()) {
                match self.spill.persist(&dest).await {
                    Ok(()) => tracing::debug!(request_id = %self.request.id, path = %dest.display(), "Response stored"),
                    Err(e) => tracing::error!(request_id = %self.request.id, error = %e, "Failed to store response"),
                }
            }
        }
        self.spill.release();

        let status = self.out_head.as_ref().map_or(200, |head| head.status);
        let completion = match outcome {
            Outcome::Done if self.flags.client_gone => Completion::ClientClosed,
            Outcome::Done if self.flags.upgrade => Completion::Responded { status },
            Outcome::Done => match self.downstream.finish().await {
                IoStep::Done(_) => Completion::Responded { status },
                IoStep::TimedOut | IoStep::Failed(_) => Completion::ClientClosed,
            },
            Outcome::Status(_) if self.downstream.head_sent() => {
                self.downstream.disable_keepalive();
                Completion::Aborted
            }
            Outcome::Status(status) => Completion::ErrorPage {
                status,
                headers: std::mem::take(&mut self.error_headers),
            },
            Outcome::ClientClosed => Completion::ClientClosed,
            Outcome::Redirect(uri) => Completion::InternalRedirect(uri),
        };

        let logged = match &completion {
            Completion::Responded { status } | Completion::ErrorPage { status, .. } => *status,
            Completion::Aborted => status,
            Completion::ClientClosed => CLIENT_CLOSED,
            Completion::InternalRedirect(_) => 0,
        };
        metrics::record_response(logged, self.started);
        tracing::info!(
            request_id = %self.request.id,
            method = %self.request.method,
            uri = %self.request.uri,
            status = logged,
            bytes = self.relayed,
            cached = self.flags.from_cache,
            upstreams = %summarize(&self.attempts),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Upstream request finished"
        );
        Ok(completion)
    }

    /// Commit the cache entry when the body is complete, otherwise give the
    /// key back.
    async fn finish_cache(&mut self, complete: bool) {
        let Some(handle) = self.cache_write.take() else {
            return;
        };
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let (Some(head), Some(valid_for), true) =
            (self.out_head.as_ref(), self.valid_for, complete && self.flags.cacheable)
        else {
            cache.abandon(handle);
            return;
        };

        match self.spill.read_all().await {
            Ok(body) => {
                let response = CachedResponse {
                    status: head.status,
                    reason: head.reason.clone(),
                    headers: head.headers.clone(),
                    body,
                    stored_at: SystemTime::now(),
                    valid_for,
                };
                match cache.commit(handle, response) {
                    Ok(()) => tracing::debug!(request_id = %self.request.id, valid_secs = valid_for.as_secs(), "Response cached"),
                    Err(e) => tracing::warn!(request_id = %self.request.id, error = %e, "Cache commit rejected"),
                }
            }
            Err(e) => {
                tracing::warn!(request_id = %self.request.id, error = %e, "Cannot read spilled body for the cache");
                cache.abandon(handle);
            }
        }
    }
}
