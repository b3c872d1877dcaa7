//! Reading and processing the response head.

use std::time::SystemTime;

use crate::http::connection::Probe;
use crate::protocol::{BodyProgress, HeaderParse, ResponseHead};
use crate::resilience::timeouts::{self, IoStep};
use crate::resilience::FailureKind;

use super::dispatch::dispatch;
use super::relay::RelayMode;
use super::{Outcome, Step, UpstreamRequest};

/// Result of waiting on the backend while optionally watching the client.
pub(super) enum BackendRead {
    Read(IoStep),
    ClientGone,
    /// The client sent bytes; nothing was read from the backend.
    ClientData,
}

impl UpstreamRequest<'_> {
    /// Read up to `max` bytes from the backend into `input`, watching the
    /// client unless told not to.
    pub(super) async fn read_backend(&mut self, max: usize) -> BackendRead {
        let probe = self.probes_client() && !self.flags.client_gone;
        let read_timeout = self.conf.timeouts.read;
        let Some(conn) = self.connection.as_mut() else {
            return BackendRead::Read(IoStep::Failed(std::io::ErrorKind::NotConnected.into()));
        };
        let read = timeouts::read_buf_some(&mut conn.stream, &mut self.input, max, read_timeout);
        if !probe {
            return BackendRead::Read(read.await);
        }
        let downstream = &mut *self.downstream;
        tokio::select! {
            step = read => BackendRead::Read(step),
            probe = downstream.probe() => match probe {
                Probe::Data(_) => BackendRead::ClientData,
                Probe::Closed | Probe::Failed(_) => BackendRead::ClientGone,
            },
        }
    }

    pub(super) async fn read_header(&mut self) -> Step {
        let limit = self.conf.buffer_size;
        loop {
            if !self.input.is_empty() {
                match self.adapter.process_header(&mut self.input) {
                    HeaderParse::Complete(head) => return self.process_header(head).await,
                    HeaderParse::NeedMore if self.input.len() >= limit => {
                        tracing::error!(request_id = %self.request.id, peer = ?self.peer.as_ref().map(|p| p.addr), "upstream sent too big header");
                        return Step::Next(FailureKind::InvalidHeader);
                    }
                    HeaderParse::NeedMore => {}
                    HeaderParse::Invalid(reason) => {
                        tracing::error!(request_id = %self.request.id, reason = %reason, "upstream sent invalid header");
                        return Step::Next(FailureKind::InvalidHeader);
                    }
                    HeaderParse::Fatal(reason) => {
                        tracing::error!(request_id = %self.request.id, reason = %reason, "upstream sent unusable response");
                        return Step::Finalize(Outcome::Status(502));
                    }
                }
            }

            let room = limit - self.input.len();
            match self.read_backend(room).await {
                BackendRead::Read(IoStep::Done(0)) => {
                    tracing::error!(request_id = %self.request.id, "upstream prematurely closed connection while reading response header");
                    return Step::Next(FailureKind::Error);
                }
                BackendRead::Read(IoStep::Done(_)) | BackendRead::ClientData => {}
                BackendRead::Read(IoStep::TimedOut) => return Step::Next(FailureKind::Timeout),
                BackendRead::Read(IoStep::Failed(e)) => {
                    tracing::error!(request_id = %self.request.id, error = %e, "upstream read failed");
                    return Step::Next(FailureKind::Error);
                }
                BackendRead::ClientGone => {
                    tracing::info!(request_id = %self.request.id, "client closed connection while waiting for upstream");
                    self.flags.client_gone = true;
                    return Step::Finalize(Outcome::ClientClosed);
                }
            }
        }
    }

    /// Decide what a complete head means: retry, stale, intercept, redirect,
    /// or relay to the client.
    async fn process_header(&mut self, head: ResponseHead) -> Step {
        let status = head.status;
        if let Some(attempt) = self.current_attempt() {
            attempt.header_received(status);
        }
        tracing::debug!(request_id = %self.request.id, status, "Upstream response header");

        if status == 101 {
            if self.request.upgrade().is_none() {
                tracing::error!(request_id = %self.request.id, "upstream sent 101 to a request without upgrade");
                return Step::Next(FailureKind::InvalidHeader);
            }
            self.flags.upgrade = true;
        }

        if let Some(kind) = FailureKind::from_status(status) {
            if self.budget.remaining() > 1 && self.retry_allowed(kind) {
                return Step::Next(kind);
            }
            let use_stale = self
                .conf
                .cache
                .as_ref()
                .is_some_and(|policy| policy.use_stale.contains(kind));
            if use_stale {
                if let Some(entry) = self.stale.take() {
                    tracing::info!(request_id = %self.request.id, status, "Serving stale cached response");
                    return Step::ServeCached(entry);
                }
            }
        }

        if !self.flags.upgrade && self.conf.intercepts(status) {
            if status == 401 {
                self.error_headers = head
                    .headers
                    .get_all("www-authenticate")
                    .iter()
                    .map(|r| (r.name.clone(), r.value.clone()))
                    .collect();
            }
            tracing::debug!(request_id = %self.request.id, status, "Intercepting upstream error");
            return Step::Finalize(Outcome::Status(status));
        }

        let cache_active = self.cache_write.is_some();
        let (out, meta) = dispatch(&head.headers, &self.conf.headers, status, &head.reason, cache_active);

        if let Some(uri) = meta.accel_redirect.clone() {
            tracing::debug!(request_id = %self.request.id, uri = %uri, "Internal redirect from upstream");
            return Step::Finalize(Outcome::Redirect(uri));
        }

        let mut buffering = self.conf.buffering;
        if self.conf.change_buffering {
            if let Some(wanted) = meta.accel_buffering {
                buffering = wanted;
            }
        }

        if let (true, Some(policy)) = (cache_active, self.conf.cache.as_ref()) {
            self.valid_for = meta.validity(SystemTime::now(), policy.valid_for(status));
            self.flags.cacheable = self.valid_for.is_some();
        }
        self.flags.store = self.conf.store.is_some() && status == 200 && !self.request.is_head();
        if !buffering || self.flags.upgrade {
            self.flags.cacheable = false;
            self.flags.store = false;
        }
        self.flags.buffering = buffering;

        let progress = match self.adapter.filter_init(&head) {
            Ok(progress) => progress,
            Err(e) => {
                tracing::error!(request_id = %self.request.id, error = %e, "upstream sent unusable body framing");
                return Step::Finalize(Outcome::Status(502));
            }
        };

        self.downstream.set_rate_limit(meta.accel_limit_rate);
        match self.downstream.send_head(&out, self.request, self.flags.upgrade).await {
            IoStep::Done(_) => {}
            IoStep::TimedOut | IoStep::Failed(_) => {
                tracing::info!(request_id = %self.request.id, "client closed connection while sending response header");
                self.flags.client_gone = true;
                if !self.flags.cacheable && !self.flags.store {
                    return Step::Finalize(Outcome::ClientClosed);
                }
            }
        }
        self.out_head = Some(out);
        self.meta = meta;

        if self.flags.upgrade {
            return Step::Relay(RelayMode::Upgrade);
        }
        if progress == BodyProgress::Done {
            self.flags.response_complete = true;
            return Step::Finalize(Outcome::Done);
        }
        if self.flags.buffering {
            Step::Relay(RelayMode::Buffered)
        } else {
            Step::Relay(RelayMode::Direct)
        }
    }
}
