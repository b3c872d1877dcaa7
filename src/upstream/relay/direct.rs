//! Unbuffered relay.
//!
//! One backend buffer of `buffer_size` bytes and at most one frame on its
//! way to the client. Backend reads and client writes are selected
//! together; reads stop only while the backend buffer is full.

use bytes::BytesMut;

use crate::http::connection::{ClientEvent, Probe};
use crate::http::response::Frame;
use crate::protocol::BodyProgress;
use crate::resilience::timeouts::{self, IoStep};

use super::super::{Outcome, Step, UpstreamRequest};
use super::Event;

impl UpstreamRequest<'_> {
    pub(super) async fn relay_direct(&mut self) -> Step {
        let limit = self.conf.buffer_size;
        let read_timeout = self.conf.timeouts.read;
        let mut out = BytesMut::with_capacity(limit);
        let mut pending: Option<Frame> = None;
        let mut backend_eof = false;
        let mut upstream_done = false;

        loop {
            while pending.is_none() && !upstream_done && !self.input.is_empty() {
                let before = self.input.len();
                let progress = match self.adapter.filter_chunk(&mut self.input, &mut out, limit) {
                    Ok(progress) => progress,
                    Err(e) => {
                        tracing::error!(request_id = %self.request.id, error = %e, "upstream sent invalid body");
                        return Step::Finalize(Outcome::Status(502));
                    }
                };
                if !out.is_empty() {
                    pending = self.downstream.frame(out.split().freeze());
                }
                if progress == BodyProgress::Done {
                    upstream_done = true;
                } else if self.input.len() == before {
                    break;
                }
            }

            if backend_eof && !upstream_done && pending.is_none() {
                if let Err(e) = self.adapter.filter_eof() {
                    tracing::error!(request_id = %self.request.id, error = %e, "upstream prematurely closed connection while relaying");
                    return Step::Finalize(Outcome::Status(502));
                }
                upstream_done = true;
            }

            if upstream_done && pending.is_none() {
                self.flags.response_complete = true;
                return Step::Finalize(Outcome::Done);
            }

            let room = limit.saturating_sub(self.input.len());
            let read_enabled = !backend_eof && !upstream_done && room > 0;
            if !read_enabled && pending.is_none() {
                tracing::error!(request_id = %self.request.id, "direct relay stalled");
                return Step::Finalize(Outcome::Status(502));
            }
            let write_enabled = pending.is_some() || self.probes_client();

            let unsent_body = pending.as_ref().map_or(0, Frame::body_len);
            let event = {
                let conn = self.connection.as_mut();
                let input = &mut self.input;
                let backend = async move {
                    match conn {
                        Some(conn) if read_enabled => {
                            timeouts::read_buf_some(&mut conn.stream, input, room, read_timeout).await
                        }
                        Some(_) => std::future::pending().await,
                        None => IoStep::Failed(std::io::ErrorKind::NotConnected.into()),
                    }
                };
                let frame = pending.as_mut();
                let downstream = &mut *self.downstream;
                let client = async move {
                    if write_enabled {
                        downstream.write_or_probe(frame).await
                    } else {
                        std::future::pending().await
                    }
                };
                tokio::select! {
                    step = backend => Event::Backend(step),
                    event = client => Event::Client(event),
                }
            };

            match event {
                Event::Backend(IoStep::Done(0)) => backend_eof = true,
                Event::Backend(IoStep::Done(_)) => {}
                Event::Backend(IoStep::TimedOut) => {
                    tracing::error!(request_id = %self.request.id, "upstream timed out while relaying");
                    return Step::Finalize(Outcome::Status(504));
                }
                Event::Backend(IoStep::Failed(e)) => {
                    tracing::error!(request_id = %self.request.id, error = %e, "upstream read failed while relaying");
                    return Step::Finalize(Outcome::Status(502));
                }
                Event::Client(ClientEvent::Wrote(IoStep::Done(_))) => {
                    let left = pending.as_ref().map_or(0, Frame::body_len);
                    self.relayed += unsent_body.saturating_sub(left) as u64;
                    if pending.as_ref().is_some_and(Frame::is_done) {
                        pending = None;
                    }
                }
                Event::Client(ClientEvent::Probed(Probe::Data(_))) => {}
                Event::Client(
                    ClientEvent::Wrote(IoStep::TimedOut | IoStep::Failed(_))
                    | ClientEvent::Probed(Probe::Closed | Probe::Failed(_)),
                ) => {
                    tracing::info!(request_id = %self.request.id, "client closed connection while relaying");
                    self.flags.client_gone = true;
                    return Step::Finalize(Outcome::ClientClosed);
                }
            }
        }
    }
}
