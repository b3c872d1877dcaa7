//! Buffered relay.
//!
//! Backend reads and client writes run concurrently. Filtered body bytes
//! go into arena buffers; once too much sits unsent (or no buffer is
//! free) they go to the spill file instead. Responses that will be cached
//! or stored go to the spill file entirely, so the file ends up holding
//! the whole body. The client is fed from one queue of memory and file
//! segments, which keeps the order of bytes intact.

use std::collections::VecDeque;

use bytes::BytesMut;
use thiserror::Error;

use crate::config::UpstreamConf;
use crate::http::connection::{ClientEvent, Probe};
use crate::http::request::RequestId;
use crate::http::response::Frame;
use crate::protocol::{AdapterError, BodyProgress};
use crate::resilience::timeouts::{self, IoStep};

use super::super::buffer::{ArenaError, BufferArena, BufferId};
use super::super::spill::{SpillError, TempFileSpill};
use super::super::{Outcome, Step, UpstreamRequest};
use super::Event;

#[derive(Debug, Error)]
enum RelayError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Spill(#[from] SpillError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("spill file ended before its queued bytes")]
    ShortSpill,
}

#[derive(Debug)]
enum Segment {
    Memory(BufferId),
    File(u64),
}

#[derive(Debug)]
enum Origin {
    Memory(BufferId),
    File,
}

/// Where the next filtered bytes go.
enum Sink {
    Memory,
    File,
    Blocked,
}

struct Pipe {
    request_id: RequestId,
    arena: BufferArena,
    queue: VecDeque<Segment>,
    filling: Option<BufferId>,
    /// Filtered bytes headed for the spill file, written in
    /// `temp_file_write_size` pieces.
    spill_pending: BytesMut,
    in_flight: Option<(Origin, Frame)>,
    /// Everything goes through the spill file.
    to_file: bool,
    unsent_memory: usize,
    spilled: u64,
    backend_eof: bool,
    upstream_done: bool,
}

impl Pipe {
    fn new(request_id: RequestId, conf: &UpstreamConf, to_file: bool) -> Self {
        Self {
            request_id,
            arena: BufferArena::new(conf.buffers.count, conf.buffers.size),
            queue: VecDeque::new(),
            filling: None,
            spill_pending: BytesMut::new(),
            in_flight: None,
            to_file,
            unsent_memory: 0,
            spilled: 0,
            backend_eof: false,
            upstream_done: false,
        }
    }

    fn sink(&self, conf: &UpstreamConf) -> Sink {
        if self.to_file {
            return Sink::File;
        }
        if self.filling.is_some() {
            return Sink::Memory;
        }
        let size = self.arena.buffer_size() as u64;
        let spill_ok = conf.max_temp_file_size > 0 && self.spilled + size <= conf.max_temp_file_size;
        let pressure = self.unsent_memory >= conf.busy_buffers_size || self.arena.free_count() == 0;
        if pressure && spill_ok {
            Sink::File
        } else if self.arena.free_count() > 0 {
            Sink::Memory
        } else {
            Sink::Blocked
        }
    }

    fn queue_file(&mut self, n: u64) {
        match self.queue.back_mut() {
            Some(Segment::File(queued)) => *queued += n,
            _ => self.queue.push_back(Segment::File(n)),
        }
    }

    async fn flush_spill(&mut self, spill: &mut TempFileSpill) -> Result<(), RelayError> {
        if self.spill_pending.is_empty() {
            return Ok(());
        }
        if !spill.is_created() && !self.to_file {
            tracing::warn!(request_id = %self.request_id, "an upstream response is buffered to a temporary file");
        }
        let data = self.spill_pending.split();
        spill.append(&data).await?;
        self.spilled += data.len() as u64;
        self.queue_file(data.len() as u64);
        Ok(())
    }

    /// Queue the buffer being filled, after any bytes waiting for the file.
    async fn queue_filling(&mut self, spill: &mut TempFileSpill) -> Result<(), RelayError> {
        let Some(id) = self.filling.take() else {
            return Ok(());
        };
        let len = self.arena.len_of(id);
        if len == 0 {
            self.arena.release(id)?;
            return Ok(());
        }
        self.flush_spill(spill).await?;
        self.unsent_memory += len;
        self.queue.push_back(Segment::Memory(id));
        Ok(())
    }

    /// Stop feeding a client that went away; the spill file keeps the body.
    fn discard_client(&mut self) -> Result<(), ArenaError> {
        if let Some((Origin::Memory(id), _)) = self.in_flight.take() {
            self.arena.confirm(id)?;
        }
        while let Some(segment) = self.queue.pop_front() {
            if let Segment::Memory(id) = segment {
                self.arena.release(id)?;
            }
        }
        self.unsent_memory = 0;
        Ok(())
    }
}

impl UpstreamRequest<'_> {
    pub(super) async fn relay_buffered(&mut self) -> Step {
        let to_file = self.flags.cacheable || self.flags.store;
        let mut pipe = Pipe::new(self.request.id, &self.conf, to_file);
        match self.pump_buffered(&mut pipe).await {
            Ok(step) => step,
            Err(RelayError::Adapter(e)) => {
                tracing::error!(request_id = %self.request.id, error = %e, "upstream sent invalid body");
                Step::Finalize(Outcome::Status(502))
            }
            Err(e) => {
                tracing::error!(request_id = %self.request.id, error = %e, "buffered relay failed");
                Step::Finalize(Outcome::Status(500))
            }
        }
    }

    async fn pump_buffered(&mut self, pipe: &mut Pipe) -> Result<Step, RelayError> {
        let conf = self.conf.clone();
        loop {
            let blocked = self.absorb(pipe).await?;
            if pipe.backend_eof && !pipe.upstream_done && !blocked {
                if let Err(e) = self.adapter.filter_eof() {
                    tracing::error!(request_id = %self.request.id, error = %e, "upstream prematurely closed connection while relaying");
                    return Ok(Step::Finalize(Outcome::Status(502)));
                }
                pipe.upstream_done = true;
                pipe.queue_filling(&mut self.spill).await?;
                pipe.flush_spill(&mut self.spill).await?;
            }
            self.schedule(pipe).await?;

            let client_idle = pipe.in_flight.is_none() && pipe.queue.is_empty();
            if pipe.upstream_done && (self.flags.client_gone || client_idle) {
                self.flags.response_complete = true;
                return Ok(Step::Finalize(Outcome::Done));
            }

            let room = conf.buffer_size.saturating_sub(self.input.len());
            let read_enabled = !pipe.backend_eof && !pipe.upstream_done && room > 0;
            let write_enabled =
                !self.flags.client_gone && (pipe.in_flight.is_some() || self.probes_client());
            if !read_enabled && !write_enabled {
                tracing::error!(request_id = %self.request.id, "buffered relay stalled");
                return Ok(Step::Finalize(Outcome::Status(502)));
            }

            let unsent_body = pipe.in_flight.as_ref().map_or(0, |(_, frame)| frame.body_len());
            let event = {
                let read_timeout = conf.timeouts.read;
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
                let frame = pipe.in_flight.as_mut().map(|(_, frame)| frame);
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
                Event::Backend(IoStep::Done(0)) => pipe.backend_eof = true,
                Event::Backend(IoStep::Done(_)) => {}
                Event::Backend(IoStep::TimedOut) => {
                    tracing::error!(request_id = %self.request.id, "upstream timed out while relaying");
                    return Ok(Step::Finalize(Outcome::Status(504)));
                }
                Event::Backend(IoStep::Failed(e)) => {
                    tracing::error!(request_id = %self.request.id, error = %e, "upstream read failed while relaying");
                    return Ok(Step::Finalize(Outcome::Status(502)));
                }
                Event::Client(ClientEvent::Wrote(IoStep::Done(_))) => {
                    let left = pipe.in_flight.as_ref().map_or(0, |(_, frame)| frame.body_len());
                    self.relayed += unsent_body.saturating_sub(left) as u64;
                    if pipe.in_flight.as_ref().is_some_and(|(_, frame)| frame.is_done()) {
                        if let Some((Origin::Memory(id), _)) = pipe.in_flight.take() {
                            pipe.arena.confirm(id)?;
                        }
                    }
                }
                Event::Client(ClientEvent::Probed(Probe::Data(_))) => {}
                Event::Client(
                    ClientEvent::Wrote(IoStep::TimedOut | IoStep::Failed(_))
                    | ClientEvent::Probed(Probe::Closed | Probe::Failed(_)),
                ) => {
                    self.flags.client_gone = true;
                    if !pipe.to_file {
                        tracing::info!(request_id = %self.request.id, "client closed connection while relaying");
                        return Ok(Step::Finalize(Outcome::ClientClosed));
                    }
                    tracing::info!(request_id = %self.request.id, "client closed connection, reading the rest of the response for the cache");
                    pipe.discard_client()?;
                }
            }
        }
    }

    /// Filter whatever the backend sent into buffers or the spill file.
    /// Returns whether input is left waiting for a free buffer.
    async fn absorb(&mut self, pipe: &mut Pipe) -> Result<bool, RelayError> {
        let size = pipe.arena.buffer_size();
        let mut blocked = false;
        while !pipe.upstream_done && !self.input.is_empty() {
            let before = self.input.len();
            let progress = match pipe.sink(&self.conf) {
                Sink::Blocked => {
                    blocked = true;
                    break;
                }
                Sink::Memory => {
                    let id = match pipe.filling {
                        Some(id) => id,
                        None => match pipe.arena.acquire() {
                            Some(id) => {
                                pipe.filling = Some(id);
                                id
                            }
                            None => {
                                blocked = true;
                                break;
                            }
                        },
                    };
                    let buf = pipe.arena.get_mut(id)?;
                    let room = size.saturating_sub(buf.len());
                    let progress = self.adapter.filter_chunk(&mut self.input, buf, room)?;
                    if pipe.arena.len_of(id) >= size {
                        pipe.queue_filling(&mut self.spill).await?;
                    }
                    progress
                }
                Sink::File => {
                    let mut out = BytesMut::with_capacity(size);
                    let progress = self.adapter.filter_chunk(&mut self.input, &mut out, size)?;
                    pipe.spill_pending.unsplit(out);
                    if pipe.spill_pending.len() >= self.conf.temp_file_write_size {
                        pipe.flush_spill(&mut self.spill).await?;
                    }
                    progress
                }
            };
            if progress == BodyProgress::Done {
                pipe.upstream_done = true;
            } else if self.input.len() == before {
                break;
            }
        }

        if pipe.upstream_done {
            pipe.queue_filling(&mut self.spill).await?;
            pipe.flush_spill(&mut self.spill).await?;
        }
        Ok(blocked)
    }

    /// Hand the next segment to the client writer if it is idle.
    async fn schedule(&mut self, pipe: &mut Pipe) -> Result<(), RelayError> {
        if pipe.in_flight.is_some() || self.flags.client_gone {
            return Ok(());
        }
        if pipe.queue.is_empty() {
            pipe.queue_filling(&mut self.spill).await?;
            pipe.flush_spill(&mut self.spill).await?;
        }

        let size = pipe.arena.buffer_size();
        while let Some(segment) = pipe.queue.pop_front() {
            let (origin, data) = match segment {
                Segment::Memory(id) => {
                    pipe.unsent_memory = pipe.unsent_memory.saturating_sub(pipe.arena.len_of(id));
                    (Origin::Memory(id), pipe.arena.dispatch(id)?)
                }
                Segment::File(queued) => {
                    let data = self.spill.read_chunk(queued.min(size as u64) as usize).await?;
                    let got = data.len() as u64;
                    if got == 0 {
                        return Err(RelayError::ShortSpill);
                    }
                    if queued > got {
                        pipe.queue.push_front(Segment::File(queued - got));
                    }
                    (Origin::File, data)
                }
            };
            match self.downstream.frame(data) {
                Some(frame) => {
                    pipe.in_flight = Some((origin, frame));
                    return Ok(());
                }
                None => {
                    if let Origin::Memory(id) = origin {
                        pipe.arena.confirm(id)?;
                    }
                }
            }
        }
        Ok(())
    }
}
