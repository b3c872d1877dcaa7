//! One client connection.
//!
//! # Responsibilities
//! - Read request heads and bodies (in memory, spooled or streamed)
//! - Write the response head and body frames with the send timeout
//! - Notice a client that went away while the relay waits on a backend
//!
//! # Design Decisions
//! - Bytes the client sends ahead (pipelining) are kept in `pending` and
//!   consumed by the next read
//! - The rate limit delays before a write, never in the middle of one

use std::path::Path;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use crate::http::request::{parse_request_head, ClientRequest, ParseError, RequestBody, SpooledBody};
use crate::http::response::{encode_head, error_page, Frame, Framing};
use crate::net::BoxedStream;
use crate::protocol::chunked::{ChunkedDecoder, Decoded};
use crate::resilience::timeouts::{self, IoStep};
use crate::upstream::headers::OutboundHead;

/// Stop reading ahead once this much unconsumed client data piled up.
const MAX_PENDING: usize = 64 * 1024;

/// Outcome of waiting for a request head.
#[derive(Debug)]
pub enum ReadRequest {
    Request(ClientRequest),
    /// Closed or idle before a new request started.
    Closed,
    Invalid(ParseError),
    TimedOut,
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("client body timed out")]
    TimedOut,
    #[error("client closed connection while sending body")]
    Closed,
    #[error("invalid chunked body: {0}")]
    Chunked(#[from] crate::protocol::ChunkedError),
    #[error("client body I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What a probe of an idle client found.
#[derive(Debug)]
pub enum Probe {
    Closed,
    Data(usize),
    Failed(std::io::Error),
}

#[derive(Debug)]
struct RateLimit {
    bytes_per_sec: u64,
    started: Instant,
    sent: u64,
}

impl RateLimit {
    fn delay(&self) -> Option<Duration> {
        let due = Duration::from_secs_f64(self.sent as f64 / self.bytes_per_sec as f64);
        due.checked_sub(self.started.elapsed()).filter(|d| !d.is_zero())
    }
}

pub struct ClientConnection {
    io: BoxedStream,
    pending: BytesMut,
    send_timeout: Duration,
    framing: Framing,
    head_sent: bool,
    keepalive: bool,
    rate: Option<RateLimit>,
    body_sent: u64,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("pending", &self.pending.len())
            .field("framing", &self.framing)
            .field("head_sent", &self.head_sent)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl ClientConnection {
    pub fn new(io: BoxedStream, send_timeout: Duration) -> Self {
        Self {
            io,
            pending: BytesMut::with_capacity(4096),
            send_timeout,
            framing: Framing::Close,
            head_sent: false,
            keepalive: false,
            rate: None,
            body_sent: 0,
        }
    }

    /// Wait for the next request head. `idle` bounds the wait for the
    /// first byte, `limit` the rest of the head.
    pub async fn read_request(&mut self, max_head: usize, idle: Duration, limit: Duration) -> ReadRequest {
        self.head_sent = false;
        self.framing = Framing::Close;
        self.rate = None;
        self.body_sent = 0;

        let mut started: Option<Instant> = (!self.pending.is_empty()).then(Instant::now);
        loop {
            if !self.pending.is_empty() {
                match parse_request_head(&self.pending, max_head) {
                    Ok(Some((request, len))) => {
                        self.pending.advance(len);
                        return ReadRequest::Request(request);
                    }
                    Ok(None) => {}
                    Err(e) => return ReadRequest::Invalid(e),
                }
            }

            let wait = match started {
                None => idle,
                Some(at) => match limit.checked_sub(at.elapsed()) {
                    Some(left) => left,
                    None => return ReadRequest::TimedOut,
                },
            };
            match timeouts::read_buf_some(&mut self.io, &mut self.pending, max_head, wait).await {
                IoStep::Done(0) | IoStep::Failed(_) => return ReadRequest::Closed,
                IoStep::Done(_) => {
                    started.get_or_insert_with(Instant::now);
                }
                IoStep::TimedOut if started.is_none() => return ReadRequest::Closed,
                IoStep::TimedOut => return ReadRequest::TimedOut,
            }
        }
    }

    /// Read the whole body. Bodies larger than `memory_limit` go to a temp
    /// file in `temp_dir`.
    pub async fn read_body(
        &mut self,
        request: &ClientRequest,
        memory_limit: usize,
        temp_dir: Option<&Path>,
        limit: Duration,
    ) -> Result<RequestBody, BodyError> {
        if !request.has_body() {
            return Ok(RequestBody::Empty);
        }

        let mut memory = BytesMut::new();
        let mut spool: Option<(NamedTempFile, File, u64)> = None;
        let mut decoder = request.chunked.then(ChunkedDecoder::new);
        let mut remaining = request.content_length.unwrap_or(0);

        loop {
            let mut out = BytesMut::new();
            let done = match decoder.as_mut() {
                Some(decoder) => {
                    decoder.decode(&mut self.pending, &mut out, usize::MAX)? == Decoded::Done
                }
                None => {
                    let n = (remaining.min(self.pending.len() as u64)) as usize;
                    out.extend_from_slice(&self.pending[..n]);
                    self.pending.advance(n);
                    remaining -= n as u64;
                    remaining == 0
                }
            };

            if !out.is_empty() {
                if spool.is_none() && memory.len() + out.len() > memory_limit {
                    let temp = match temp_dir {
                        Some(dir) => NamedTempFile::new_in(dir)?,
                        None => NamedTempFile::new()?,
                    };
                    let mut writer = File::from_std(temp.reopen()?);
                    writer.write_all(&memory).await?;
                    spool = Some((temp, writer, memory.len() as u64));
                    memory.clear();
                }
                match spool.as_mut() {
                    Some((_, writer, len)) => {
                        writer.write_all(&out).await?;
                        *len += out.len() as u64;
                    }
                    None => memory.extend_from_slice(&out),
                }
            }

            if done {
                break;
            }
            self.fill(limit).await?;
        }

        Ok(match spool {
            Some((temp, mut writer, len)) => {
                writer.flush().await?;
                RequestBody::Spooled(SpooledBody::new(temp, len))
            }
            None if memory.is_empty() => RequestBody::Empty,
            None => RequestBody::Buffered(memory.freeze()),
        })
    }

    /// Next piece of a streamed body, at most `max` bytes.
    pub async fn read_body_chunk(&mut self, max: usize, limit: Duration) -> Result<Bytes, BodyError> {
        if self.pending.is_empty() {
            self.fill(limit).await?;
        }
        let n = max.min(self.pending.len());
        Ok(self.pending.split_to(n).freeze())
    }

    async fn fill(&mut self, limit: Duration) -> Result<(), BodyError> {
        match timeouts::read_buf_some(&mut self.io, &mut self.pending, 16 * 1024, limit).await {
            IoStep::Done(0) => Err(BodyError::Closed),
            IoStep::Done(_) => Ok(()),
            IoStep::TimedOut => Err(BodyError::TimedOut),
            IoStep::Failed(e) => Err(BodyError::Io(e)),
        }
    }

    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn disable_keepalive(&mut self) {
        self.keepalive = false;
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn body_sent(&self) -> u64 {
        self.body_sent
    }

    pub fn set_rate_limit(&mut self, bytes_per_sec: Option<u64>) {
        self.rate = bytes_per_sec.filter(|r| *r > 0).map(|bytes_per_sec| RateLimit {
            bytes_per_sec,
            started: Instant::now(),
            sent: 0,
        });
    }

    /// Framing for a response to `request`.
    pub fn choose_framing(head: &OutboundHead, request: &ClientRequest, upgrade: bool) -> Framing {
        if upgrade {
            return Framing::Raw;
        }
        if request.is_head() || matches!(head.status, 100..=199 | 204 | 304) {
            return Framing::Empty;
        }
        match head.content_length {
            Some(n) => Framing::Length(n),
            None if request.version_minor >= 1 => Framing::Chunked,
            None => Framing::Close,
        }
    }

    pub async fn send_head(&mut self, head: &OutboundHead, request: &ClientRequest, upgrade: bool) -> IoStep {
        self.framing = Self::choose_framing(head, request, upgrade);
        self.keepalive = !upgrade && request.keepalive() && self.framing != Framing::Close;
        let bytes = encode_head(head, self.framing, self.keepalive);
        self.head_sent = true;
        timeouts::write_all(&mut self.io, &bytes, self.send_timeout).await
    }

    /// Wrap body bytes for the current framing. `None` when nothing is to
    /// be written.
    pub fn frame(&self, data: Bytes) -> Option<Frame> {
        if data.is_empty() {
            return None;
        }
        match self.framing {
            Framing::Empty => None,
            Framing::Chunked => Some(Frame::chunk(data)),
            _ => Some(Frame::plain(data)),
        }
    }

    /// One write of the frame; cancel-safe.
    pub async fn write_frame_step(&mut self, frame: &mut Frame) -> IoStep {
        if let Some(delay) = self.rate.as_ref().and_then(RateLimit::delay) {
            sleep(delay).await;
        }
        let before = frame.body_len();
        let step = timeouts::write_some(&mut self.io, frame.pending(), self.send_timeout).await;
        if let IoStep::Done(n) = step {
            frame.advance(n);
            let body = (before - frame.body_len()) as u64;
            self.body_sent += body;
            if let Some(rate) = self.rate.as_mut() {
                rate.sent += n as u64;
            }
        }
        step
    }

    pub async fn write_frame(&mut self, frame: &mut Frame) -> IoStep {
        let mut total = 0;
        while !frame.is_done() {
            match self.write_frame_step(frame).await {
                IoStep::Done(n) => total += n,
                other => return other,
            }
        }
        IoStep::Done(total)
    }

    /// Frame and write `data` completely.
    pub async fn write_body(&mut self, data: Bytes) -> IoStep {
        match self.frame(data) {
            Some(mut frame) => self.write_frame(&mut frame).await,
            None => IoStep::Done(0),
        }
    }

    /// End the response body and flush.
    pub async fn finish(&mut self) -> IoStep {
        if self.framing == Framing::Chunked {
            let mut last = Frame::last_chunk();
            if let fail @ (IoStep::TimedOut | IoStep::Failed(_)) = self.write_frame(&mut last).await {
                return fail;
            }
        }
        timeouts::flush(&mut self.io, self.send_timeout).await
    }

    /// Wait until the client sends something or goes away.
    pub async fn probe(&mut self) -> Probe {
        if self.pending.len() >= MAX_PENDING {
            return std::future::pending().await;
        }
        match self.io.read_buf(&mut self.pending).await {
            Ok(0) => Probe::Closed,
            Ok(n) => Probe::Data(n),
            Err(e) => Probe::Failed(e),
        }
    }

    /// Write the pending frame if there is one, otherwise probe.
    pub async fn write_or_probe(&mut self, frame: Option<&mut Frame>) -> ClientEvent {
        match frame {
            Some(frame) => ClientEvent::Wrote(self.write_frame_step(frame).await),
            None => ClientEvent::Probed(self.probe().await),
        }
    }

    pub async fn send_error_page(
        &mut self,
        status: u16,
        extra: Vec<(String, String)>,
        request: &ClientRequest,
    ) -> IoStep {
        let (head, body) = error_page(status, extra);
        if let fail @ (IoStep::TimedOut | IoStep::Failed(_)) = self.send_head(&head, request, false).await {
            return fail;
        }
        if let fail @ (IoStep::TimedOut | IoStep::Failed(_)) = self.write_body(body).await {
            return fail;
        }
        self.finish().await
    }

    /// Bare error page when no request could be parsed.
    pub async fn send_bare_error(&mut self, status: u16) -> IoStep {
        let (head, body) = error_page(status, vec![]);
        self.framing = Framing::Length(body.len() as u64);
        self.keepalive = false;
        self.head_sent = true;
        let mut bytes = encode_head(&head, self.framing, false);
        bytes.extend_from_slice(&body);
        timeouts::write_all(&mut self.io, &bytes, self.send_timeout).await
    }

    /// Raw socket and any bytes read ahead, for the upgrade relay.
    pub fn upgrade_parts(&mut self) -> (&mut BoxedStream, &mut BytesMut) {
        (&mut self.io, &mut self.pending)
    }
}

/// Result of `write_or_probe`.
#[derive(Debug)]
pub enum ClientEvent {
    Wrote(IoStep),
    Probed(Probe),
}
