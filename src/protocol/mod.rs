//! Backend protocol adapters.
//!
//! # Data Flow
//! ```text
//! ClientRequest
//!     → build_request (request head bytes)
//! backend bytes
//!     → process_header (NeedMore | Complete(head) | Invalid | Fatal)
//!     → filter_init (body framing from the head)
//!     → filter_chunk (raw bytes → client-ready body bytes, bounded)
//!     → filter_eof (is a close a valid end of body?)
//! ```
//!
//! # Design Decisions
//! - Adapters never touch sockets; the upstream request owns all I/O
//! - Parsed head bytes are consumed from the input buffer, body bytes
//!   that arrived with the head stay in it
//! - One adapter instance per request; `reinit` resets it between attempts

pub mod chunked;
pub mod http1;

use std::fmt;

use bytes::BytesMut;
use thiserror::Error;

use crate::http::request::ClientRequest;
use crate::load_balancer::PeerPick;
use crate::upstream::headers::NormalizedHeaderSet;

pub use chunked::{ChunkedDecoder, ChunkedError};
pub use http1::Http1Adapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream prematurely closed connection")]
    PrematureClose,
    #[error("upstream sent invalid chunked response: {0}")]
    Chunked(#[from] ChunkedError),
    #[error("cannot build upstream request: {0}")]
    Request(String),
}

/// Parsed backend response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version_minor: u8,
    pub headers: NormalizedHeaderSet,
}

/// Outcome of one `process_header` call.
#[derive(Debug)]
pub enum HeaderParse {
    NeedMore,
    Complete(ResponseHead),
    /// Malformed head; retryable as an invalid header.
    Invalid(String),
    /// Not retryable.
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyProgress {
    More,
    Done,
}

pub trait ProtocolAdapter: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Request head; the body is sent separately by the caller.
    fn build_request(
        &mut self,
        request: &ClientRequest,
        body_len: Option<u64>,
        peer: &PeerPick,
    ) -> Result<BytesMut, AdapterError>;

    /// Forget everything learned from a previous attempt.
    fn reinit(&mut self);

    fn process_header(&mut self, input: &mut BytesMut) -> HeaderParse;

    /// Prepare body filtering; `Done` when no body follows.
    fn filter_init(&mut self, head: &ResponseHead) -> Result<BodyProgress, AdapterError>;

    /// Move body bytes from `input` into `out`, appending at most `limit`.
    fn filter_chunk(
        &mut self,
        input: &mut BytesMut,
        out: &mut BytesMut,
        limit: usize,
    ) -> Result<BodyProgress, AdapterError>;

    /// Backend closed the connection.
    fn filter_eof(&mut self) -> Result<(), AdapterError>;

    /// Connection can carry another request.
    fn keepalive(&self) -> bool;
}
