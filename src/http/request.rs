//! Client request parsing.
//!
//! # Responsibilities
//! - Generate a unique request ID for tracing
//! - Parse the request head with httparse and enforce the head size limit
//! - Extract routing-relevant information (host, path)
//! - Describe the request body the way the upstream sender consumes it
//!
//! # Design Decisions
//! - Request ID assigned as early as possible for tracing
//! - Header size limits enforced before any body byte is read

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use bytes::Bytes;
use http::Method;
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

const MAX_HEADERS: usize = 100;

/// Unique identifier carried through logs and sent to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("request head too large")]
    TooLarge,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("invalid method")]
    Method,
    #[error("invalid Content-Length")]
    ContentLength,
    #[error("unsupported Transfer-Encoding")]
    TransferEncoding,
}

impl ParseError {
    /// Status for the error page.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::TooLarge => 431,
            ParseError::TransferEncoding => 501,
            _ => 400,
        }
    }
}

/// A parsed client request head.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub id: RequestId,
    pub method: Method,
    /// Request target as received (path and query).
    pub uri: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub client_addr: Option<SocketAddr>,
}

impl ClientRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").filter(|h| !h.is_empty())
    }

    /// Host without port, lower-cased, for route matching.
    pub fn host_name(&self) -> Option<String> {
        let host = self.host()?;
        let name = match host.rsplit_once(':') {
            Some((name, port)) if !name.ends_with(']') || port.is_empty() => {
                if port.chars().all(|c| c.is_ascii_digit()) {
                    name
                } else {
                    host
                }
            }
            Some((name, _)) => name,
            None => host,
        };
        Some(name.to_ascii_lowercase())
    }

    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("")
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// Client keeps the connection open after this request.
    pub fn keepalive(&self) -> bool {
        let connection = self.header("connection").unwrap_or("");
        let has = |token: &str| {
            connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        if self.version_minor >= 1 {
            !has("close")
        } else {
            has("keep-alive")
        }
    }

    /// Requested protocol when the client asks for an upgrade.
    pub fn upgrade(&self) -> Option<&str> {
        let connection = self.header("connection")?;
        let wants = connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
        if wants && self.version_minor >= 1 {
            self.header("upgrade")
        } else {
            None
        }
    }

    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some_and(|n| n > 0)
    }

    /// Same request re-targeted at another URI (internal redirect).
    pub fn redirected(&self, uri: &str) -> Self {
        let mut next = self.clone();
        next.uri = uri.to_string();
        if next.method != Method::HEAD {
            next.method = Method::GET;
        }
        next.headers.retain(|(n, _)| {
            !n.eq_ignore_ascii_case("content-length") && !n.eq_ignore_ascii_case("transfer-encoding")
        });
        next.content_length = None;
        next.chunked = false;
        next
    }
}

/// Parse a request head from `buf`.
///
/// `Ok(None)` means more bytes are needed; the `usize` is the head length.
pub fn parse_request_head(
    buf: &[u8],
    max_head: usize,
) -> Result<Option<(ClientRequest, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() >= max_head {
                return Err(ParseError::TooLarge);
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::TooLarge),
        Err(e) => return Err(ParseError::Malformed(e.to_string())),
    };
    if len > max_head {
        return Err(ParseError::TooLarge);
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(ParseError::Method)?;
    let uri = req.path.unwrap_or("/").to_string();
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
        .collect();

    let mut request = ClientRequest {
        id: RequestId::new(),
        method,
        uri,
        version_minor: req.version.unwrap_or(1),
        headers,
        content_length: None,
        chunked: false,
        client_addr: None,
    };

    if let Some(te) = request.header("transfer-encoding") {
        if !te.trim().eq_ignore_ascii_case("chunked") {
            return Err(ParseError::TransferEncoding);
        }
        request.chunked = true;
    } else if let Some(cl) = request.header("content-length") {
        let n = cl.parse::<u64>().map_err(|_| ParseError::ContentLength)?;
        request.content_length = Some(n);
    }

    Ok(Some((request, len)))
}

/// Client body as handed to the upstream sender.
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    /// Read completely into memory.
    Buffered(Bytes),
    /// Read completely, kept in a temp file.
    Spooled(SpooledBody),
    /// Still on the client socket; `length` bytes follow.
    Streaming { length: u64 },
}

impl RequestBody {
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Buffered(b) => Some(b.len() as u64),
            RequestBody::Spooled(s) => Some(s.len),
            RequestBody::Streaming { length } => Some(*length),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Body can be sent again on a retry.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Streaming { .. })
    }
}

#[derive(Debug)]
pub struct SpooledBody {
    file: NamedTempFile,
    pub len: u64,
}

impl SpooledBody {
    pub fn new(file: NamedTempFile, len: u64) -> Self {
        Self { file, len }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
