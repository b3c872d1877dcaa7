//! Response encoding towards the client.
//!
//! # Responsibilities
//! - Encode the response head with framing and connection headers
//! - Wrap body bytes into frames for the chosen framing
//! - Produce the relay's own error pages
//!
//! # Design Decisions
//! - A frame is written with single cancel-safe writes and remembers how
//!   far it got, so it can sit inside `tokio::select!`
//! - Backend timeouts surface as 504, everything else as 502

use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;

use crate::upstream::headers::OutboundHead;

pub const SERVER_NAME: &str = "upstream-relay";

/// How the body of a response is delimited on the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(u64),
    Chunked,
    /// Ends when the connection closes.
    Close,
    /// No body (HEAD, 204, 304).
    Empty,
    /// Upgraded connection, bytes pass through untouched.
    Raw,
}

pub fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Status line, headers and the terminating empty line.
pub fn encode_head(head: &OutboundHead, framing: Framing, keepalive: bool) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    let reason = if head.reason.is_empty() {
        reason_phrase(head.status)
    } else {
        head.reason.as_str()
    };
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", head.status, reason).as_bytes());

    if head.headers.get("server").is_none() {
        put_header(&mut out, "Server", SERVER_NAME);
    }
    if head.headers.get("date").is_none() {
        put_header(&mut out, "Date", &httpdate::fmt_http_date(SystemTime::now()));
    }
    for (name, value) in head.headers.iter() {
        put_header(&mut out, name, value);
    }

    match framing {
        Framing::Length(n) => put_header(&mut out, "Content-Length", &n.to_string()),
        Framing::Chunked => put_header(&mut out, "Transfer-Encoding", "chunked"),
        Framing::Empty => {
            if let Some(n) = head.content_length {
                put_header(&mut out, "Content-Length", &n.to_string());
            }
        }
        Framing::Close | Framing::Raw => {}
    }

    let connection = match framing {
        Framing::Raw => "upgrade",
        _ if keepalive => "keep-alive",
        _ => "close",
    };
    put_header(&mut out, "Connection", connection);
    out.put_slice(b"\r\n");
    out
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

/// Body bytes plus their framing, written piecewise.
#[derive(Debug, Clone)]
pub struct Frame {
    parts: [Bytes; 3],
    part: usize,
}

impl Frame {
    pub fn plain(body: Bytes) -> Self {
        Self {
            parts: [Bytes::new(), body, Bytes::new()],
            part: 0,
        }
    }

    pub fn chunk(body: Bytes) -> Self {
        let prefix = Bytes::from(format!("{:x}\r\n", body.len()));
        Self {
            parts: [prefix, body, Bytes::from_static(b"\r\n")],
            part: 0,
        }
    }

    /// Chunked-encoding terminator.
    pub fn last_chunk() -> Self {
        Self::plain(Bytes::from_static(b"0\r\n\r\n"))
    }

    /// Unsent bytes of the current part.
    pub fn pending(&self) -> &[u8] {
        self.parts[self.part..]
            .iter()
            .find(|p| !p.is_empty())
            .map(|p| &p[..])
            .unwrap_or(&[])
    }

    pub fn advance(&mut self, mut n: usize) {
        while n > 0 && self.part < self.parts.len() {
            let part = &mut self.parts[self.part];
            let take = n.min(part.len());
            let _ = part.split_to(take);
            n -= take;
            if part.is_empty() {
                self.part += 1;
            }
        }
        while self.part < self.parts.len() && self.parts[self.part].is_empty() {
            self.part += 1;
        }
    }

    pub fn is_done(&self) -> bool {
        self.parts[self.part.min(2)..].iter().all(Bytes::is_empty)
    }

    /// Body bytes carried, without framing.
    pub fn body_len(&self) -> usize {
        self.parts[1].len()
    }
}

/// The relay's own page for `status`.
pub fn error_page(status: u16, extra: Vec<(String, String)>) -> (OutboundHead, Bytes) {
    let reason = reason_phrase(status);
    let body = format!(
        "<html>\r\n<head><title>{status} {reason}</title></head>\r\n<body>\r\n<center><h1>{status} {reason}</h1></center>\r\n<hr><center>{SERVER_NAME}</center>\r\n</body>\r\n</html>\r\n"
    );
    let mut head = OutboundHead::new(status, reason);
    head.headers.insert_single("Content-Type", "text/html".into());
    for (name, value) in extra {
        head.headers.append(&name, value);
    }
    head.content_length = Some(body.len() as u64);
    (head, Bytes::from(body))
}
