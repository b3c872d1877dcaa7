//! HTTP/1.x proxy adapter.
//!
//! # Responsibilities
//! - Encode the client request for the backend (hop-by-hop headers
//!   stripped, Host/Content-Length/X-Forwarded-For set)
//! - Parse the response head with httparse, skipping interim 1xx heads
//! - Frame the body: Content-Length, chunked, or read-until-close

use bytes::{Buf, BytesMut};
use http::Method;

use crate::http::request::ClientRequest;
use crate::load_balancer::PeerPick;
use crate::protocol::chunked::{ChunkedDecoder, Decoded};
use crate::protocol::{AdapterError, BodyProgress, HeaderParse, ProtocolAdapter, ResponseHead};
use crate::upstream::headers::NormalizedHeaderSet;

const MAX_HEADERS: usize = 100;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "x-request-id",
];

#[derive(Debug, Clone)]
enum Body {
    /// `filter_init` not called yet.
    Pending,
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
    Done,
}

#[derive(Debug)]
pub struct Http1Adapter {
    /// Ask the backend to keep the connection open.
    keepalive_wanted: bool,
    head_request: bool,
    body: Body,
    keepalive: bool,
}

impl Http1Adapter {
    pub fn new(keepalive_wanted: bool) -> Self {
        Self {
            keepalive_wanted,
            head_request: false,
            body: Body::Pending,
            keepalive: false,
        }
    }
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

impl ProtocolAdapter for Http1Adapter {
    fn name(&self) -> &'static str {
        "http1"
    }

    fn build_request(
        &mut self,
        request: &ClientRequest,
        body_len: Option<u64>,
        peer: &PeerPick,
    ) -> Result<BytesMut, AdapterError> {
        if request.uri.is_empty() || request.uri.contains(['\r', '\n', ' ']) {
            return Err(AdapterError::Request(format!("bad uri {:?}", request.uri)));
        }
        self.head_request = request.method == Method::HEAD;

        let mut out = BytesMut::with_capacity(512);
        out.extend_from_slice(request.method.as_str().as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(request.uri.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");

        put_header(&mut out, "Host", request.host().unwrap_or(&peer.name));

        let mut forwarded_for = None;
        for (name, value) in &request.headers {
            let lower = name.to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lower.as_str()) {
                continue;
            }
            if lower == "x-forwarded-for" {
                forwarded_for = Some(value.as_str());
                continue;
            }
            put_header(&mut out, name, value);
        }

        match request.upgrade() {
            Some(protocol) => {
                put_header(&mut out, "Connection", "upgrade");
                put_header(&mut out, "Upgrade", protocol);
            }
            None if !self.keepalive_wanted => put_header(&mut out, "Connection", "close"),
            None => {}
        }

        if let Some(len) = body_len {
            if len > 0 || request.content_length.is_some() {
                put_header(&mut out, "Content-Length", &len.to_string());
            }
        }

        put_header(&mut out, "X-Request-ID", &request.id.to_string());
        if let Some(client) = request.client_addr {
            let value = match forwarded_for {
                Some(prev) => format!("{prev}, {}", client.ip()),
                None => client.ip().to_string(),
            };
            put_header(&mut out, "X-Forwarded-For", &value);
        }

        out.extend_from_slice(b"\r\n");
        Ok(out)
    }

    fn reinit(&mut self) {
        self.body = Body::Pending;
        self.keepalive = false;
    }

    fn process_header(&mut self, input: &mut BytesMut) -> HeaderParse {
        loop {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut response = httparse::Response::new(&mut headers);
                match response.parse(&input[..]) {
                    Ok(httparse::Status::Partial) => return HeaderParse::NeedMore,
                    Ok(httparse::Status::Complete(len)) => {
                        let status = response.code.unwrap_or(0);
                        if (100..200).contains(&status) && status != 101 {
                            (len, None)
                        } else {
                            let mut set = NormalizedHeaderSet::new();
                            for h in response.headers.iter() {
                                set.insert(h.name, &String::from_utf8_lossy(h.value));
                            }
                            let head = ResponseHead {
                                status,
                                reason: response.reason.unwrap_or("").to_string(),
                                version_minor: response.version.unwrap_or(0),
                                headers: set,
                            };
                            (len, Some(head))
                        }
                    }
                    Err(httparse::Error::TooManyHeaders) => {
                        return HeaderParse::Invalid("too many headers".into())
                    }
                    Err(e) => return HeaderParse::Invalid(e.to_string()),
                }
            };

            let (len, head) = parsed;
            input.advance(len);
            let Some(head) = head else {
                tracing::trace!("skipping interim response");
                continue;
            };

            if let Err(reason) = check_framing(&head.headers) {
                return HeaderParse::Invalid(reason);
            }
            return HeaderParse::Complete(head);
        }
    }

    fn filter_init(&mut self, head: &ResponseHead) -> Result<BodyProgress, AdapterError> {
        let connection = head.headers.get("connection").unwrap_or("");
        let close = has_token(connection, "close");
        self.keepalive = if head.version_minor >= 1 {
            !close
        } else {
            has_token(connection, "keep-alive")
        };

        let no_body = self.head_request
            || head.status == 204
            || head.status == 304
            || (100..200).contains(&head.status);
        if head.status == 101 {
            self.keepalive = false;
        }

        self.body = if no_body {
            Body::Done
        } else if head.headers.contains("transfer-encoding") {
            Body::Chunked(ChunkedDecoder::new())
        } else {
            match head.headers.get("content-length").and_then(|v| v.parse::<u64>().ok()) {
                Some(0) => Body::Done,
                Some(n) => Body::Length(n),
                None => {
                    self.keepalive = false;
                    Body::UntilClose
                }
            }
        };

        Ok(match self.body {
            Body::Done => BodyProgress::Done,
            _ => BodyProgress::More,
        })
    }

    fn filter_chunk(
        &mut self,
        input: &mut BytesMut,
        out: &mut BytesMut,
        limit: usize,
    ) -> Result<BodyProgress, AdapterError> {
        match &mut self.body {
            Body::Pending | Body::Done => {
                if !input.is_empty() {
                    tracing::warn!(extra = input.len(), "upstream sent more data than expected");
                    self.keepalive = false;
                    input.clear();
                }
                Ok(BodyProgress::Done)
            }
            Body::Length(remaining) => {
                let n = (*remaining).min(input.len() as u64).min(limit as u64) as usize;
                out.extend_from_slice(&input[..n]);
                input.advance(n);
                *remaining -= n as u64;
                if *remaining > 0 {
                    return Ok(BodyProgress::More);
                }
                self.body = Body::Done;
                if !input.is_empty() {
                    tracing::warn!(
                        extra = input.len(),
                        "upstream sent more data than specified in \"Content-Length\" header"
                    );
                    self.keepalive = false;
                    input.clear();
                }
                Ok(BodyProgress::Done)
            }
            Body::Chunked(decoder) => match decoder.decode(input, out, limit)? {
                Decoded::More => Ok(BodyProgress::More),
                Decoded::Done => {
                    self.body = Body::Done;
                    if !input.is_empty() {
                        self.keepalive = false;
                        input.clear();
                    }
                    Ok(BodyProgress::Done)
                }
            },
            Body::UntilClose => {
                let n = input.len().min(limit);
                out.extend_from_slice(&input[..n]);
                input.advance(n);
                Ok(BodyProgress::More)
            }
        }
    }

    fn filter_eof(&mut self) -> Result<(), AdapterError> {
        match self.body {
            Body::UntilClose | Body::Done => {
                self.body = Body::Done;
                self.keepalive = false;
                Ok(())
            }
            _ => Err(AdapterError::PrematureClose),
        }
    }

    fn keepalive(&self) -> bool {
        self.keepalive && matches!(self.body, Body::Done)
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn check_framing(headers: &NormalizedHeaderSet) -> Result<(), String> {
    if let Some(te) = headers.get("transfer-encoding") {
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if !last.eq_ignore_ascii_case("chunked") {
            return Err(format!("unsupported transfer encoding \"{te}\""));
        }
        if headers.contains("content-length") {
            return Err("both \"Content-Length\" and \"Transfer-Encoding\"".into());
        }
    }
    if let Some(len) = headers.get("content-length") {
        if len.parse::<u64>().is_err() {
            return Err(format!("invalid \"Content-Length\" header \"{len}\""));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::parse_request_head;

    fn request(raw: &str) -> ClientRequest {
        parse_request_head(raw.as_bytes(), 8192).unwrap().unwrap().0
    }

    fn peer() -> PeerPick {
        PeerPick {
            addr: "127.0.0.1:9000".parse().unwrap(),
            name: "backend:9000".into(),
            index: 0,
            backup: false,
        }
    }

    #[test]
    fn strips_hop_by_hop_and_sets_host() {
        let req = request(
            "GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\nTE: trailers\r\nAccept: */*\r\n\r\n",
        );
        let mut adapter = Http1Adapter::new(false);
        let head = adapter.build_request(&req, None, &peer()).unwrap();
        let text = String::from_utf8(head.to_vec()).unwrap();

        assert!(text.starts_with("GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("TE:"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn skips_interim_responses() {
        let mut adapter = Http1Adapter::new(true);
        let mut input = BytesMut::from(
            &b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"[..],
        );
        match adapter.process_header(&mut input) {
            HeaderParse::Complete(head) => {
                assert_eq!(head.status, 200);
                assert_eq!(head.headers.get("content-length"), Some("2"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(&input[..], b"hi");
    }

    #[test]
    fn partial_head_needs_more() {
        let mut adapter = Http1Adapter::new(true);
        let mut input = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Le"[..]);
        assert!(matches!(adapter.process_header(&mut input), HeaderParse::NeedMore));
        assert_eq!(input.len(), 27);
    }

    #[test]
    fn conflicting_framing_is_invalid() {
        let mut adapter = Http1Adapter::new(true);
        let mut input = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nTransfer-Encoding: chunked\r\n\r\n"[..],
        );
        assert!(matches!(adapter.process_header(&mut input), HeaderParse::Invalid(_)));
    }

    #[test]
    fn length_body_and_keepalive() {
        let mut adapter = Http1Adapter::new(true);
        let mut input = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let HeaderParse::Complete(head) = adapter.process_header(&mut input) else {
            panic!("head expected");
        };
        assert_eq!(adapter.filter_init(&head).unwrap(), BodyProgress::More);

        let mut out = BytesMut::new();
        assert_eq!(adapter.filter_chunk(&mut input, &mut out, 3).unwrap(), BodyProgress::More);
        assert_eq!(adapter.filter_chunk(&mut input, &mut out, 3).unwrap(), BodyProgress::Done);
        assert_eq!(&out[..], b"hello");
        assert!(adapter.keepalive());
    }

    #[test]
    fn until_close_body_ends_on_eof() {
        let mut adapter = Http1Adapter::new(true);
        let mut input = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\nabc"[..]);
        let HeaderParse::Complete(head) = adapter.process_header(&mut input) else {
            panic!("head expected");
        };
        adapter.filter_init(&head).unwrap();
        let mut out = BytesMut::new();
        adapter.filter_chunk(&mut input, &mut out, 64).unwrap();
        assert!(adapter.filter_eof().is_ok());
        assert_eq!(&out[..], b"abc");
        assert!(!adapter.keepalive());
    }

    #[test]
    fn premature_close_inside_length_body() {
        let mut adapter = Http1Adapter::new(true);
        let mut input = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]);
        let HeaderParse::Complete(head) = adapter.process_header(&mut input) else {
            panic!("head expected");
        };
        adapter.filter_init(&head).unwrap();
        let mut out = BytesMut::new();
        adapter.filter_chunk(&mut input, &mut out, 64).unwrap();
        assert!(matches!(adapter.filter_eof(), Err(AdapterError::PrematureClose)));
    }
}
