//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use crate::http::request::ClientRequest;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &ClientRequest) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &ClientRequest) -> bool {
        req.host_name()
            .map(|h| h == self.expected_host)
            .unwrap_or(false)
    }
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, req: &ClientRequest) -> bool {
        req.path().starts_with(&self.prefix)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &ClientRequest) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::parse_request_head;

    fn request(raw: &str) -> ClientRequest {
        parse_request_head(raw.as_bytes(), 8192).unwrap().unwrap().0
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(&request("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")));
        assert!(matcher.matches(&request("GET / HTTP/1.1\r\nHost: EXAMPLE.COM:8080\r\n\r\n")));
        assert!(!matcher.matches(&request("GET / HTTP/1.1\r\nHost: other.com\r\n\r\n")));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api");
        assert!(matcher.matches(&request("GET /api/v1?x=1 HTTP/1.1\r\nHost: a\r\n\r\n")));
        assert!(!matcher.matches(&request("GET /images HTTP/1.1\r\nHost: a\r\n\r\n")));
    }

    #[test]
    fn empty_and_matches_everything() {
        let matcher = AndMatcher::new(vec![]);
        assert!(matcher.matches(&request("GET / HTTP/1.1\r\n\r\n")));
    }
}
