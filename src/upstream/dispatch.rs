//! Response header dispatch table.
//!
//! # Data Flow
//! ```text
//! NormalizedHeaderSet (backend)
//!     → for each name, in arrival order:
//!         inbound handler  (fills ResponseMeta, unless ignored)
//!         outbound handler (copy / rewrite / suppress into OutboundHead,
//!                           unless hidden)
//!     → ResponseMeta + OutboundHead
//! ```
//!
//! # Design Decisions
//! - One static table keyed by lower-cased name; each entry carries two
//!   plain function pointers and the slot its outbound value is bound to
//! - Names not in the table are copied verbatim unless hidden
//! - The hide list has the pass list subtracted once, when the policy is
//!   built
//! - `ignore_headers` disables the inbound handler only; whether the
//!   header reaches the client is still decided by the hide list

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use crate::config::{ProxySettings, RewriteRule};
use crate::upstream::cache_control::{
    parse_accel_expires, parse_cache_control, remaining, AccelExpires, Freshness,
};
use crate::upstream::headers::{HeaderRecord, NormalizedHeaderSet, OutboundHead};

/// Well-known outbound fields a later stage may want to find again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    None,
    ContentType,
    Date,
    LastModified,
    ETag,
    Server,
    WwwAuthenticate,
    Location,
    Refresh,
    ContentDisposition,
    CacheControl,
    Expires,
    AcceptRanges,
    ContentRange,
    ContentEncoding,
    Link,
}

/// Hidden from clients unless listed in `pass_headers`.
const DEFAULT_HIDE: &[&str] = &[
    "date",
    "server",
    "x-pad",
    "x-accel-expires",
    "x-accel-redirect",
    "x-accel-limit-rate",
    "x-accel-buffering",
    "x-accel-charset",
];

/// Names accepted by `ignore_headers`.
pub const IGNORABLE: &[&str] = &[
    "x-accel-redirect",
    "x-accel-expires",
    "x-accel-limit-rate",
    "x-accel-buffering",
    "x-accel-charset",
    "expires",
    "cache-control",
    "set-cookie",
    "vary",
];

/// Facts learned from backend headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
    pub cache_control: Option<Freshness>,
    pub expires: Option<SystemTime>,
    pub accel_expires: Option<AccelExpires>,
    /// `Set-Cookie` or `Vary: *` seen.
    pub private: bool,
    pub accel_redirect: Option<String>,
    pub accel_buffering: Option<bool>,
    /// Client send rate in bytes per second.
    pub accel_limit_rate: Option<u64>,
    pub accel_charset: Option<String>,
}

impl ResponseMeta {
    /// How long the response may be cached. `status_default` comes from
    /// the per-status validity table and is only used when no header set
    /// a validity. `None` means do not cache.
    pub fn validity(&self, now: SystemTime, status_default: Option<Duration>) -> Option<Duration> {
        match self.accel_expires {
            Some(AccelExpires::Off) => return None,
            Some(AccelExpires::ValidFor(d)) => return Some(d),
            Some(AccelExpires::Until(t)) => return remaining(t, now),
            None => {}
        }
        if self.private {
            return None;
        }
        match self.cache_control {
            Some(Freshness::Uncacheable) => return None,
            Some(Freshness::ValidFor(d)) => return Some(d),
            Some(Freshness::NoDirective) | None => {}
        }
        if let Some(t) = self.expires {
            return remaining(t, now);
        }
        status_default
    }
}

/// Header handling rules of one route.
#[derive(Debug, Clone, Default)]
pub struct HeaderPolicy {
    hide: HashSet<String>,
    ignore: HashSet<String>,
    redirect: Vec<RewriteRule>,
    cookie_domain: Vec<RewriteRule>,
    cookie_path: Vec<RewriteRule>,
}

impl HeaderPolicy {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        let pass: HashSet<String> = settings
            .pass_headers
            .iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();
        let hide = DEFAULT_HIDE
            .iter()
            .map(|n| n.to_string())
            .chain(settings.hide_headers.iter().map(|n| n.to_ascii_lowercase()))
            .filter(|n| !pass.contains(n))
            .collect();
        let ignore = settings
            .ignore_headers
            .iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();

        Self {
            hide,
            ignore,
            redirect: settings.redirect.clone(),
            cookie_domain: settings.cookie_domain.clone(),
            cookie_path: settings.cookie_path.clone(),
        }
    }

    pub fn is_hidden(&self, lower: &str) -> bool {
        self.hide.contains(lower)
    }

    pub fn is_ignored(&self, lower: &str) -> bool {
        self.ignore.contains(lower)
    }
}

type InboundFn = fn(&mut ResponseMeta, &[HeaderRecord]);
type OutboundFn = fn(&mut OutboundHead, &[HeaderRecord], &HeaderPolicy) -> Option<usize>;

/// One table entry.
pub struct HeaderRule {
    pub name: &'static str,
    pub inbound: Option<InboundFn>,
    pub slot: Slot,
    pub outbound: OutboundFn,
    pub affects_cache: bool,
}

impl std::fmt::Debug for HeaderRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderRule")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("affects_cache", &self.affects_cache)
            .finish()
    }
}

const fn rule(
    name: &'static str,
    inbound: Option<InboundFn>,
    slot: Slot,
    outbound: OutboundFn,
    affects_cache: bool,
) -> HeaderRule {
    HeaderRule {
        name,
        inbound,
        slot,
        outbound,
        affects_cache,
    }
}

static RULES: &[HeaderRule] = &[
    rule("content-type", None, Slot::ContentType, copy, false),
    rule("content-length", Some(content_length_in), Slot::None, content_length_out, false),
    rule("date", None, Slot::Date, copy, false),
    rule("last-modified", None, Slot::LastModified, copy, false),
    rule("etag", None, Slot::ETag, copy, false),
    rule("server", None, Slot::Server, copy, false),
    rule("www-authenticate", None, Slot::WwwAuthenticate, copy, false),
    rule("location", None, Slot::Location, location_out, false),
    rule("refresh", None, Slot::Refresh, refresh_out, false),
    rule("set-cookie", Some(set_cookie_in), Slot::None, set_cookie_out, true),
    rule("content-disposition", None, Slot::ContentDisposition, copy, false),
    rule("cache-control", Some(cache_control_in), Slot::CacheControl, copy, true),
    rule("expires", Some(expires_in), Slot::Expires, copy, true),
    rule("accept-ranges", None, Slot::AcceptRanges, copy, false),
    rule("content-range", None, Slot::ContentRange, copy, false),
    rule("content-encoding", None, Slot::ContentEncoding, copy, false),
    rule("link", None, Slot::Link, copy, false),
    rule("vary", Some(vary_in), Slot::None, copy, true),
    rule("connection", Some(connection_in), Slot::None, suppress, false),
    rule("keep-alive", None, Slot::None, suppress, false),
    rule("transfer-encoding", Some(transfer_encoding_in), Slot::None, suppress, false),
    rule("x-accel-expires", Some(accel_expires_in), Slot::None, copy, true),
    rule("x-accel-redirect", Some(accel_redirect_in), Slot::None, copy, false),
    rule("x-accel-limit-rate", Some(accel_limit_rate_in), Slot::None, copy, false),
    rule("x-accel-buffering", Some(accel_buffering_in), Slot::None, copy, false),
    rule("x-accel-charset", Some(accel_charset_in), Slot::None, copy, false),
];

fn table() -> &'static HashMap<&'static str, &'static HeaderRule> {
    static TABLE: OnceLock<HashMap<&'static str, &'static HeaderRule>> = OnceLock::new();
    TABLE.get_or_init(|| RULES.iter().map(|r| (r.name, r)).collect())
}

pub fn lookup(lower: &str) -> Option<&'static HeaderRule> {
    table().get(lower).copied()
}

/// Run every backend header through the table.
///
/// Inbound handlers of cache-related rules only run when the response
/// may be cached.
pub fn dispatch(
    headers: &NormalizedHeaderSet,
    policy: &HeaderPolicy,
    status: u16,
    reason: &str,
    cache_active: bool,
) -> (OutboundHead, ResponseMeta) {
    let mut head = OutboundHead::new(status, reason);
    let mut meta = ResponseMeta::default();

    for (name, records) in headers.iter() {
        let rule = lookup(name);

        if let Some(rule) = rule {
            if let Some(inbound) = rule.inbound {
                let skip = policy.is_ignored(name) || (rule.affects_cache && !cache_active);
                if !skip {
                    inbound(&mut meta, records);
                }
            }
        }

        if policy.is_hidden(name) {
            continue;
        }

        match rule {
            Some(rule) => {
                if let Some(index) = (rule.outbound)(&mut head, records, policy) {
                    head.bind_slot(rule.slot, index);
                }
            }
            None => {
                copy(&mut head, records, policy);
            }
        }
    }

    if let Some(charset) = &meta.accel_charset {
        if let Some(content_type) = head.slot_mut(Slot::ContentType) {
            let lower = content_type.to_ascii_lowercase();
            if lower.starts_with("text/") && !lower.contains("charset=") {
                content_type.push_str("; charset=");
                content_type.push_str(charset);
            }
        }
    }

    (head, meta)
}

fn last(records: &[HeaderRecord]) -> Option<&str> {
    records.last().map(|r| r.value.as_str())
}

fn content_length_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.content_length = last(records).and_then(|v| v.parse().ok());
}

fn connection_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.connection_close = records.iter().any(|r| {
        r.value
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("close"))
    });
}

fn transfer_encoding_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.chunked = last(records)
        .and_then(|v| v.rsplit(',').next())
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
}

fn cache_control_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.cache_control = Some(parse_cache_control(records.iter().map(|r| r.value.as_str())));
}

fn expires_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    // An unparseable date is treated as already expired.
    meta.expires = last(records).map(|v| httpdate::parse_http_date(v).unwrap_or(SystemTime::UNIX_EPOCH));
}

fn set_cookie_in(meta: &mut ResponseMeta, _records: &[HeaderRecord]) {
    meta.private = true;
}

fn vary_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    if records
        .iter()
        .any(|r| r.value.split(',').any(|t| t.trim() == "*"))
    {
        meta.private = true;
    }
}

fn accel_expires_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.accel_expires = last(records).and_then(parse_accel_expires);
}

fn accel_redirect_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.accel_redirect = last(records).filter(|v| !v.is_empty()).map(str::to_string);
}

fn accel_limit_rate_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.accel_limit_rate = match last(records) {
        Some(v) if v.eq_ignore_ascii_case("off") => None,
        Some(v) => v.parse().ok(),
        None => None,
    };
}

fn accel_buffering_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.accel_buffering = match last(records) {
        Some(v) if v.eq_ignore_ascii_case("yes") => Some(true),
        Some(v) if v.eq_ignore_ascii_case("no") => Some(false),
        _ => None,
    };
}

fn accel_charset_in(meta: &mut ResponseMeta, records: &[HeaderRecord]) {
    meta.accel_charset = last(records)
        .filter(|v| !v.eq_ignore_ascii_case("off"))
        .map(str::to_string);
}

fn copy(head: &mut OutboundHead, records: &[HeaderRecord], _policy: &HeaderPolicy) -> Option<usize> {
    let mut index = None;
    for record in records {
        index = Some(head.headers.append(&record.name, record.value.clone()));
    }
    index
}

fn suppress(_head: &mut OutboundHead, _records: &[HeaderRecord], _policy: &HeaderPolicy) -> Option<usize> {
    None
}

fn content_length_out(
    head: &mut OutboundHead,
    records: &[HeaderRecord],
    _policy: &HeaderPolicy,
) -> Option<usize> {
    head.content_length = last(records).and_then(|v| v.parse().ok());
    None
}

fn location_out(head: &mut OutboundHead, records: &[HeaderRecord], policy: &HeaderPolicy) -> Option<usize> {
    let record = records.last()?;
    let value = rewrite_prefix(&record.value, &policy.redirect).unwrap_or_else(|| record.value.clone());
    Some(head.headers.append(&record.name, value))
}

fn refresh_out(head: &mut OutboundHead, records: &[HeaderRecord], policy: &HeaderPolicy) -> Option<usize> {
    let record = records.last()?;
    let value = rewrite_refresh(&record.value, &policy.redirect).unwrap_or_else(|| record.value.clone());
    Some(head.headers.append(&record.name, value))
}

fn set_cookie_out(head: &mut OutboundHead, records: &[HeaderRecord], policy: &HeaderPolicy) -> Option<usize> {
    let mut index = None;
    for record in records {
        let value = rewrite_cookie(&record.value, &policy.cookie_domain, &policy.cookie_path);
        index = Some(head.headers.append(&record.name, value));
    }
    index
}

/// First rule whose `from` prefixes `value`.
pub fn rewrite_prefix(value: &str, rules: &[RewriteRule]) -> Option<String> {
    rules.iter().find_map(|rule| {
        value
            .strip_prefix(rule.from.as_str())
            .map(|rest| format!("{}{}", rule.to, rest))
    })
}

fn rewrite_refresh(value: &str, rules: &[RewriteRule]) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let at = lower.find("url=")? + "url=".len();
    let rewritten = rewrite_prefix(&value[at..], rules)?;
    Some(format!("{}{}", &value[..at], rewritten))
}

/// Rewrite the `domain=` (exact, case-insensitive) and `path=` (prefix)
/// attributes of a `Set-Cookie` value.
pub fn rewrite_cookie(value: &str, domains: &[RewriteRule], paths: &[RewriteRule]) -> String {
    if domains.is_empty() && paths.is_empty() {
        return value.to_string();
    }
    value
        .split(';')
        .map(|part| {
            let trimmed = part.trim_start();
            let lead = &part[..part.len() - trimmed.len()];
            let Some((attr, arg)) = trimmed.split_once('=') else {
                return part.to_string();
            };
            if attr.eq_ignore_ascii_case("domain") {
                let bare = arg.trim_start_matches('.');
                if let Some(rule) = domains
                    .iter()
                    .find(|r| r.from.trim_start_matches('.').eq_ignore_ascii_case(bare))
                {
                    return format!("{lead}{attr}={}", rule.to);
                }
            } else if attr.eq_ignore_ascii_case("path") {
                if let Some(path) = rewrite_prefix(arg, paths) {
                    return format!("{lead}{attr}={path}");
                }
            }
            part.to_string()
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(configure: impl FnOnce(&mut ProxySettings)) -> HeaderPolicy {
        let mut settings = ProxySettings::default();
        configure(&mut settings);
        HeaderPolicy::from_settings(&settings)
    }

    fn headers(pairs: &[(&str, &str)]) -> NormalizedHeaderSet {
        let mut set = NormalizedHeaderSet::new();
        for (n, v) in pairs {
            set.insert(n, v);
        }
        set
    }

    #[test]
    fn unknown_headers_pass_and_hop_by_hop_are_dropped() {
        let set = headers(&[
            ("X-Custom", "1"),
            ("Connection", "close"),
            ("Transfer-Encoding", "chunked"),
            ("Content-Length", "5"),
        ]);
        let (head, meta) = dispatch(&set, &policy(|_| {}), 200, "OK", false);

        let names: Vec<_> = head.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Custom"]);
        assert_eq!(head.content_length, Some(5));
        assert!(meta.connection_close);
        assert!(meta.chunked);
    }

    #[test]
    fn chunked_is_read_from_last_coding() {
        let (_, meta) = dispatch(
            &headers(&[("Transfer-Encoding", "gzip, chunked")]),
            &policy(|_| {}),
            200,
            "OK",
            false,
        );
        assert!(meta.chunked);

        let (_, meta) = dispatch(
            &headers(&[("Transfer-Encoding", "chunked, gzip")]),
            &policy(|_| {}),
            200,
            "OK",
            false,
        );
        assert!(!meta.chunked);
    }

    #[test]
    fn pass_list_beats_hide_list() {
        let p = policy(|s| {
            s.hide_headers = vec!["X-Internal".into(), "X-Debug".into()];
            s.pass_headers = vec!["x-debug".into(), "Server".into()];
        });
        assert!(p.is_hidden("x-internal"));
        assert!(!p.is_hidden("x-debug"));
        assert!(!p.is_hidden("server"));
        assert!(p.is_hidden("date"));
    }

    #[test]
    fn accel_headers_are_read_then_hidden() {
        let set = headers(&[
            ("X-Accel-Redirect", "/protected/file"),
            ("X-Accel-Buffering", "no"),
            ("X-Accel-Limit-Rate", "1024"),
        ]);
        let (head, meta) = dispatch(&set, &policy(|_| {}), 200, "OK", false);
        assert!(head.headers.is_empty());
        assert_eq!(meta.accel_redirect.as_deref(), Some("/protected/file"));
        assert_eq!(meta.accel_buffering, Some(false));
        assert_eq!(meta.accel_limit_rate, Some(1024));
    }

    #[test]
    fn ignored_header_is_not_interpreted() {
        let set = headers(&[("X-Accel-Redirect", "/x")]);
        let p = policy(|s| s.ignore_headers = vec!["X-Accel-Redirect".into()]);
        let (_, meta) = dispatch(&set, &p, 200, "OK", false);
        assert_eq!(meta.accel_redirect, None);
    }

    #[test]
    fn location_and_refresh_rewrite() {
        let p = policy(|s| {
            s.redirect = vec![RewriteRule {
                from: "http://backend:8000/".into(),
                to: "/app/".into(),
            }]
        });
        let set = headers(&[
            ("Location", "http://backend:8000/login"),
            ("Refresh", "5; url=http://backend:8000/next"),
        ]);
        let (head, _) = dispatch(&set, &p, 302, "Found", false);
        assert_eq!(head.slot(Slot::Location), Some("/app/login"));
        assert_eq!(head.slot(Slot::Refresh), Some("5; url=/app/next"));
    }

    #[test]
    fn cookie_domain_and_path_rewrite() {
        let domains = vec![RewriteRule {
            from: "backend.local".into(),
            to: "example.com".into(),
        }];
        let paths = vec![RewriteRule {
            from: "/api/".into(),
            to: "/".into(),
        }];
        let out = rewrite_cookie("sid=1; Domain=.Backend.local; Path=/api/v1; HttpOnly", &domains, &paths);
        assert_eq!(out, "sid=1; Domain=example.com; Path=/v1; HttpOnly");
    }

    #[test]
    fn multi_valued_cookies_keep_order() {
        let set = headers(&[("Set-Cookie", "a=1"), ("X-A", "1"), ("Set-Cookie", "b=2")]);
        let (head, _) = dispatch(&set, &policy(|_| {}), 200, "OK", true);
        let cookies: Vec<_> = head.headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn charset_appended_to_text_types() {
        let set = headers(&[("Content-Type", "text/html"), ("X-Accel-Charset", "utf-8")]);
        let (head, _) = dispatch(&set, &policy(|_| {}), 200, "OK", false);
        assert_eq!(head.slot(Slot::ContentType), Some("text/html; charset=utf-8"));
    }

    #[test]
    fn validity_precedence() {
        let now = SystemTime::now();
        let table = Some(Duration::from_secs(5));

        let set = headers(&[("Cache-Control", "max-age=100"), ("X-Accel-Expires", "7")]);
        let (_, meta) = dispatch(&set, &policy(|_| {}), 200, "OK", true);
        assert_eq!(meta.validity(now, table), Some(Duration::from_secs(7)));

        let set = headers(&[("Cache-Control", "max-age=100"), ("Set-Cookie", "a=1")]);
        let (_, meta) = dispatch(&set, &policy(|_| {}), 200, "OK", true);
        assert_eq!(meta.validity(now, table), None);

        let p = policy(|s| s.ignore_headers = vec!["set-cookie".into()]);
        let (_, meta) = dispatch(&set, &p, 200, "OK", true);
        assert_eq!(meta.validity(now, table), Some(Duration::from_secs(100)));

        let set = headers(&[("Expires", "Thu, 01 Jan 1970 00:00:00 GMT")]);
        let (_, meta) = dispatch(&set, &policy(|_| {}), 200, "OK", true);
        assert_eq!(meta.validity(now, table), None);

        let (_, meta) = dispatch(&headers(&[]), &policy(|_| {}), 200, "OK", true);
        assert_eq!(meta.validity(now, table), table);
    }

    #[test]
    fn cache_rules_skipped_when_not_caching() {
        let set = headers(&[("Cache-Control", "no-store")]);
        let (head, meta) = dispatch(&set, &policy(|_| {}), 200, "OK", false);
        assert_eq!(meta.cache_control, None);
        assert_eq!(head.slot(Slot::CacheControl), Some("no-store"));
    }
}
