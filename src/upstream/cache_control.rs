//! Freshness directives of a backend response.

use std::time::{Duration, SystemTime};

/// What a `Cache-Control` value says about storing the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Uncacheable,
    /// No directive that decides either way.
    NoDirective,
    ValidFor(Duration),
}

/// Parse one or more `Cache-Control` values.
///
/// `no-cache`, `no-store` and `private` win over everything. `s-maxage`
/// beats `max-age`; a zero or non-numeric age makes the response
/// uncacheable.
pub fn parse_cache_control<'a, I>(values: I) -> Freshness
where
    I: IntoIterator<Item = &'a str>,
{
    let mut max_age = None;
    let mut s_maxage = None;

    for value in values {
        for directive in value.split(',') {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                None => (directive, None),
            };
            let name = name.to_ascii_lowercase();
            match name.as_str() {
                "no-cache" | "no-store" | "private" => return Freshness::Uncacheable,
                "max-age" => max_age = Some(arg),
                "s-maxage" => s_maxage = Some(arg),
                _ => {}
            }
        }
    }

    match s_maxage.or(max_age) {
        None => Freshness::NoDirective,
        Some(arg) => match arg.and_then(|a| a.parse::<u64>().ok()) {
            Some(secs) if secs > 0 => Freshness::ValidFor(Duration::from_secs(secs)),
            _ => Freshness::Uncacheable,
        },
    }
}

/// Parsed `X-Accel-Expires`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelExpires {
    Off,
    ValidFor(Duration),
    Until(SystemTime),
}

/// `"0"` disables caching, `"N"` is seconds, `"@N"` an absolute epoch.
pub fn parse_accel_expires(value: &str) -> Option<AccelExpires> {
    let value = value.trim();
    if let Some(epoch) = value.strip_prefix('@') {
        let secs = epoch.parse::<u64>().ok()?;
        return Some(AccelExpires::Until(
            SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        ));
    }
    match value.parse::<u64>().ok()? {
        0 => Some(AccelExpires::Off),
        secs => Some(AccelExpires::ValidFor(Duration::from_secs(secs))),
    }
}

/// Time left until `until`, or `None` when it already passed.
pub fn remaining(until: SystemTime, now: SystemTime) -> Option<Duration> {
    until.duration_since(now).ok().filter(|d| !d.is_zero())
}
