//! Inbound and outbound header sets.
//!
//! # Responsibilities
//! - `NormalizedHeaderSet`: backend response headers keyed by lower-cased
//!   name, filled by the protocol adapter while it parses
//! - `OutboundHeaders`: the ordered header list sent to the client
//! - `OutboundHead`: status line plus well-known slots
//!
//! # Design Decisions
//! - Single-valued names are last-wins; a small fixed set of names keep
//!   every occurrence in arrival order
//! - Names keep the case they arrived with for output

use std::collections::HashMap;

use crate::upstream::dispatch::Slot;

/// Names whose repeated occurrences are all kept.
const MULTI_VALUED: &[&str] = &[
    "set-cookie",
    "cache-control",
    "www-authenticate",
    "link",
    "vary",
    "warning",
    "via",
];

pub fn is_multi_valued(lower: &str) -> bool {
    MULTI_VALUED.contains(&lower)
}

/// One header line as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub name: String,
    pub value: String,
}

/// Backend response headers.
#[derive(Debug, Clone, Default)]
pub struct NormalizedHeaderSet {
    order: Vec<String>,
    records: HashMap<String, Vec<HeaderRecord>>,
}

impl NormalizedHeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let lower = name.to_ascii_lowercase();
        let record = HeaderRecord {
            name: name.to_string(),
            value: value.trim().to_string(),
        };
        match self.records.get_mut(&lower) {
            Some(existing) if is_multi_valued(&lower) => existing.push(record),
            Some(existing) => *existing = vec![record],
            None => {
                self.order.push(lower.clone());
                self.records.insert(lower, vec![record]);
            }
        }
    }

    /// Last value for a lower-cased name.
    pub fn get(&self, lower: &str) -> Option<&str> {
        self.records
            .get(lower)
            .and_then(|r| r.last())
            .map(|r| r.value.as_str())
    }

    pub fn get_all(&self, lower: &str) -> &[HeaderRecord] {
        self.records.get(lower).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, lower: &str) -> bool {
        self.records.contains_key(lower)
    }

    /// Names in first-arrival order with their records.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[HeaderRecord])> {
        self.order.iter().filter_map(|name| {
            self.records
                .get(name)
                .map(|records| (name.as_str(), records.as_slice()))
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.records.clear();
    }
}

/// Ordered client-bound header list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundHeaders {
    entries: Vec<(String, String)>,
}

impl OutboundHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an existing entry in place, or append. Returns its index.
    pub fn insert_single(&mut self, name: &str, value: String) -> usize {
        if let Some(pos) = self.position(name) {
            self.entries[pos].1 = value;
            return pos;
        }
        self.entries.push((name.to_string(), value));
        self.entries.len() - 1
    }

    /// Always append. Returns its index.
    pub fn append(&mut self, name: &str, value: String) -> usize {
        self.entries.push((name.to_string(), value));
        self.entries.len() - 1
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn value_mut(&mut self, index: usize) -> Option<&mut String> {
        self.entries.get_mut(index).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Response head as it will be sent to the client.
#[derive(Debug, Clone, Default)]
pub struct OutboundHead {
    pub status: u16,
    pub reason: String,
    /// Body length announced to the client, when known.
    pub content_length: Option<u64>,
    pub headers: OutboundHeaders,
    slots: HashMap<Slot, usize>,
}

impl OutboundHead {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            ..Self::default()
        }
    }

    /// Remember which entry holds a well-known field.
    pub fn bind_slot(&mut self, slot: Slot, index: usize) {
        if slot != Slot::None {
            self.slots.insert(slot, index);
        }
    }

    pub fn slot(&self, slot: Slot) -> Option<&str> {
        let index = *self.slots.get(&slot)?;
        self.headers.entries.get(index).map(|(_, v)| v.as_str())
    }

    pub fn slot_mut(&mut self, slot: Slot) -> Option<&mut String> {
        let index = *self.slots.get(&slot)?;
        self.headers.value_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_valued_names_are_last_wins() {
        let mut set = NormalizedHeaderSet::new();
        set.insert("Content-Type", "text/plain");
        set.insert("X-Id", "1");
        set.insert("content-type", "text/html");

        assert_eq!(set.get("content-type"), Some("text/html"));
        assert_eq!(set.get_all("content-type").len(), 1);
        let names: Vec<_> = set.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["content-type", "x-id"]);
    }

    #[test]
    fn multi_valued_names_keep_order() {
        let mut set = NormalizedHeaderSet::new();
        set.insert("Set-Cookie", "a=1");
        set.insert("Set-Cookie", "b=2");
        let values: Vec<_> = set.get_all("set-cookie").iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn outbound_insert_single_replaces_in_place() {
        let mut out = OutboundHeaders::new();
        out.insert_single("ETag", "\"a\"".into());
        out.append("Set-Cookie", "x=1".into());
        out.insert_single("etag", "\"b\"".into());

        let entries: Vec<_> = out.iter().collect();
        assert_eq!(entries, vec![("ETag", "\"b\""), ("Set-Cookie", "x=1")]);
    }
}
