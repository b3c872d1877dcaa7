//! In-memory cache on a concurrent map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;

use super::{Cache, CacheError, CachedResponse, Lookup, WriteHandle};

#[derive(Debug, Default)]
struct Entry {
    response: Option<Arc<CachedResponse>>,
    writer: Option<u64>,
}

/// Bounded map of cached responses.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    max_entries: usize,
    next_token: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries first, then arbitrary ones, until there is
    /// room for one more. Entries being written are kept.
    fn make_room(&self, keep: &str) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let now = SystemTime::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.writer.is_none() && e.key() != keep)
            .filter(|e| e.response.as_ref().map_or(true, |r| !r.is_fresh(now)))
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
        }

        while self.entries.len() >= self.max_entries {
            let victim = self
                .entries
                .iter()
                .find(|e| e.writer.is_none() && e.key() != keep)
                .map(|e| e.key().clone());
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Cache for MemoryCache {
    fn lookup(&self, key: &str) -> Lookup {
        let Some(entry) = self.entries.get(key) else {
            return Lookup::Miss;
        };
        match &entry.response {
            None => Lookup::Miss,
            Some(response) if response.is_fresh(SystemTime::now()) => Lookup::Hit(response.clone()),
            Some(response) if entry.writer.is_some() => Lookup::Updating(response.clone()),
            Some(response) => Lookup::Stale(response.clone()),
        }
    }

    fn begin_write(&self, key: &str) -> Option<WriteHandle> {
        if !self.entries.contains_key(key) {
            self.make_room(key);
        }
        let mut entry = self.entries.entry(key.to_string()).or_default();
        if entry.writer.is_some() {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entry.writer = Some(token);
        Some(WriteHandle::new(key.to_string(), token))
    }

    fn commit(&self, handle: WriteHandle, response: CachedResponse) -> Result<(), CacheError> {
        let mut entry = self
            .entries
            .get_mut(&handle.key)
            .ok_or_else(|| CacheError::LostOwnership(handle.key.clone()))?;
        if entry.writer != Some(handle.token()) {
            return Err(CacheError::LostOwnership(handle.key.clone()));
        }
        entry.writer = None;
        entry.response = Some(Arc::new(response));
        Ok(())
    }

    fn abandon(&self, handle: WriteHandle) {
        let remove = match self.entries.get_mut(&handle.key) {
            Some(mut entry) if entry.writer == Some(handle.token()) => {
                entry.writer = None;
                entry.response.is_none()
            }
            _ => false,
        };
        if remove {
            self.entries
                .remove_if(&handle.key, |_, e| e.writer.is_none() && e.response.is_none());
        }
    }
}
