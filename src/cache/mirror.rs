//! In-memory mirror
//!
//! A small process-local copy of recently loaded payloads so repeated loads
//! of the same corpus skip decoding and decompression. A mirrored copy is
//! only served after the durable header still shows the same `cachedAt` and
//! version; sibling broadcasts drop copies eagerly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::entry::RecordSummary;
use super::key::CacheKey;

/// One mirrored payload
#[derive(Debug, Clone)]
pub struct MirrorEntry {
    pub value: Arc<Value>,
    pub version: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MirrorEntry {
    /// Whether the durable record is the one this copy was taken from
    pub fn matches(&self, durable: &RecordSummary) -> bool {
        self.version == durable.version && self.cached_at == durable.cached_at
    }
}

#[derive(Default)]
struct MirrorInner {
    entries: HashMap<CacheKey, MirrorEntry>,
    // Least recently used at the front
    order: VecDeque<CacheKey>,
}

impl MirrorInner {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.entries.remove(key).is_some()
    }
}

/// Bounded LRU of recently loaded payloads
pub struct Mirror {
    capacity: usize,
    inner: Mutex<MirrorInner>,
}

impl Mirror {
    /// Mirror holding at most `capacity` payloads; zero disables it
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(MirrorInner::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Look up `key`, marking it recently used
    pub fn get(&self, key: &CacheKey) -> Option<MirrorEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(key).cloned()?;
        inner.touch(key);
        Some(entry)
    }

    /// Insert or replace, evicting the least recently used copy if full
    pub fn insert(&self, key: CacheKey, entry: MirrorEntry) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.touch(&key);
        inner.entries.insert(key, entry);
        while inner.entries.len() > self.capacity {
            let Some(lru) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&lru);
        }
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.lock().remove(key)
    }

    /// Drop every copy whose key belongs to `keys`
    pub fn invalidate_all<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.remove(key);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
