//! In-memory store
//!
//! Process-local backend used by tests and embedders that only need a cache
//! for the lifetime of the process. Supports an optional byte quota and write
//! failure injection so the save path's degradation can be exercised.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{CacheStore, StorageEstimate, StoreStats, StoredRecord};
use crate::cache::entry::RecordSummary;
use crate::cache::key::CacheKey;
use crate::error::{Error, Result};

#[derive(Default)]
struct Tables {
    records: HashMap<CacheKey, StoredRecord>,
    by_type: HashMap<String, BTreeSet<CacheKey>>,
    by_expiry: BTreeSet<(DateTime<Utc>, CacheKey)>,
    usage: u64,
}

impl Tables {
    fn remove(&mut self, key: &CacheKey) -> Option<StoredRecord> {
        let record = self.records.remove(key)?;
        let summary = &record.summary;
        if let Some(keys) = self.by_type.get_mut(&summary.logical_type) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_type.remove(&summary.logical_type);
            }
        }
        self.by_expiry.remove(&(summary.expires_at, key.clone()));
        self.usage = self.usage.saturating_sub(record.len());
        Some(record)
    }

    fn insert(&mut self, record: StoredRecord) {
        let key = record.summary.key.clone();
        self.by_type
            .entry(record.summary.logical_type.clone())
            .or_default()
            .insert(key.clone());
        self.by_expiry.insert((record.summary.expires_at, key.clone()));
        self.usage += record.len();
        self.records.insert(key, record);
    }
}

/// In-memory store; the record table and both indexes share one lock
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    quota: Option<u64>,
    failing_writes: AtomicU32,
    unavailable: AtomicBool,
    disk_full: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            quota: None,
            failing_writes: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            disk_full: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryStore {
    /// Unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects writes pushing usage past `quota` bytes
    pub fn with_quota(quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Fail the next `count` writes with [`Error::StoreUnavailable`]
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make every operation fail with [`Error::StoreUnavailable`] until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes fail like a full disk until reset
    pub fn set_disk_full(&self, full: bool) {
        self.disk_full.store(full, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.tables.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn put(&self, record: StoredRecord) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.take_write_failure() {
            return Err(Error::StoreUnavailable("injected write failure".into()));
        }
        if self.disk_full.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "no space left on device",
            )));
        }

        let mut tables = self.tables.write();
        if let Some(quota) = self.quota {
            let replaced = tables
                .records
                .get(&record.summary.key)
                .map(StoredRecord::len)
                .unwrap_or(0);
            let projected = tables.usage - replaced + record.len();
            if projected > quota {
                return Err(Error::QuotaExceeded(format!(
                    "write of {} bytes would use {} of {} bytes",
                    record.len(),
                    projected,
                    quota
                )));
            }
        }

        tables.remove(&record.summary.key);
        tables.insert(record);
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tables
            .read()
            .records
            .get(key)
            .map(|r| r.bytes.clone()))
    }

    async fn head(&self, key: &CacheKey) -> Result<Option<RecordSummary>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tables
            .read()
            .records
            .get(key)
            .map(|r| r.summary.clone()))
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.check_available()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.tables.write().remove(key).is_some())
    }

    async fn delete_where(&self, logical_type: &str) -> Result<Vec<CacheKey>> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let keys: Vec<CacheKey> = tables
            .by_type
            .get(logical_type)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            tables.remove(key);
        }
        self.deletes.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(keys)
    }

    async fn clear(&self) -> Result<usize> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let removed = tables.records.len();
        *tables = Tables::default();
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    async fn scan_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordSummary>> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .by_expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .filter_map(|(_, key)| tables.records.get(key).map(|r| r.summary.clone()))
            .collect())
    }

    async fn summaries(&self) -> Result<Vec<RecordSummary>> {
        self.check_available()?;
        let tables = self.tables.read();
        let ordered: BTreeMap<&CacheKey, &StoredRecord> = tables.records.iter().collect();
        Ok(ordered.values().map(|r| r.summary.clone()).collect())
    }

    async fn estimate(&self) -> Result<StorageEstimate> {
        self.check_available()?;
        Ok(StorageEstimate {
            usage: self.tables.read().usage,
            quota: self.quota,
        })
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
