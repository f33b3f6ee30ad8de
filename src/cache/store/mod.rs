//! Persistent Store Adapter
//!
//! Durable key/value primitives with secondary access by logical type and by
//! expiry time. Values are encoded records (see [`super::entry`]); the store
//! never interprets payloads, only the header fields carried in
//! [`RecordSummary`].
//!
//! ```text
//!            ┌────────────────────────────┐
//!  put ─────►│ key → record bytes         │◄──── get / head / delete
//!            ├────────────────────────────┤
//!            │ logical type → {keys}      │◄──── delete_where
//!            ├────────────────────────────┤
//!            │ expires_at → key (ordered) │◄──── scan_expired
//!            └────────────────────────────┘
//! ```

mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::entry::{CacheEntry, RecordSummary};
use super::key::CacheKey;
use crate::error::Result;

/// An encoded record ready to be written
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub summary: RecordSummary,
    pub bytes: Bytes,
}

impl StoredRecord {
    /// Encode an entry
    pub fn from_entry(entry: &CacheEntry) -> Result<Self> {
        let bytes = entry.encode()?;
        Ok(Self {
            summary: entry.summary(bytes.len() as u64),
            bytes,
        })
    }

    /// Pair arbitrary bytes with a summary, bypassing the encoder
    pub fn raw(summary: RecordSummary, bytes: Bytes) -> Self {
        let mut summary = summary;
        summary.record_bytes = bytes.len() as u64;
        Self { summary, bytes }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Used and total capacity of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage: u64,
    /// `None` when the store is unbounded
    pub quota: Option<u64>,
}

impl StorageEstimate {
    /// Bytes still free, or `None` when unbounded
    pub fn available(&self) -> Option<u64> {
        self.quota.map(|q| q.saturating_sub(self.usage))
    }
}

/// Store operation counters
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// Durable store trait
///
/// Writes replace whole records. A reader observes either the previous record
/// or the new one, never a mix.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Insert or replace a record
    async fn put(&self, record: StoredRecord) -> Result<()>;

    /// Fetch the encoded record under `key`
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>>;

    /// Fetch only the header fields of the record under `key`
    async fn head(&self, key: &CacheKey) -> Result<Option<RecordSummary>>;

    /// Remove one record
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every record of a logical type, returning the removed keys
    async fn delete_where(&self, logical_type: &str) -> Result<Vec<CacheKey>>;

    /// Remove every record
    async fn clear(&self) -> Result<usize>;

    /// Records with `expires_at <= now`, soonest-expiring first
    async fn scan_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordSummary>>;

    /// Every record's header fields
    async fn summaries(&self) -> Result<Vec<RecordSummary>>;

    /// Current usage and quota
    async fn estimate(&self) -> Result<StorageEstimate>;

    /// Operation counters
    fn stats(&self) -> StoreStats;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}
