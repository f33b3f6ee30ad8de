//! Corpus Cache - public facade
//!
//! Wires the key codec, lock manager, quota manager, compression worker,
//! integrity validator, store, broadcaster and metrics into the six public
//! operations.
//!
//! ```text
//! load ──► derive_key ──► lock ──► mirror? ──► store.get ──► decode
//!                                                  │            │
//!                                                miss      validate ──► decompress ──► hit
//!
//! save ──► size check ──► lock ──► compress ──► quota ──► retry(store.put) ──► publish
//! ```
//!
//! Every failure degrades: loads report a miss, saves leave the value
//! uncached. Only a lock timeout or an unreachable store surfaces from `load`,
//! so callers can tell "try later" apart from "not cached".

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::broadcast::{
    BroadcastAction, BroadcastHub, BroadcastMessage, Broadcaster, Subscription, ALL_KEYS,
};
use super::compression::{CompressionAlgorithm, Compressor};
use super::entry::{CacheEntry, EntryMetadata, RecordSummary};
use super::integrity::{IntegrityValidator, PayloadSchema};
use super::key::{derive_key, derive_version, CacheKey, FilterDescriptor};
use super::lock::LockManager;
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::mirror::{Mirror, MirrorEntry};
use super::quota::{QuotaManager, ReclaimReport};
use super::retry::{RetryExecutor, RetryPolicy};
use super::store::{CacheStore, InMemoryStore, StoredRecord};
use super::worker::CompressionWorker;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Aggregate view of the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Bytes charged against quota, headers included
    pub total_size: u64,
    pub entry_count: usize,
    /// Stored payload bytes over original bytes; 1.0 when empty
    pub compression_ratio: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

impl CacheStats {
    fn from_summaries(summaries: &[RecordSummary]) -> Self {
        let stored: u64 = summaries.iter().map(|s| s.size_bytes).sum();
        let original: u64 = summaries.iter().map(|s| s.original_size_bytes).sum();
        Self {
            total_size: summaries.iter().map(|s| s.record_bytes).sum(),
            entry_count: summaries.len(),
            compression_ratio: if original == 0 {
                1.0
            } else {
                stored as f64 / original as f64
            },
            oldest_entry: summaries.iter().map(|s| s.cached_at).min(),
            newest_entry: summaries.iter().map(|s| s.cached_at).max(),
        }
    }
}

/// Builder for [`CorpusCache`]
pub struct CorpusCacheBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn CacheStore>>,
    hub: Option<BroadcastHub>,
    clock: Option<Arc<dyn Clock>>,
    schema: PayloadSchema,
    algorithm: CompressionAlgorithm,
    compressor: Option<Box<dyn Compressor>>,
    retry_policy: Option<RetryPolicy>,
}

impl Default for CorpusCacheBuilder {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            store: None,
            hub: None,
            clock: None,
            schema: PayloadSchema::corpus(),
            algorithm: CompressionAlgorithm::default(),
            compressor: None,
            retry_policy: None,
        }
    }
}

impl CorpusCacheBuilder {
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable store; defaults to a fresh [`InMemoryStore`]
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Hub shared with sibling caches; defaults to a private hub
    pub fn with_hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shape every loaded payload must have
    pub fn with_schema(mut self, schema: PayloadSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Run a specific codec on the worker instead of the algorithm's default
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Override the retry policy derived from the config
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Start the worker and wire everything together
    ///
    /// Must be called within a Tokio runtime when the mirror is enabled.
    pub fn build(self) -> Result<CorpusCache> {
        self.config.validate()?;
        let config = self.config;

        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryStore::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let hub = self.hub.unwrap_or_default();
        let locks = LockManager::new(config.lock_timeout);
        let quota = QuotaManager::new(
            store.clone(),
            locks.clone(),
            config.max_entry_bytes,
            config.quota_safety_factor,
        );
        let worker = match self.compressor {
            Some(compressor) => {
                CompressionWorker::with_compressor(compressor, config.compression_timeout)?
            }
            None => CompressionWorker::spawn(self.algorithm, config.compression_timeout)?,
        };
        let retry = RetryExecutor::new(
            self.retry_policy
                .unwrap_or_else(|| RetryPolicy::from_config(&config.retry)),
        );
        let broadcaster = Broadcaster::new(&hub, config.channel_name.clone());
        let mirror = Arc::new(Mirror::new(config.mirror_capacity));
        let metrics = Arc::new(CacheMetrics::new());

        let mirror_subscription = if mirror.is_enabled() {
            let mirror = mirror.clone();
            let metrics = metrics.clone();
            Some(broadcaster.subscribe(move |message: BroadcastMessage| {
                metrics.record_remote_invalidation();
                match message.action {
                    BroadcastAction::Cleared => mirror.clear(),
                    BroadcastAction::Saved | BroadcastAction::Deleted => {
                        mirror.invalidate(&CacheKey::from_raw(message.cache_key));
                    }
                }
            })?)
        } else {
            None
        };

        info!(
            store = store.name(),
            channel = %config.channel_name,
            compression = %worker.algorithm(),
            "Corpus cache ready"
        );

        Ok(CorpusCache {
            config,
            store,
            locks,
            quota,
            worker,
            validator: IntegrityValidator::new(self.schema),
            retry,
            broadcaster,
            mirror,
            metrics,
            clock,
            mirror_subscription: Mutex::new(mirror_subscription),
        })
    }
}

/// Durable, compressed, quota-aware cache of parsed corpora
pub struct CorpusCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    locks: LockManager,
    quota: QuotaManager,
    worker: CompressionWorker,
    validator: IntegrityValidator,
    retry: RetryExecutor,
    broadcaster: Broadcaster,
    mirror: Arc<Mirror>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
    mirror_subscription: Mutex<Option<Subscription>>,
}

impl CorpusCache {
    pub fn builder() -> CorpusCacheBuilder {
        CorpusCacheBuilder::default()
    }

    /// Cache over a fresh in-memory store
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        Self::builder().with_config(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Storage key for a logical type and filter
    pub fn key_for(&self, logical_type: &str, filter: Option<&FilterDescriptor>) -> CacheKey {
        derive_key(logical_type, filter)
    }

    fn ttl_for(&self, filter: Option<&FilterDescriptor>) -> std::time::Duration {
        if filter.map_or(false, FilterDescriptor::is_effective) {
            self.config.filtered_ttl
        } else {
            self.config.full_ttl
        }
    }

    // =========================================================================
    // Save Path
    // =========================================================================

    /// Serialize, compress if large, and persist `payload`
    ///
    /// Failures are logged and counted before being returned; none of them
    /// leave a partial record behind.
    pub async fn save<T>(
        &self,
        logical_type: &str,
        payload: &T,
        filter: Option<&FilterDescriptor>,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = derive_key(logical_type, filter);
        let result = self.save_entry(&key, logical_type, payload, filter).await;
        match &result {
            Ok(()) => {
                self.metrics.record_save();
                self.broadcaster.publish(key.as_str(), BroadcastAction::Saved);
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(key = %key, logical_type, error = %e, "Save failed, value left uncached");
            }
        }
        result
    }

    async fn save_entry<T>(
        &self,
        key: &CacheKey,
        logical_type: &str,
        payload: &T,
        filter: Option<&FilterDescriptor>,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload)?;
        let raw = serde_json::to_vec(&value)?;
        let original_size = raw.len() as u64;
        self.quota.check_entry_size(original_size)?;
        let version = derive_version(&value);
        drop(value);

        let _guard = self.locks.acquire(key.as_str()).await?;

        let compress = self.worker.algorithm() != CompressionAlgorithm::None
            && original_size >= self.config.compression_threshold_bytes;
        let (stored, is_compressed) = if compress {
            let tracker = LatencyTracker::start();
            let compressed = self.worker.compress(Bytes::from(raw)).await?;
            self.metrics.record_compression(tracker.elapsed());
            (compressed, true)
        } else {
            (Bytes::from(raw), false)
        };

        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.ttl_for(filter))
            .map_err(|e| Error::Config(format!("TTL out of range: {}", e)))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::Config(format!("expiry of {} past {} is out of range", ttl, now)))?;
        let size_bytes = stored.len() as u64;
        let entry = CacheEntry {
            key: key.clone(),
            version,
            payload: stored,
            is_compressed,
            metadata: EntryMetadata {
                logical_type: logical_type.to_string(),
                filter_descriptor: filter.and_then(FilterDescriptor::normalized),
                cached_at: now,
                expires_at,
                size_bytes,
                original_size_bytes: original_size,
                compression_ratio: if original_size == 0 {
                    1.0
                } else {
                    size_bytes as f64 / original_size as f64
                },
            },
        };
        let record = StoredRecord::from_entry(&entry)?;

        let report = self.quota.ensure_capacity(record.len(), key, now).await?;
        self.after_reclaim(&report);

        let written = self
            .retry
            .execute(|| self.store.put(record.clone()))
            .await;
        if let Err(e) = written {
            if e.is_quota_exceeded() {
                // Free space for whoever writes next; this write stays failed
                let report = self.quota.reclaim(record.len(), key, now).await?;
                self.after_reclaim(&report);
            }
            return Err(e);
        }

        self.mirror.invalidate(key);
        debug!(
            key = %key,
            size = size_bytes,
            original = original_size,
            compressed = is_compressed,
            "Saved entry"
        );
        Ok(())
    }

    fn after_reclaim(&self, report: &ReclaimReport) {
        if report.evicted.is_some() {
            self.metrics.record_evictions(1);
        }
        for key in report.removed() {
            self.mirror.invalidate(key);
            self.broadcaster.publish(key.as_str(), BroadcastAction::Deleted);
        }
    }

    // =========================================================================
    // Load Path
    // =========================================================================

    /// Load and deserialize the payload cached for `(logical_type, filter)`
    ///
    /// `Ok(None)` is a miss: absent, expired, corrupt, or undecodable.
    pub async fn load<T>(
        &self,
        logical_type: &str,
        filter: Option<&FilterDescriptor>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let Some(value) = self.load_value(logical_type, filter).await? else {
            return Ok(None);
        };
        match T::deserialize(value.as_ref()) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                self.metrics.record_error();
                warn!(logical_type, error = %e, "Cached payload does not fit the requested type");
                Ok(None)
            }
        }
    }

    /// Load the cached payload as JSON
    pub async fn load_value(
        &self,
        logical_type: &str,
        filter: Option<&FilterDescriptor>,
    ) -> Result<Option<Arc<Value>>> {
        let key = derive_key(logical_type, filter);
        let tracker = LatencyTracker::start();
        match self.fetch(&key).await {
            Ok(Some(value)) => {
                self.metrics.record_hit();
                self.metrics.record_load(tracker.elapsed());
                Ok(Some(value))
            }
            Ok(None) => {
                self.metrics.record_miss();
                Ok(None)
            }
            Err(e) => {
                self.metrics.record_miss();
                self.metrics.record_error();
                warn!(key = %key, error = %e, "Cache unavailable for load");
                Err(e)
            }
        }
    }

    async fn fetch(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        let _guard = self.locks.acquire(key.as_str()).await?;
        let now = self.clock.now();

        if let Some(copy) = self.mirror.get(key) {
            let durable = self
                .retry
                .execute(|| self.store.head(key))
                .await
                .map_err(unavailable)?;
            match durable {
                Some(header) if copy.matches(&header) && !header.is_expired(now) => {
                    return Ok(Some(copy.value));
                }
                _ => {
                    self.mirror.invalidate(key);
                }
            }
        }

        let bytes = self
            .retry
            .execute(|| self.store.get(key))
            .await
            .map_err(unavailable)?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let entry = match CacheEntry::decode(&bytes)
            .and_then(|entry| self.validator.validate_record(key, &entry).map(|_| entry))
        {
            Ok(entry) => entry,
            Err(e) => {
                self.discard(key, &e).await;
                return Ok(None);
            }
        };

        if entry.is_expired(now) {
            debug!(key = %key, expires_at = %entry.metadata.expires_at, "Entry expired");
            return Ok(None);
        }

        let original_size = entry.metadata.original_size_bytes;
        if original_size > self.quota.max_entry_bytes() {
            let e = Error::IntegrityViolation {
                key: key.to_string(),
                reason: format!(
                    "header declares {} bytes, above the {} byte entry limit",
                    original_size,
                    self.quota.max_entry_bytes()
                ),
            };
            self.discard(key, &e).await;
            return Ok(None);
        }

        let raw = if entry.is_compressed {
            let tracker = LatencyTracker::start();
            match self
                .worker
                .decompress_exact(entry.payload.clone(), original_size as usize)
                .await
            {
                Ok(raw) => {
                    self.metrics.record_decompression(tracker.elapsed());
                    raw
                }
                Err(e @ Error::DecompressionFailed { .. }) => {
                    self.discard(key, &e).await;
                    return Ok(None);
                }
                Err(e) => {
                    // Worker trouble says nothing about the record; keep it
                    self.metrics.record_error();
                    warn!(key = %key, error = %e, "Decompression unavailable, reporting miss");
                    return Ok(None);
                }
            }
        } else {
            entry.payload.clone()
        };

        if raw.len() as u64 != entry.metadata.original_size_bytes {
            let e = Error::IntegrityViolation {
                key: key.to_string(),
                reason: format!(
                    "payload decodes to {} bytes, header declares {}",
                    raw.len(),
                    entry.metadata.original_size_bytes
                ),
            };
            self.discard(key, &e).await;
            return Ok(None);
        }

        let value = match self.validator.validate_payload(key, &raw) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                self.discard(key, &e).await;
                return Ok(None);
            }
        };

        self.mirror.insert(
            key.clone(),
            MirrorEntry {
                value: value.clone(),
                version: entry.version,
                cached_at: entry.metadata.cached_at,
                expires_at: entry.metadata.expires_at,
            },
        );
        Ok(Some(value))
    }

    /// Delete a record that failed validation; caller holds the key's lock
    async fn discard(&self, key: &CacheKey, cause: &Error) {
        self.metrics.record_integrity_failure();
        warn!(key = %key, error = %cause, "Discarding corrupt entry");
        self.mirror.invalidate(key);
        match self.store.delete(key).await {
            Ok(true) => self.broadcaster.publish(key.as_str(), BroadcastAction::Deleted),
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to delete corrupt entry"),
        }
    }

    /// Load, or rebuild from source and cache the result
    ///
    /// Cache failures of any kind fall through to `rebuild`; only the
    /// rebuild's own error is returned.
    pub async fn load_or_rebuild<T, E, F, Fut>(
        &self,
        logical_type: &str,
        filter: Option<&FilterDescriptor>,
        rebuild: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.load::<T>(logical_type, filter).await {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(e) => debug!(logical_type, error = %e, "Rebuilding past unavailable cache"),
        }

        let fresh = rebuild().await?;
        // Already logged and counted by save
        let _ = self.save(logical_type, &fresh, filter).await;
        Ok(fresh)
    }

    /// Header of the durable record for `(logical_type, filter)`
    pub async fn head(
        &self,
        logical_type: &str,
        filter: Option<&FilterDescriptor>,
    ) -> Result<Option<RecordSummary>> {
        let key = derive_key(logical_type, filter);
        self.retry.execute(|| self.store.head(&key)).await
    }

    // =========================================================================
    // Invalidation & Maintenance
    // =========================================================================

    /// Remove one entry, every entry of a type, or everything
    ///
    /// | `logical_type` | `filter` | removes |
    /// |---|---|---|
    /// | `Some` | `Some` | the single matching entry |
    /// | `Some` | `None` | every entry of that type |
    /// | `None` | ignored | everything, and resets metrics |
    pub async fn invalidate(
        &self,
        logical_type: Option<&str>,
        filter: Option<&FilterDescriptor>,
    ) -> Result<usize> {
        let result = self.invalidate_inner(logical_type, filter).await;
        match &result {
            Ok(removed) => info!(?logical_type, removed, "Invalidated cache entries"),
            Err(e) => {
                self.metrics.record_error();
                warn!(?logical_type, error = %e, "Invalidation failed");
            }
        }
        result
    }

    async fn invalidate_inner(
        &self,
        logical_type: Option<&str>,
        filter: Option<&FilterDescriptor>,
    ) -> Result<usize> {
        match (logical_type, filter) {
            (Some(logical_type), Some(filter)) => {
                let key = derive_key(logical_type, Some(filter));
                let _guard = self.locks.acquire(key.as_str()).await?;
                self.mirror.invalidate(&key);
                let removed = self.store.delete(&key).await?;
                if removed {
                    self.broadcaster.publish(key.as_str(), BroadcastAction::Deleted);
                }
                Ok(usize::from(removed))
            }
            (Some(logical_type), None) => {
                let removed = self.store.delete_where(logical_type).await?;
                self.mirror.invalidate_all(&removed);
                for key in &removed {
                    self.broadcaster.publish(key.as_str(), BroadcastAction::Deleted);
                }
                Ok(removed.len())
            }
            (None, _) => {
                let removed = self.store.clear().await?;
                self.mirror.clear();
                self.metrics.reset();
                self.broadcaster.publish(ALL_KEYS, BroadcastAction::Cleared);
                Ok(removed)
            }
        }
    }

    /// Delete every expired entry
    pub async fn sweep_expired(&self) -> Result<usize> {
        let removed = self
            .quota
            .sweep_expired(self.clock.now(), None)
            .await
            .map_err(|e| {
                self.metrics.record_error();
                warn!(error = %e, "Expiry sweep failed");
                e
            })?;
        self.mirror.invalidate_all(&removed);
        for key in &removed {
            self.broadcaster.publish(key.as_str(), BroadcastAction::Deleted);
        }
        Ok(removed.len())
    }

    /// Size, count, compression and age of the stored entries
    pub async fn stats(&self) -> Result<CacheStats> {
        let summaries = self.store.summaries().await?;
        Ok(CacheStats::from_summaries(&summaries))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Invoke `handler` whenever a sibling cache saves, deletes or clears
    pub fn subscribe_to_remote_invalidation<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(BroadcastMessage) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(handler)
    }

    /// Stop the worker and cancel subscriptions
    pub async fn shutdown(&self) {
        if let Some(subscription) = self.mirror_subscription.lock().take() {
            subscription.unsubscribe();
        }
        self.broadcaster.close();
        self.worker.shutdown().await;
        self.mirror.clear();
        info!("Corpus cache shut down");
    }
}

/// Collapse store errors that survived retry into a cache-unavailable signal
fn unavailable(error: Error) -> Error {
    match error {
        Error::StoreUnavailable(_) => error,
        other => Error::StoreUnavailable(other.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
