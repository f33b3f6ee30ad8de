//! Quota Manager
//!
//! Keeps writes inside the store's capacity:
//!
//! ```text
//! save(size) ──► size > max_entry? ──yes──► OversizedPayload (no I/O)
//!                      │ no
//!                      ▼
//!            free >= size × safety? ──yes──► write
//!                      │ no
//!                      ▼
//!               sweep expired ──► free enough? ──yes──► write
//!                                      │ no
//!                                      ▼
//!                          evict oldest (by cachedAt) ──► write
//! ```
//!
//! Reads never trigger eviction. Victims whose per-key lock is busy are
//! skipped; they are being rewritten anyway.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::lock::LockManager;
use super::store::{CacheStore, StorageEstimate};
use crate::error::{Error, Result};

/// What a reclaim pass removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimReport {
    /// Keys removed by the expiry sweep
    pub expired: Vec<CacheKey>,
    /// Key removed by oldest-entry eviction
    pub evicted: Option<CacheKey>,
    /// Whether the write is now projected to fit
    pub satisfied: bool,
}

impl ReclaimReport {
    /// Keys removed by this pass
    pub fn removed(&self) -> impl Iterator<Item = &CacheKey> {
        self.expired.iter().chain(self.evicted.iter())
    }

    pub fn removed_count(&self) -> usize {
        self.expired.len() + usize::from(self.evicted.is_some())
    }
}

/// Quota checks and eviction for the save path
pub struct QuotaManager {
    store: Arc<dyn CacheStore>,
    locks: LockManager,
    max_entry_bytes: u64,
    safety_factor: f64,
}

impl QuotaManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        locks: LockManager,
        max_entry_bytes: u64,
        safety_factor: f64,
    ) -> Self {
        Self {
            store,
            locks,
            max_entry_bytes,
            safety_factor,
        }
    }

    pub fn max_entry_bytes(&self) -> u64 {
        self.max_entry_bytes
    }

    /// Reject entries above the per-entry maximum
    pub fn check_entry_size(&self, size: u64) -> Result<()> {
        if size > self.max_entry_bytes {
            return Err(Error::OversizedPayload {
                size,
                max: self.max_entry_bytes,
            });
        }
        Ok(())
    }

    /// Space a write of `size` bytes must find free
    pub fn required_headroom(&self, size: u64) -> u64 {
        (size as f64 * self.safety_factor).ceil() as u64
    }

    fn fits(&self, estimate: &StorageEstimate, size: u64, replaced: u64) -> bool {
        match estimate.available() {
            Some(available) => available.saturating_add(replaced) >= self.required_headroom(size),
            None => true,
        }
    }

    /// Whether a write of `size` bytes currently fits with margin
    pub async fn has_room(&self, size: u64) -> Result<bool> {
        self.has_room_replacing(size, 0).await
    }

    /// Whether a write of `size` bytes fits once `replaced` bytes are freed by it
    pub async fn has_room_replacing(&self, size: u64, replaced: u64) -> Result<bool> {
        let estimate = self.store.estimate().await?;
        Ok(self.fits(&estimate, size, replaced))
    }

    /// Bytes the current record under `key` occupies, freed when it is rewritten
    async fn replaced_bytes(&self, key: &CacheKey) -> Result<u64> {
        Ok(self
            .store
            .head(key)
            .await?
            .map(|summary| summary.record_bytes)
            .unwrap_or(0))
    }

    /// Make room for a write of `size` bytes to `writing`
    ///
    /// The record already stored under `writing` counts as free space. Only
    /// reclaims when the write does not already fit with margin. An
    /// unsatisfied report is not an error; the write is still attempted and
    /// the store has the final word.
    pub async fn ensure_capacity(
        &self,
        size: u64,
        writing: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport> {
        let replaced = self.replaced_bytes(writing).await?;
        if self.has_room_replacing(size, replaced).await? {
            return Ok(ReclaimReport {
                satisfied: true,
                ..ReclaimReport::default()
            });
        }
        self.reclaim_with(size, replaced, writing, now).await
    }

    /// Sweep expired entries, then evict the oldest if still short
    ///
    /// Runs unconditionally; used directly after the store itself rejected a
    /// write for lack of space.
    pub async fn reclaim(
        &self,
        size: u64,
        writing: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport> {
        let replaced = self.replaced_bytes(writing).await?;
        self.reclaim_with(size, replaced, writing, now).await
    }

    async fn reclaim_with(
        &self,
        size: u64,
        replaced: u64,
        writing: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        debug!(key = %writing, size, replaced, "Low on space, sweeping expired entries");
        report.expired = self.sweep_expired(now, Some(writing)).await?;
        if self.has_room_replacing(size, replaced).await? {
            report.satisfied = true;
            return Ok(report);
        }

        report.evicted = self.evict_oldest(Some(writing)).await?;
        report.satisfied = self.has_room_replacing(size, replaced).await?;
        if !report.satisfied {
            warn!(
                key = %writing,
                size,
                headroom = self.required_headroom(size),
                "Still short of space after eviction"
            );
        }
        Ok(report)
    }

    /// Delete every expired entry except `skip`
    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        skip: Option<&CacheKey>,
    ) -> Result<Vec<CacheKey>> {
        let mut removed = Vec::new();
        for summary in self.store.scan_expired(now).await? {
            if Some(&summary.key) == skip {
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(summary.key.as_str()) else {
                debug!(key = %summary.key, "Skipping busy entry in sweep");
                continue;
            };
            if self.store.delete(&summary.key).await? {
                removed.push(summary.key);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Swept expired entries");
        }
        Ok(removed)
    }

    /// Delete the entry with the earliest `cached_at`, except `skip`
    pub async fn evict_oldest(&self, skip: Option<&CacheKey>) -> Result<Option<CacheKey>> {
        let mut candidates = self.store.summaries().await?;
        candidates.retain(|s| Some(&s.key) != skip);
        candidates.sort_by(|a, b| a.cached_at.cmp(&b.cached_at).then_with(|| a.key.cmp(&b.key)));

        for candidate in candidates {
            let Some(_guard) = self.locks.try_acquire(candidate.key.as_str()) else {
                continue;
            };
            if self.store.delete(&candidate.key).await? {
                info!(key = %candidate.key, cached_at = %candidate.cached_at, "Evicted oldest entry");
                return Ok(Some(candidate.key));
            }
        }
        Ok(None)
    }
}
