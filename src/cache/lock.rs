//! Per-Key Lock Manager
//!
//! Serializes read-modify-write sections on the same cache key within one
//! process. Waiters park on a [`Notify`] instead of sleep-polling, and give up
//! with [`Error::LockTimeout`] once the bounded wait elapses.
//!
//! This is a process-local lock. Sibling processes are not excluded; they are
//! reconciled by last-write-wins plus broadcast invalidation.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

/// In-memory set of currently locked keys
#[derive(Debug, Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
    timeout: Duration,
}

/// Releases its key when dropped, including on panic or cancellation
#[derive(Debug)]
pub struct KeyGuard {
    table: Arc<LockTable>,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.table.held.lock().remove(&self.key);
        self.table.released.notify_waiters();
        trace!(key = %self.key, "Lock released");
    }
}

impl KeyGuard {
    /// Locked key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl LockManager {
    /// Create a manager whose acquisitions wait at most `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            timeout,
        }
    }

    /// Configured bounded wait
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `key` is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        self.table.held.lock().contains(key)
    }

    /// Number of keys currently held
    pub fn held_count(&self) -> usize {
        self.table.held.lock().len()
    }

    /// Acquire `key`, waiting at most the configured timeout
    pub async fn acquire(&self, key: &str) -> Result<KeyGuard> {
        let deadline = Instant::now() + self.timeout;
        loop {
            // Register interest before checking so a release in between is not missed
            let notified = self.table.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.table.held.lock().insert(key.to_string()) {
                trace!(key, "Lock acquired");
                return Ok(KeyGuard {
                    table: self.table.clone(),
                    key: key.to_string(),
                });
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(key, timeout = ?self.timeout, "Lock acquisition timed out");
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                    waited: self.timeout,
                });
            }
        }
    }

    /// Acquire `key` only if it is free right now
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        if !self.table.held.lock().insert(key.to_string()) {
            return None;
        }
        Some(KeyGuard {
            table: self.table.clone(),
            key: key.to_string(),
        })
    }

    /// Run `f` while holding `key`
    pub async fn with_lock<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await?;
        Ok(f().await)
    }
}

// =============================================================================
// Tests
// =============================================================================
