//! Cross-Process Broadcaster
//!
//! Best-effort "saved / deleted / cleared" notifications between sibling
//! cache instances sharing one durable store. A [`BroadcastHub`] owns the
//! named channels; each [`Broadcaster`] publishes with its own origin id and
//! ignores its own messages on receipt.
//!
//! ```text
//!  CorpusCache A ──publish──►┌──────────────────────┐──►  CorpusCache B handler
//!                            │ hub["corpus-cache"]  │
//!  CorpusCache B ──publish──►└──────────────────────┘──►  CorpusCache A handler
//! ```
//!
//! A hub built with [`BroadcastHub::journaled`] also appends every message to
//! a per-channel journal file and tails the siblings' appends, which carries
//! messages between processes sharing the same directory.
//!
//! Delivery is best-effort with no ordering or acknowledgement. A slow
//! subscriber that lags behind loses messages; it re-validates on its next
//! read instead. Messages never mutate the durable store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::journal::Journal;
use crate::error::{Error, Result};

/// Buffered messages per channel before slow receivers start lagging
pub const CHANNEL_CAPACITY: usize = 256;

/// Cache key used for whole-cache notifications
pub const ALL_KEYS: &str = "*";

/// What happened to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastAction {
    Saved,
    Deleted,
    Cleared,
}

impl std::fmt::Display for BroadcastAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Saved => "saved",
            Self::Deleted => "deleted",
            Self::Cleared => "cleared",
        };
        f.write_str(s)
    }
}

/// Channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub cache_key: String,
    pub action: BroadcastAction,
    pub timestamp: DateTime<Utc>,
}

/// Message as carried on a channel and in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    /// Publishing broadcaster
    pub(crate) origin: Uuid,
    /// Hub of the publishing broadcaster
    pub(crate) hub: Uuid,
    pub(crate) message: BroadcastMessage,
}

/// Registry of named broadcast channels
///
/// Cache instances constructed with the same hub and channel name see each
/// other's messages. Journaled hubs over one directory see each other's
/// messages too, across processes.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    id: Uuid,
    channels: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
    journal: Option<Arc<Journal>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            channels: Arc::new(DashMap::new()),
            journal: None,
        }
    }
}

impl BroadcastHub {
    /// In-process hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub that also exchanges messages through journal files under `dir`
    ///
    /// Siblings' messages are picked up every `poll_interval`. Must be called
    /// from within a Tokio runtime.
    pub fn journaled(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let id = Uuid::new_v4();
        let journal = Journal::open(dir.into(), id, poll_interval)?;
        Ok(Self {
            id,
            channels: Arc::new(DashMap::new()),
            journal: Some(Arc::new(journal)),
        })
    }

    /// Directory of the journal files, if any
    pub fn journal_dir(&self) -> Option<&Path> {
        self.journal.as_deref().map(Journal::dir)
    }

    fn sender(&self, name: &str) -> broadcast::Sender<Envelope> {
        match self.channels.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
                if let Some(journal) = &self.journal {
                    journal.tail(name, sender.clone());
                }
                entry.insert(sender.clone());
                sender
            }
        }
    }

    /// Number of live receivers on `name`
    pub fn receiver_count(&self, name: &str) -> usize {
        self.channels
            .get(name)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// Handle returned by [`Broadcaster::subscribe`]; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    /// Stop receiving messages
    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Publisher/subscriber bound to one channel of a hub
pub struct Broadcaster {
    channel: String,
    origin: Uuid,
    hub: Uuid,
    sender: broadcast::Sender<Envelope>,
    journal: Option<Arc<Journal>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Broadcaster {
    pub fn new(hub: &BroadcastHub, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let sender = hub.sender(&channel);
        Self {
            channel,
            origin: Uuid::new_v4(),
            hub: hub.id,
            sender,
            journal: hub.journal.clone(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Identity stamped on outgoing messages
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Fire-and-forget notification to siblings
    pub fn publish(&self, cache_key: &str, action: BroadcastAction) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let envelope = Envelope {
            origin: self.origin,
            hub: self.hub,
            message: BroadcastMessage {
                cache_key: cache_key.to_string(),
                action,
                timestamp: Utc::now(),
            },
        };
        if let Some(journal) = &self.journal {
            journal.append(&self.channel, &envelope);
        }
        match self.sender.send(envelope) {
            Ok(receivers) => trace!(channel = %self.channel, key = cache_key, %action, receivers, "Published"),
            // No subscribers anywhere is normal
            Err(_) => trace!(channel = %self.channel, key = cache_key, %action, "Published with no receivers"),
        }
    }

    /// Invoke `handler` for every message published by a sibling
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(BroadcastMessage) + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "broadcaster on {} is shut down",
                self.channel
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("subscribe needs a Tokio runtime: {}", e)))?;

        let token = self.shutdown.child_token();
        let mut receiver = self.sender.subscribe();
        let origin = self.origin;
        let channel = self.channel.clone();
        let cancelled = token.clone();

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(envelope) if envelope.origin == origin => {}
                        Ok(envelope) => handler(envelope.message),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(channel = %channel, "Subscription ended");
        });

        Ok(Subscription { token })
    }

    /// Cancel all subscriptions and stop publishing
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
