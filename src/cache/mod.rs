//! Persistent Corpus Cache
//!
//! Durable, compressed, quota-aware storage for large derived datasets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             CorpusCache                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Key Codec   │ Lock Manager │ Quota Manager │ Integrity │ Mirror (LRU)   │
//! │  sha256 key  │ per-key,     │ sweep, then   │ record +  │ revalidated by │
//! │  + version   │ bounded wait │ evict oldest  │ payload   │ durable header │
//! ├──────────────┴──────────────┴───────────────┴───────────┴────────────────┤
//! │  Retry/Backoff Executor  ──►  CacheStore (InMemoryStore | FileStore)     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Compression Worker (LZ4, own thread)  │  Broadcaster  │  Metrics        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Same-key operations are serialized within a process
//! - Readers see a whole record or nothing
//! - Cache failures degrade to a miss; they never replace source data

pub mod broadcast;
pub mod compression;
pub mod entry;
pub mod integrity;
pub mod journal;
pub mod key;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod mirror;
pub mod quota;
pub mod retry;
pub mod store;
pub mod worker;

pub use broadcast::{BroadcastAction, BroadcastHub, BroadcastMessage, Broadcaster, Subscription};
pub use compression::{CompressionAlgorithm, Compressor, Lz4Compressor, NoopCompressor};
pub use entry::{CacheEntry, EntryMetadata, RecordSummary};
pub use integrity::{IntegrityValidator, PayloadSchema};
pub use key::{derive_key, derive_version, CacheKey, FilterDescriptor};
pub use lock::{KeyGuard, LockManager};
pub use manager::{CacheStats, CorpusCache, CorpusCacheBuilder};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use quota::{QuotaManager, ReclaimReport};
pub use retry::{RetryExecutor, RetryPolicy};
pub use store::{CacheStore, FileStore, InMemoryStore, StorageEstimate, StoredRecord};
pub use worker::CompressionWorker;
