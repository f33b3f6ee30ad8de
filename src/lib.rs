//! Corpus Cache - durable cache for parsed text corpora
//!
//! Stores large derived datasets (tens of thousands of parsed songs per
//! corpus) so that expensive reconstruction is not repeated across process
//! restarts. Entries are compressed when large, validated on every read,
//! expired by TTL, and evicted under storage pressure.
//!
//! ```text
//! caller ─► CorpusCache::load ─► hit ─► payload
//!                              └► miss ─► rebuild from source ─► CorpusCache::save
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Key codec, stores, compression worker, locks, quota, broadcasts
//! - [`clock`] - Injectable time source
//! - [`config`] - Cache configuration
//! - [`error`] - Error types

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;

pub use cache::{
    BroadcastHub, CacheStats, CacheStore, CorpusCache, FileStore, FilterDescriptor,
    InMemoryStore, MetricsSnapshot, PayloadSchema,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{Error, Result};
