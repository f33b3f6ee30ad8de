//! File-backed store
//!
//! Durable backend shared by every process pointed at the same directory:
//!
//! ```text
//! <root>/
//!   gaucho/
//!     gaucho_3f2a...e1.cce
//!     gaucho_9c41...07.cce
//!   nordestino/
//!     nordestino_51d0...aa.cce
//! ```
//!
//! Records are written to a temporary sibling and renamed into place, so a
//! concurrent reader in another process sees either the old record or the new
//! one. Enumeration reads only the preamble and header of each file.
//! Unreadable records are reported as already expired so the next sweep
//! removes them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{CacheStore, StorageEstimate, StoreStats, StoredRecord};
use crate::cache::entry::{decode_summary, header_extent, RecordSummary};
use crate::cache::key::{type_slug, CacheKey};
use crate::error::{is_out_of_space, Error, Result};

/// Record headers read in parallel during scans
const HEADER_READ_CONCURRENCY: usize = 16;

const RECORD_EXTENSION: &str = "cce";
const TEMP_EXTENSION: &str = "tmp";
const JOURNAL_DIR: &str = ".broadcast";

/// One-file-per-record store rooted at a directory
pub struct FileStore {
    root: PathBuf,
    quota: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl FileStore {
    /// Open (creating if needed) a store under `root` limited to `quota` bytes
    pub async fn open(root: impl Into<PathBuf>, quota: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), quota, "Opened file store");
        Ok(Self {
            root,
            quota,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for broadcast journals of caches sharing this store
    pub fn journal_dir(&self) -> PathBuf {
        self.root.join(JOURNAL_DIR)
    }

    /// Path of the record for `key`; `None` for keys this store never writes
    fn record_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let (slug, hash) = key.as_str().rsplit_once('_')?;
        if slug.is_empty()
            || hash.is_empty()
            || !key
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return None;
        }
        Some(
            self.root
                .join(slug)
                .join(format!("{}.{}", key, RECORD_EXTENSION)),
        )
    }

    async fn type_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            // Dot directories (the broadcast journal) hold no records
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden && entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn all_record_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in self.type_dirs().await? {
            files.extend(Self::record_files(&dir).await?);
        }
        Ok(files)
    }

    /// Read the header of one record file
    ///
    /// Returns `Ok(None)` if the file vanished; a corrupt file yields a
    /// placeholder summary that is already expired.
    async fn read_summary(path: &Path) -> Result<Option<RecordSummary>> {
        let mut file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record_bytes = file.metadata().await?.len();

        let mut preamble = [0u8; 8];
        let decoded = match file.read_exact(&mut preamble).await {
            Ok(_) => match header_extent(&preamble) {
                Ok(extent) if extent as u64 <= record_bytes => {
                    let mut prefix = vec![0u8; extent];
                    prefix[..8].copy_from_slice(&preamble);
                    file.read_exact(&mut prefix[8..]).await?;
                    decode_summary(&prefix, record_bytes)
                }
                Ok(_) => Err(Error::IntegrityViolation {
                    key: path.display().to_string(),
                    reason: "header extends past end of file".into(),
                }),
                Err(e) => Err(e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::IntegrityViolation {
                    key: path.display().to_string(),
                    reason: "file shorter than record preamble".into(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        match decoded {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable record header");
                Ok(Some(corrupt_summary(path, record_bytes)))
            }
        }
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn usage(&self) -> Result<u64> {
        let mut usage = 0;
        for path in self.all_record_files().await? {
            match fs::metadata(&path).await {
                Ok(meta) => usage += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(usage)
    }
}

/// Summary standing in for a record whose header cannot be decoded
fn corrupt_summary(path: &Path, record_bytes: u64) -> RecordSummary {
    let key = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let logical_type = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    RecordSummary {
        key: CacheKey::from_raw(key),
        version: String::new(),
        logical_type,
        cached_at: DateTime::<Utc>::MIN_UTC,
        expires_at: DateTime::<Utc>::MIN_UTC,
        size_bytes: 0,
        original_size_bytes: 0,
        record_bytes,
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn put(&self, record: StoredRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let path = self.record_path(&record.summary.key).ok_or_else(|| {
            Error::Internal(format!("key {} is not storable", record.summary.key))
        })?;

        let replaced = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let usage = self.usage().await?;
        let projected = usage.saturating_sub(replaced) + record.len();
        if projected > self.quota {
            return Err(Error::QuotaExceeded(format!(
                "write of {} bytes would use {} of {} bytes",
                record.len(),
                projected,
                self.quota
            )));
        }

        let dir = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("record path {} has no parent", path.display())))?;
        fs::create_dir_all(dir).await?;

        let temp = dir.join(format!(
            ".{}.{}.{}",
            record.summary.key,
            uuid::Uuid::new_v4().simple(),
            TEMP_EXTENSION
        ));
        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&record.bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp).await;
            if is_out_of_space(&e) {
                return Err(Error::QuotaExceeded(format!(
                    "{} while writing {}",
                    e,
                    path.display()
                )));
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let Some(path) = self.record_path(key) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &CacheKey) -> Result<Option<RecordSummary>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.record_path(key) {
            Some(path) => Self::read_summary(&path).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        match self.record_path(key) {
            Some(path) => self.remove_file(&path).await,
            None => Ok(false),
        }
    }

    async fn delete_where(&self, logical_type: &str) -> Result<Vec<CacheKey>> {
        let dir = self.root.join(type_slug(logical_type));
        let mut removed = Vec::new();
        for path in Self::record_files(&dir).await? {
            let Some(summary) = Self::read_summary(&path).await? else {
                continue;
            };
            // Distinct types may share a slug; unreadable records go too
            let unreadable = summary.version.is_empty();
            if (summary.logical_type == logical_type || unreadable)
                && self.remove_file(&path).await?
            {
                removed.push(summary.key);
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in self.type_dirs().await? {
            removed += Self::record_files(&dir).await?.len();
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    async fn scan_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordSummary>> {
        let mut expired: Vec<RecordSummary> = self
            .summaries()
            .await?
            .into_iter()
            .filter(|s| s.is_expired(now))
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.key.cmp(&b.key)));
        Ok(expired)
    }

    async fn summaries(&self) -> Result<Vec<RecordSummary>> {
        let files = self.all_record_files().await?;
        let headers: Vec<Option<RecordSummary>> = stream::iter(files)
            .map(|path| async move { Self::read_summary(&path).await })
            .buffered(HEADER_READ_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(headers.into_iter().flatten().collect())
    }

    async fn estimate(&self) -> Result<StorageEstimate> {
        Ok(StorageEstimate {
            usage: self.usage().await?,
            quota: Some(self.quota),
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
        "file"
    }
}
