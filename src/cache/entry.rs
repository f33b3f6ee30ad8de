//! Cache Entry & Record Codec
//!
//! One [`CacheEntry`] is one durable record. On disk a record is:
//!
//! ```text
//! ┌───────┬──────────────┬───────────────────────────┬───────────────┐
//! │ CCE1  │ header len   │ header (JSON)             │ payload bytes │
//! │ 4 B   │ u32 LE       │ key, version, isCompressed│ sizeBytes B   │
//! │       │              │ metadata{...}             │               │
//! └───────┴──────────────┴───────────────────────────┴───────────────┘
//! ```
//!
//! Decoding is strict: a record missing any header field, carrying an unknown
//! format version, or whose payload length disagrees with `sizeBytes` is
//! rejected as an integrity violation rather than partially interpreted.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::key::CacheKey;
use crate::error::{Error, Result};

/// Leading bytes of every record
pub const RECORD_MAGIC: &[u8; 4] = b"CCE1";

/// Header layout version written by this crate
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Upper bound on a header, to reject garbage lengths early
const MAX_HEADER_BYTES: usize = 1024 * 1024;

const PREAMBLE_LEN: usize = 8;

/// Metadata stored alongside every payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntryMetadata {
    /// Category of cached dataset
    pub logical_type: String,
    /// Normalized filter, or null for the full dataset
    #[serde(deserialize_with = "required_nullable")]
    pub filter_descriptor: Option<Value>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Stored payload size
    pub size_bytes: u64,
    /// Serialized size before compression
    pub original_size_bytes: u64,
    /// `size_bytes / original_size_bytes`; may exceed 1.0
    pub compression_ratio: f64,
}

/// Header of a persisted record (everything but the payload bytes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecordHeader {
    pub format_version: u32,
    pub key: CacheKey,
    pub version: String,
    pub is_compressed: bool,
    pub metadata: EntryMetadata,
}

/// Fields used for enumeration, expiry scans and statistics
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSummary {
    pub key: CacheKey,
    pub version: String,
    pub logical_type: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub original_size_bytes: u64,
    /// Full encoded record length, as charged against quota
    pub record_bytes: u64,
}

impl RecordSummary {
    /// Whether the entry is stale at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn from_header(header: &RecordHeader, record_bytes: u64) -> Self {
        Self {
            key: header.key.clone(),
            version: header.version.clone(),
            logical_type: header.metadata.logical_type.clone(),
            cached_at: header.metadata.cached_at,
            expires_at: header.metadata.expires_at,
            size_bytes: header.metadata.size_bytes,
            original_size_bytes: header.metadata.original_size_bytes,
            record_bytes,
        }
    }
}

/// Durable unit of storage
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub version: String,
    /// Raw serialized content, or its compressed form
    pub payload: Bytes,
    pub is_compressed: bool,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Whether the entry is stale at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.metadata.expires_at
    }

    /// Header describing this entry
    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            format_version: RECORD_FORMAT_VERSION,
            key: self.key.clone(),
            version: self.version.clone(),
            is_compressed: self.is_compressed,
            metadata: self.metadata.clone(),
        }
    }

    /// Serialize into the on-disk record layout
    pub fn encode(&self) -> Result<Bytes> {
        if self.metadata.expires_at <= self.metadata.cached_at {
            return Err(Error::Internal(format!(
                "entry {} expires at or before it was cached",
                self.key
            )));
        }
        let header = serde_json::to_value(self.header())?;
        join_record(&header, &self.payload)
    }

    /// Parse and validate a full record
    pub fn decode(bytes: &Bytes) -> Result<Self> {
        let (header_value, payload) = split_record(bytes)?;
        let header = parse_header(header_value)?;

        if payload.len() as u64 != header.metadata.size_bytes {
            return Err(Error::IntegrityViolation {
                key: header.key.to_string(),
                reason: format!(
                    "payload is {} bytes but header declares {}",
                    payload.len(),
                    header.metadata.size_bytes
                ),
            });
        }

        let offset = bytes.len() - payload.len();
        Ok(Self {
            key: header.key,
            version: header.version,
            payload: bytes.slice(offset..),
            is_compressed: header.is_compressed,
            metadata: header.metadata,
        })
    }

    /// Summary of this entry as it would be stored
    pub fn summary(&self, record_bytes: u64) -> RecordSummary {
        RecordSummary::from_header(&self.header(), record_bytes)
    }
}

/// Decode only the header of a record and summarize it
///
/// `prefix` only needs to contain the preamble and header; the payload may be
/// absent. `record_bytes` is the full record length.
pub fn decode_summary(prefix: &[u8], record_bytes: u64) -> Result<RecordSummary> {
    let header_len = header_len(prefix)?;
    let end = PREAMBLE_LEN + header_len;
    if prefix.len() < end {
        return Err(integrity("<unknown>", "record truncated inside header"));
    }
    let header_value: Value = serde_json::from_slice(&prefix[PREAMBLE_LEN..end])
        .map_err(|e| integrity("<unknown>", format!("header is not JSON: {}", e)))?;
    let header = parse_header(header_value)?;
    Ok(RecordSummary::from_header(&header, record_bytes))
}

/// Bytes needed to read the header of a record, given its first 8 bytes
pub fn header_extent(preamble: &[u8]) -> Result<usize> {
    Ok(PREAMBLE_LEN + header_len(preamble)?)
}

/// Split a record into its raw JSON header and payload slice
pub fn split_record(bytes: &[u8]) -> Result<(Value, &[u8])> {
    let header_len = header_len(bytes)?;
    let end = PREAMBLE_LEN + header_len;
    if bytes.len() < end {
        return Err(integrity("<unknown>", "record truncated inside header"));
    }
    let header: Value = serde_json::from_slice(&bytes[PREAMBLE_LEN..end])
        .map_err(|e| integrity("<unknown>", format!("header is not JSON: {}", e)))?;
    Ok((header, &bytes[end..]))
}

/// Assemble a record from a raw JSON header and payload
pub fn join_record(header: &Value, payload: &[u8]) -> Result<Bytes> {
    let header_bytes = serde_json::to_vec(header)?;
    if header_bytes.len() > MAX_HEADER_BYTES {
        return Err(Error::Internal(format!(
            "record header of {} bytes exceeds {}",
            header_bytes.len(),
            MAX_HEADER_BYTES
        )));
    }
    let mut buf = BytesMut::with_capacity(PREAMBLE_LEN + header_bytes.len() + payload.len());
    buf.put_slice(RECORD_MAGIC);
    buf.put_u32_le(header_bytes.len() as u32);
    buf.put_slice(&header_bytes);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn header_len(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < PREAMBLE_LEN || &bytes[..4] != RECORD_MAGIC {
        return Err(integrity("<unknown>", "missing record magic"));
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if len == 0 || len > MAX_HEADER_BYTES {
        return Err(integrity("<unknown>", format!("invalid header length {}", len)));
    }
    Ok(len)
}

fn parse_header(value: Value) -> Result<RecordHeader> {
    let key = value
        .get("key")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string();

    let header: RecordHeader = serde_json::from_value(value)
        .map_err(|e| integrity(&key, format!("malformed header: {}", e)))?;

    if header.format_version != RECORD_FORMAT_VERSION {
        return Err(integrity(
            &key,
            format!("unsupported format version {}", header.format_version),
        ));
    }
    if header.metadata.expires_at <= header.metadata.cached_at {
        return Err(integrity(&key, "expiresAt is not after cachedAt"));
    }
    if header.metadata.logical_type.is_empty() {
        return Err(integrity(&key, "empty logicalType"));
    }
    Ok(header)
}

fn integrity(key: &str, reason: impl Into<String>) -> Error {
    Error::IntegrityViolation {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Deserialize an `Option` that must be present (possibly as null)
fn required_nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

// =============================================================================
// Tests
// =============================================================================
