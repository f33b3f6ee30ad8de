//! Cache Configuration
//!
//! Every policy knob of the cache lives in [`CacheConfig`]. Configuration can be
//! built in code, or loaded from YAML where durations are written Go-style:
//!
//! ```yaml
//! full_ttl: 7d
//! filtered_ttl: 24h
//! compression_timeout: 2m
//! retry:
//!   max_retries: 3
//!   base_delay: 500ms
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Default TTL for full (unfiltered) datasets
pub const DEFAULT_FULL_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default TTL for filtered subsets
pub const DEFAULT_FILTERED_TTL: Duration = Duration::from_secs(24 * 3600);

/// Upper bound for either TTL (100 years)
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Default per-entry maximum (200 MiB serialized)
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 200 * 1024 * 1024;

/// Payloads smaller than this are stored uncompressed (100 KiB)
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 100 * 1024;

/// Default file-store quota (2 GiB)
pub const DEFAULT_QUOTA_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Retry/backoff settings for store writes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(deserialize_with = "de_duration")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(deserialize_with = "de_duration")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Corpus cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for unfiltered datasets
    #[serde(deserialize_with = "de_duration")]
    pub full_ttl: Duration,
    /// TTL for filtered subsets
    #[serde(deserialize_with = "de_duration")]
    pub filtered_ttl: Duration,
    /// Hard per-entry maximum of the serialized payload
    pub max_entry_bytes: u64,
    /// Minimum serialized size before compression is attempted
    pub compression_threshold_bytes: u64,
    /// Hard timeout for one compression worker round-trip
    #[serde(deserialize_with = "de_duration")]
    pub compression_timeout: Duration,
    /// Bounded wait for a per-key lock
    #[serde(deserialize_with = "de_duration")]
    pub lock_timeout: Duration,
    /// Free space required before a write, as a multiple of the record size
    pub quota_safety_factor: f64,
    /// Logical broadcast channel shared by sibling caches
    pub channel_name: String,
    /// Entries kept in the process-local mirror (0 disables it)
    pub mirror_capacity: usize,
    /// Quota enforced by the file store
    pub quota_bytes: u64,
    /// Store write retry policy
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            full_ttl: DEFAULT_FULL_TTL,
            filtered_ttl: DEFAULT_FILTERED_TTL,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            compression_timeout: Duration::from_secs(120),
            lock_timeout: Duration::from_secs(30),
            quota_safety_factor: 1.5,
            channel_name: "corpus-cache".to_string(),
            mirror_capacity: 8,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.full_ttl.is_zero() || self.filtered_ttl.is_zero() {
            return Err(Error::Config("TTLs must be greater than zero".into()));
        }
        if self.full_ttl > MAX_TTL || self.filtered_ttl > MAX_TTL {
            return Err(Error::Config(format!(
                "TTLs must not exceed {} days",
                MAX_TTL.as_secs() / 86_400
            )));
        }
        if self.max_entry_bytes == 0 {
            return Err(Error::Config("max_entry_bytes must be greater than zero".into()));
        }
        if self.quota_safety_factor < 1.0 {
            return Err(Error::Config(format!(
                "quota_safety_factor must be >= 1.0, got {}",
                self.quota_safety_factor
            )));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.channel_name.trim().is_empty() {
            return Err(Error::Config("channel_name must not be empty".into()));
        }
        Ok(())
    }

    /// Set both TTLs
    pub fn with_ttls(mut self, full: Duration, filtered: Duration) -> Self {
        self.full_ttl = full;
        self.filtered_ttl = filtered;
        self
    }

    /// Set the compression threshold
    pub fn with_compression_threshold(mut self, bytes: u64) -> Self {
        self.compression_threshold_bytes = bytes;
        self
    }

    /// Set the per-entry maximum
    pub fn with_max_entry_bytes(mut self, bytes: u64) -> Self {
        self.max_entry_bytes = bytes;
        self
    }

    /// Set the lock timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the broadcast channel name
    pub fn with_channel(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    /// Set the mirror capacity
    pub fn with_mirror_capacity(mut self, capacity: usize) -> Self {
        self.mirror_capacity = capacity;
        self
    }
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a Go-style duration string (e.g., "500ms", "30m", "24h", "7d")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier_ms = match c {
            'm' | 'M' if chars.peek().map_or(false, |n| *n == 's' || *n == 'S') => {
                chars.next();
                1
            }
            'd' | 'D' => 86_400_000,
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = num
            .checked_mul(multiplier_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    // Trailing bare number is seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = num
            .checked_mul(1_000)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    if total_ms == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_millis(total_ms))
}
