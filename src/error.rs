//! Error types for the corpus cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the corpus cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Save Path Errors
    // =========================================================================
    /// Entry exceeds the per-entry maximum; rejected before any I/O
    #[error("Payload of {size} bytes exceeds the per-entry maximum of {max} bytes")]
    OversizedPayload { size: u64, max: u64 },

    /// Quota exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Per-key lock could not be acquired in time
    #[error("Timed out after {waited:?} waiting for lock on {key}")]
    LockTimeout { key: String, waited: Duration },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression worker did not reply in time
    #[error("Compression worker did not reply to request {request_id} within {timeout:?}")]
    CompressionTimeout { request_id: u64, timeout: Duration },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Compression worker is gone (shut down or crashed)
    #[error("Compression worker unavailable: {0}")]
    WorkerUnavailable(String),

    // =========================================================================
    // Read Path Errors
    // =========================================================================
    /// Stored record or decoded payload failed shape validation
    #[error("Integrity violation for {key}: {reason}")]
    IntegrityViolation { key: String, reason: String },

    // =========================================================================
    // Store / Transport Errors
    // =========================================================================
    /// Durable store transiently unavailable
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Network failure while talking to a remote source
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Remote source answered with an error status
    #[error("Remote error (status {status}): {message}")]
    Remote { status: u16, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the failed operation can plausibly succeed.
    ///
    /// Quota exhaustion is never transient: retrying cannot create space.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StoreUnavailable(_) | Error::Network(_) | Error::Timeout(_) => true,
            Error::Remote { status, .. } => *status >= 500 || *status == 429,
            Error::Io(e) => {
                !is_out_of_space(e)
                    && !matches!(
                        e.kind(),
                        std::io::ErrorKind::PermissionDenied
                            | std::io::ErrorKind::NotFound
                            | std::io::ErrorKind::InvalidData
                            | std::io::ErrorKind::InvalidInput
                    )
            }
            _ => false,
        }
    }

    /// Whether this error means the store is out of space.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Error::QuotaExceeded(_) => true,
            Error::Io(e) => is_out_of_space(e),
            _ => false,
        }
    }
}

/// Whether an I/O error reports a full disk or an exhausted filesystem quota
pub fn is_out_of_space(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
    )
}
