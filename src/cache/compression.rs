//! Payload Compression Codecs
//!
//! LZ4 block compression with the uncompressed length prepended, so
//! decompression needs no out-of-band size. These codecs are CPU-bound and are
//! only ever driven from the compression worker thread.
//!
//! # Example
//!
//! ```
//! use corpus_cache::cache::compression::{Compressor, Lz4Compressor};
//!
//! let codec = Lz4Compressor::new();
//! let data = b"Hello, this is test data that should compress well! Hello, this is test data!";
//!
//! let compressed = codec.compress(data).unwrap();
//! let restored = codec.decompress(&compressed).unwrap();
//! assert_eq!(restored.as_slice(), data.as_slice());
//! ```

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Codec implementing this algorithm
    pub fn compressor(&self) -> Box<dyn Compressor> {
        match self {
            CompressionAlgorithm::None => Box::new(NoopCompressor),
            CompressionAlgorithm::Lz4 => Box::new(Lz4Compressor::new()),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data that must expand to exactly `expected_len` bytes
    fn decompress_exact(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = self.decompress(data)?;
        if out.len() != expected_len {
            return Err(Error::DecompressionFailed {
                algorithm: self.algorithm().to_string(),
                reason: format!("expanded to {} bytes, expected {}", out.len(), expected_len),
            });
        }
        Ok(out)
    }
}

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create new LZ4 compressor with default settings
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() > i32::MAX as usize {
            return Err(Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: format!("input of {} bytes exceeds the LZ4 block limit", data.len()),
            });
        }
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_size_prefix(data)?;
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress_exact(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        // Checked before lz4 allocates its output buffer from the prefix
        let declared = lz4_size_prefix(data)?;
        if declared != expected_len {
            return Err(Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: format!("size prefix {} disagrees with expected {}", declared, expected_len),
            });
        }
        self.decompress(data)
    }
}

/// Uncompressed length from the little-endian i32 prefix; negative is corruption
fn lz4_size_prefix(data: &[u8]) -> Result<usize> {
    let invalid = || Error::DecompressionFailed {
        algorithm: "LZ4".into(),
        reason: "missing or invalid size prefix".into(),
    };
    let prefix: [u8; 4] = data.get(..4).and_then(|p| p.try_into().ok()).ok_or_else(invalid)?;
    usize::try_from(i32::from_le_bytes(prefix)).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor::new();

        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len());

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_noop_roundtrip() {
        let compressor = NoopCompressor;

        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert_eq!(compressed, TEST_DATA);

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_lz4_rejects_garbage() {
        let compressor = Lz4Compressor::new();
        assert!(matches!(
            compressor.decompress(b"\x01"),
            Err(Error::DecompressionFailed { .. })
        ));
        assert!(compressor.decompress(&[0xff, 0xff, 0xff, 0xff, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_lz4_exact_checks_prefix_before_expanding() {
        let compressor = Lz4Compressor::new();
        let mut compressed = compressor.compress(TEST_DATA).unwrap();

        let restored = compressor.decompress_exact(&compressed, TEST_DATA.len()).unwrap();
        assert_eq!(restored, TEST_DATA);

        // A prefix claiming ~2 GiB is refused without being trusted
        compressed[..4].copy_from_slice(&(i32::MAX - 1).to_le_bytes());
        assert!(matches!(
            compressor.decompress_exact(&compressed, TEST_DATA.len()),
            Err(Error::DecompressionFailed { .. })
        ));
    }

    #[test]
    fn test_noop_exact_checks_length() {
        assert!(NoopCompressor.decompress_exact(TEST_DATA, TEST_DATA.len()).is_ok());
        assert!(NoopCompressor.decompress_exact(TEST_DATA, 3).is_err());
    }

    #[test]
    fn test_incompressible_data_may_grow() {
        let compressor = Lz4Compressor::new();
        let noise: Vec<u8> = (0..64u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();

        let compressed = compressor.compress(&noise).unwrap();
        // Small incompressible input carries header overhead
        assert!(compressed.len() >= noise.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), noise);
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Lz4.name(), "lz4");
        assert_eq!(CompressionAlgorithm::default(), CompressionAlgorithm::Lz4);
        assert_eq!(
            CompressionAlgorithm::Lz4.compressor().algorithm(),
            CompressionAlgorithm::Lz4
        );
    }
}
