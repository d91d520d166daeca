//! Payload Compression
//!
//! The `Codec` trait is the contract of the external audio codec
//! (`compress(bytes, targetFormat, targetQuality) -> {bytes, ratio}`).
//! `Lz4Codec` is the built-in lossless implementation. A failed compression
//! always falls back to storing the uncompressed payload.
//!
//! # Example
//!
//! ```
//! use layercast::cache::compression::{Codec, CompressionProfile, Lz4Codec};
//!
//! let codec = Lz4Codec::new();
//! let data = b"Hello, this is test data that should compress well! Hello, this is test data.";
//! let out = codec.compress(data, &CompressionProfile::default()).unwrap();
//!
//! let restored = codec.decompress(&out.bytes, out.algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// How a payload was transformed before storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast lossless compression
    Lz4,
    /// Lossy transcode by an external codec (not reversible)
    Transcoded,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Transcoded => "transcoded",
        }
    }

    /// Whether the original bytes can be recovered
    pub fn is_lossless(&self) -> bool {
        !matches!(self, CompressionAlgorithm::Transcoded)
    }
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Lz4
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Codec Contract
// =============================================================================

/// Requested output of a compression call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionProfile {
    /// Target format (`lz4`, `opus`, ...)
    pub target_format: String,
    /// Target quality (0.0 - 1.0), meaningful for lossy codecs
    pub target_quality: f32,
}

impl Default for CompressionProfile {
    fn default() -> Self {
        Self {
            target_format: "lz4".to_string(),
            target_quality: 1.0,
        }
    }
}

/// Output of a successful compression
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub bytes: Bytes,
    /// compressed / original
    pub ratio: f64,
    pub algorithm: CompressionAlgorithm,
}

/// Codec used opportunistically on writes
pub trait Codec: Send + Sync {
    /// Compress a payload
    fn compress(&self, data: &[u8], profile: &CompressionProfile) -> Result<CompressedPayload>;

    /// Recover the original payload, for lossless algorithms
    fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes>;
}

// =============================================================================
// LZ4 Codec
// =============================================================================

/// LZ4 codec (fast lossless compression)
pub struct Lz4Codec {
    level: i32,
}

impl Lz4Codec {
    /// Create new LZ4 codec with default settings
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for Lz4Codec {
    fn compress(&self, data: &[u8], _profile: &CompressionProfile) -> Result<CompressedPayload> {
        let compressed = lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?;

        let ratio = if data.is_empty() {
            1.0
        } else {
            compressed.len() as f64 / data.len() as f64
        };
        Ok(CompressedPayload {
            bytes: Bytes::from(compressed),
            ratio,
            algorithm: CompressionAlgorithm::Lz4,
        })
    }

    fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
                .map(Bytes::from)
                .map_err(|e| Error::DecompressionFailed {
                    algorithm: "LZ4".into(),
                    reason: e.to_string(),
                }),
            CompressionAlgorithm::Transcoded => Err(Error::DecompressionFailed {
                algorithm: algorithm.name().into(),
                reason: "lossy transcode cannot be reversed".into(),
            }),
        }
    }
}

/// Compress with fallback: only keeps the result when it is actually smaller.
///
/// Returns `None` when the payload should be stored uncompressed.
pub fn compress_or_fallback(
    codec: &dyn Codec,
    data: &[u8],
    profile: &CompressionProfile,
) -> Option<CompressedPayload> {
    match codec.compress(data, profile) {
        Ok(out) if out.bytes.len() < data.len() => Some(out),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Compression failed, storing uncompressed: {}", e);
            None
        }
    }
}
