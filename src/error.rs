//! Error types for Layercast

use thiserror::Error;

use crate::cache::LayerId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache subsystem
///
/// A cache miss is not an error: lookups return `Option`.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Layer Errors
    // =========================================================================
    /// A single layer is down; callers degrade instead of failing
    #[error("Layer unavailable: {layer}")]
    LayerUnavailable { layer: LayerId },

    /// No target layer accepted a write
    #[error("Write for key {key} failed on every target layer: {failures:?}")]
    WriteFailedEverywhere { key: String, failures: Vec<String> },

    /// A layer could not open its medium at startup
    #[error("Layer {layer} failed to initialize: {reason}")]
    InitializationFailure { layer: LayerId, reason: String },

    /// Persisted entry bytes could not be decoded
    #[error("Corrupt entry envelope: {0}")]
    EnvelopeCorrupt(String),

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// The resolver produced no confident result
    #[error("Conflict on key {key} could not be resolved: {reason}")]
    ConflictUnresolvable { key: String, reason: String },

    /// A cross-layer call exceeded its budget
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The operation observed cancellation before completing
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    /// The cache instance has been disposed
    #[error("Cache has been disposed")]
    Disposed,

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Asset fetch from the network/CDN failed
    #[error("Fetch of {bucket}/{path} failed: {reason}")]
    Fetch {
        bucket: String,
        path: String,
        reason: String,
    },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics export error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error only concerns one layer or one operation and the
    /// cache as a whole keeps working
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            Error::LayerUnavailable { .. }
                | Error::Timeout { .. }
                | Error::InitializationFailure { .. }
                | Error::ConflictUnresolvable { .. }
        )
    }
}
