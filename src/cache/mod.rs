//! Multi-Layer Cache
//!
//! Routes entries across three storage layers using access/layer predictions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Manager                                    │
//! │        PredictionEngine · RoutingPolicy · CacheMetrics · History          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                          Layer Registry                                   │
//! │              timeouts · write gate · per-key locks                        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Volatile (RAM)       │ Structured (indexed)  │ Blob (offline)            │
//! │  ┌────────────────┐   │ ┌──────────────────┐  │ ┌────────────────────┐    │
//! │  │ ShardedMap     │   │ │ BTreeMap + tag / │  │ │ BlobStore          │    │
//! │  │                │   │ │ type indexes     │  │ │ (memory / fs)      │    │
//! │  └────────────────┘   │ └──────────────────┘  │ └────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fallback order on a miss is always volatile, structured, blob.

pub mod blob;
pub mod compression;
pub mod entry;
pub mod history;
pub mod layer;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod prediction;
pub mod registry;
pub mod shard;
pub mod structured;
pub mod volatile;

pub use blob::{BlobConfig, BlobLayer, BlobStore, FsBlobStore, InMemoryBlobStore};
pub use compression::{Codec, CompressionAlgorithm, CompressionProfile, Lz4Codec};
pub use entry::{CacheEntry, EntryMetadata, LayerPresence, Priority, WriteMetadata};
pub use history::{OperationHistory, OperationKind, OperationRecord};
pub use layer::{LayerAdapter, LayerId, LayerStats};
pub use manager::{CacheManager, OperationResult};
pub use metrics::{Analytics, CacheMetrics};
pub use policy::RoutingPolicy;
pub use prediction::{ModelParameters, PredictionEngine, TrainedModel};
pub use registry::{GuardedWrite, LayerRegistry};
pub use structured::{StructuredConfig, StructuredLayer};
pub use volatile::{VolatileConfig, VolatileLayer};

/// Number of shards in the volatile layer map
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// Default volatile capacity (256MB)
pub const DEFAULT_VOLATILE_CAPACITY: u64 = 256 * 1024 * 1024;

/// Largest entry held in memory by default (16MB)
pub const DEFAULT_VOLATILE_MAX_ENTRY: u64 = 16 * 1024 * 1024;

/// Default structured capacity (4GB)
pub const DEFAULT_STRUCTURED_CAPACITY: u64 = 4 * 1024 * 1024 * 1024;

/// Largest entry held by the structured layer by default (64MB)
pub const DEFAULT_STRUCTURED_MAX_ENTRY: u64 = 64 * 1024 * 1024;

/// Largest entry held by the blob layer by default (2GB)
pub const DEFAULT_BLOB_MAX_ENTRY: u64 = 2 * 1024 * 1024 * 1024;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        assert!(DEFAULT_SHARD_COUNT.is_power_of_two());
    }

    #[test]
    fn test_default_entry_limits_grow_with_layer() {
        assert!(DEFAULT_VOLATILE_MAX_ENTRY < DEFAULT_STRUCTURED_MAX_ENTRY);
        assert!(DEFAULT_STRUCTURED_MAX_ENTRY < DEFAULT_BLOB_MAX_ENTRY);
        assert!(DEFAULT_VOLATILE_MAX_ENTRY < DEFAULT_VOLATILE_CAPACITY);
    }
}
