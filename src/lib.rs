//! Layercast - Multi-Layer Asset Cache
//!
//! A cache for streamed audio/MIDI assets spread over three storage layers
//! (volatile memory, an indexed structured store, a blob/offline store),
//! with prediction-driven placement and cross-layer synchronization.
//!
//! # Architecture
//!
//! ```text
//! CacheManager (get/set/delete) → LayerRegistry → Layer Adapters
//!        │                              ▲
//!        └──── SyncEngine (conflicts) ──┘
//!                    ▲
//!            OptimizationLoop (tick)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Layers, prediction, routing and the cache manager
//! - [`config`] - Configuration tree
//! - [`domain`] - Ports for external collaborators
//! - [`error`] - Error types
//! - [`optimizer`] - Periodic optimization loop
//! - [`sync`] - Cross-layer synchronization and conflict resolution

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod optimizer;
pub mod sync;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheManager, LayerAdapter, LayerId, OperationResult, Priority, WriteMetadata};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use optimizer::OptimizationLoop;
pub use sync::{ConflictInfo, ResolutionStrategy, SyncEngine, SyncResult};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
