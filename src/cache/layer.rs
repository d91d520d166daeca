//! Layer Adapter Contract
//!
//! Uniform get/set/delete/list contract over one physical storage medium.
//!
//! Adapters never return errors across this boundary: I/O failures become
//! `false` / `None` so that one unavailable layer degrades the cache instead
//! of aborting it. Each adapter does its own internal locking and may be
//! called concurrently.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;

/// Identifier of a physical storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerId {
    /// Fast volatile memory
    Volatile,
    /// Persistent structured store with secondary indexes
    Structured,
    /// Persistent blob / offline store
    Blob,
}

impl LayerId {
    /// All layers in fallback order (fastest to slowest)
    pub const ALL: [LayerId; 3] = [LayerId::Volatile, LayerId::Structured, LayerId::Blob];

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            LayerId::Volatile => "volatile",
            LayerId::Structured => "structured",
            LayerId::Blob => "blob",
        }
    }

    /// Position in the fallback order (0 = fastest)
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            LayerId::Volatile => 0,
            LayerId::Structured => 1,
            LayerId::Blob => 2,
        }
    }

    /// Whether the layer survives process restarts
    pub fn is_persistent(&self) -> bool {
        !matches!(self, LayerId::Volatile)
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for LayerId {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "volatile" | "memory" => Ok(LayerId::Volatile),
            "structured" | "indexed" => Ok(LayerId::Structured),
            "blob" | "offline" => Ok(LayerId::Blob),
            other => Err(crate::error::Error::Config(format!(
                "unknown layer '{}'",
                other
            ))),
        }
    }
}

/// Layer statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerStats {
    /// Number of entries held
    pub entries: u64,
    /// Bytes held
    pub size_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
    /// Failed operations (converted to false/None)
    pub failures: u64,
    /// Entries evicted for capacity
    pub evictions: u64,
}

/// Uniform contract over one storage medium
#[async_trait]
pub trait LayerAdapter: Send + Sync {
    /// Which layer this adapter serves
    fn id(&self) -> LayerId;

    /// Fetch an entry; `None` on miss or failure
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Store an entry atomically; `false` if it was not stored
    async fn set(&self, key: &str, entry: &CacheEntry) -> bool;

    /// Remove an entry; `true` once the key is absent (including already absent)
    async fn delete(&self, key: &str) -> bool;

    /// Every entry currently held
    async fn list_all(&self) -> HashMap<String, CacheEntry>;

    /// Whether the medium is currently reachable
    fn is_available(&self) -> bool {
        true
    }

    /// Largest entry the layer accepts
    fn max_entry_size(&self) -> u64 {
        u64::MAX
    }

    /// Current statistics
    fn stats(&self) -> LayerStats;
}

// =============================================================================
// Tests
// =============================================================================
