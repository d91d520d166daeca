//! Volatile Layer - RAM-based Hot Store
//!
//! Lowest-latency layer on a sharded hashmap. Contents are lost on restart.
//!
//! # Design
//!
//! - `ShardedMap` for minimal lock contention
//! - Recency/frequency eviction between configurable high/low watermarks
//! - Hit bookkeeping lives beside the entry so reads never alter what was stored

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::CacheEntry;
use super::layer::{LayerAdapter, LayerId, LayerStats};
use super::shard::ShardedMap;
use super::{DEFAULT_SHARD_COUNT, DEFAULT_VOLATILE_CAPACITY, DEFAULT_VOLATILE_MAX_ENTRY};

/// Volatile layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatileConfig {
    /// Maximum capacity in bytes
    pub capacity: u64,
    /// Largest single entry accepted
    pub max_entry_size: u64,
    /// High watermark fraction (trigger eviction)
    pub high_watermark: f64,
    /// Low watermark fraction (stop eviction)
    pub low_watermark: f64,
    /// Maximum entries evicted per pass
    pub eviction_batch_size: usize,
    /// Number of map shards
    pub shard_count: usize,
}

impl Default for VolatileConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_VOLATILE_CAPACITY,
            max_entry_size: DEFAULT_VOLATILE_MAX_ENTRY,
            high_watermark: 0.90, // Start eviction at 90%
            low_watermark: 0.80,  // Stop eviction at 80%
            eviction_batch_size: 1000,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    hits: AtomicU64,
    last_hit_ms: AtomicU64,
}

/// RAM-based hot layer
pub struct VolatileLayer {
    storage: ShardedMap<String, Arc<Slot>>,
    config: VolatileConfig,
    epoch: Instant,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
}

fn slot_size(slot: &Arc<Slot>) -> u64 {
    slot.entry.size
}

impl VolatileLayer {
    /// Create a new volatile layer with default configuration
    pub fn new() -> Self {
        Self::with_config(VolatileConfig::default())
    }

    /// Create a new volatile layer with custom configuration
    pub fn with_config(config: VolatileConfig) -> Self {
        Self {
            storage: ShardedMap::new(config.shard_count),
            config,
            epoch: Instant::now(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.storage.size_bytes()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if the layer is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Utilization fraction
    pub fn utilization(&self) -> f64 {
        self.size() as f64 / self.config.capacity as f64
    }

    fn should_evict(&self, incoming: u64) -> bool {
        let projected = (self.size() + incoming) as f64;
        projected / self.config.capacity as f64 >= self.config.high_watermark
    }

    /// Evict entries until the low watermark is reached
    fn evict(&self) {
        let now = self.now_ms();
        let mut candidates: Vec<(String, f64)> = self
            .storage
            .entries()
            .into_iter()
            .map(|(key, slot)| {
                let age = now.saturating_sub(slot.last_hit_ms.load(Ordering::Relaxed)) as f64;
                let frequency = slot.hits.load(Ordering::Relaxed) as f64;
                // Higher age = more evictable, higher frequency = less evictable
                (key, (age + 1.0) / (frequency + 1.0))
            })
            .collect();

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let low = self.config.low_watermark * self.config.capacity as f64;
        let mut evicted = 0;
        for (key, _) in candidates {
            if (self.size() as f64) <= low || evicted >= self.config.eviction_batch_size {
                break;
            }
            if self.storage.remove(key.as_str(), slot_size).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }
        debug!(evicted, size = self.size(), "volatile layer eviction pass");
    }

    /// Clear the layer
    pub fn clear(&self) {
        self.storage.clear();
    }
}

impl Default for VolatileLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LayerAdapter for VolatileLayer {
    fn id(&self) -> LayerId {
        LayerId::Volatile
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let slot = self.storage.get(key)?;
        slot.hits.fetch_add(1, Ordering::Relaxed);
        slot.last_hit_ms.store(self.now_ms(), Ordering::Relaxed);
        Some(slot.entry.clone())
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> bool {
        let size = entry.size;
        if size > self.config.max_entry_size || size > self.config.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if self.should_evict(size) {
            self.evict();
        }

        let slot = Arc::new(Slot {
            entry: entry.clone(),
            hits: AtomicU64::new(0),
            last_hit_ms: AtomicU64::new(self.now_ms()),
        });
        self.storage.insert(key.to_string(), slot, size, slot_size);
        self.writes.fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn delete(&self, key: &str) -> bool {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.storage.remove(key, slot_size);
        true
    }

    async fn list_all(&self) -> HashMap<String, CacheEntry> {
        self.storage
            .entries()
            .into_iter()
            .map(|(key, slot)| (key, slot.entry.clone()))
            .collect()
    }

    fn max_entry_size(&self) -> u64 {
        self.config.max_entry_size
    }

    fn stats(&self) -> LayerStats {
        LayerStats {
            entries: self.len() as u64,
            size_bytes: self.size(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.rejected.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
