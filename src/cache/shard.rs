//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards, each behind its own
//! `RwLock`, so readers of different keys never contend.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single shard containing a hashmap and its byte total
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    size_bytes: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            size_bytes: AtomicU64::new(0),
        }
    }

    /// Number of entries in this shard
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Total size of values in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Copy of every entry
    pub fn entries(&self) -> Vec<(K, V)> {
        let guard = self.map.read();
        guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Sharded map whose values report their own size
pub struct ShardedMap<K, V> {
    shards: Vec<Shard<K, V>>,
    hasher: RandomState,
}

impl<K: Eq + Hash + Clone, V: Clone> ShardedMap<K, V> {
    /// Create a map with `shard_count` shards (rounded up to a power of two)
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..count).map(|_| Shard::new()).collect(),
            hasher: RandomState::new(),
        }
    }

    #[inline]
    fn shard_for<Q>(&self, key: &Q) -> &Shard<K, V>
    where
        Q: Hash + ?Sized,
    {
        let idx = (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1);
        &self.shards[idx]
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get a value
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).map.read().get(key).cloned()
    }

    /// Insert a value of `size` bytes, returning the previous value and its size
    pub fn insert(&self, key: K, value: V, size: u64, size_of: impl Fn(&V) -> u64) -> Option<V> {
        let shard = self.shard_for(&key);
        let mut guard = shard.map.write();
        let old = guard.insert(key, value);
        shard.size_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some(ref old) = old {
            shard.size_bytes.fetch_sub(size_of(old), Ordering::Relaxed);
        }
        old
    }

    /// Remove a value
    pub fn remove<Q>(&self, key: &Q, size_of: impl Fn(&V) -> u64) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let shard = self.shard_for(key);
        let removed = shard.map.write().remove(key);
        if let Some(ref v) = removed {
            shard.size_bytes.fetch_sub(size_of(v), Ordering::Relaxed);
        }
        removed
    }

    /// Total entries across shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Whether every shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across shards
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes()).sum()
    }

    /// Copy of every entry, shard by shard
    pub fn entries(&self) -> Vec<(K, V)> {
        self.shards.iter().flat_map(|s| s.entries()).collect()
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.map.write().clear();
            shard.size_bytes.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
