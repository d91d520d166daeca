//! Layer Registry
//!
//! The set of opened layers shared by the cache manager, the sync engine and
//! the optimizer. Every adapter call made by those components goes through
//! here, which gives them three things:
//!
//! - an explicit timeout on each call (expiry is `Error::Timeout`, never a hang)
//! - a write gate that `close_writes` shuts; once it returns no adapter
//!   write or delete is in flight and none will start
//! - per-key async locks that serialize writers of the same key
//!
//! Readers never take a key lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::entry::CacheEntry;
use super::layer::{LayerAdapter, LayerId};
use crate::error::{Error, Result};

/// Result of a version-checked write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedWrite {
    /// The entry was stored
    Written,
    /// The target already holds the same content
    AlreadyCurrent,
    /// The target holds a strictly newer version
    SkippedNewer,
    /// The adapter refused the entry
    Rejected,
}

impl GuardedWrite {
    /// Whether the target now holds the entry's content (or newer)
    pub fn is_settled(&self) -> bool {
        !matches!(self, GuardedWrite::Rejected)
    }
}

/// Opened layers plus the coordination state around them
pub struct LayerRegistry {
    /// Sorted in fallback order
    layers: Vec<Arc<dyn LayerAdapter>>,
    call_timeout: Duration,
    gate: RwLock<()>,
    closed: AtomicBool,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("layers", &self.ids())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl LayerRegistry {
    /// Build a registry; at least one layer is required and ids must be unique
    pub fn new(mut layers: Vec<Arc<dyn LayerAdapter>>, call_timeout: Duration) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::Config("at least one cache layer is required".into()));
        }
        layers.sort_by_key(|l| l.id());
        if layers.windows(2).any(|w| w[0].id() == w[1].id()) {
            return Err(Error::Config("duplicate cache layer".into()));
        }
        Ok(Self {
            layers,
            call_timeout,
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
            key_locks: DashMap::new(),
        })
    }

    /// Layer ids in fallback order
    pub fn ids(&self) -> Vec<LayerId> {
        self.layers.iter().map(|l| l.id()).collect()
    }

    /// Whether a layer is registered
    pub fn contains(&self, id: LayerId) -> bool {
        self.layer(id).is_some()
    }

    /// Adapter for a layer
    pub fn layer(&self, id: LayerId) -> Option<&Arc<dyn LayerAdapter>> {
        self.layers.iter().find(|l| l.id() == id)
    }

    /// All adapters in fallback order
    pub fn layers(&self) -> &[Arc<dyn LayerAdapter>] {
        &self.layers
    }

    /// Per-call timeout
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn available(&self, id: LayerId) -> Result<&Arc<dyn LayerAdapter>> {
        match self.layer(id) {
            Some(layer) if layer.is_available() => Ok(layer),
            _ => Err(Error::LayerUnavailable { layer: id }),
        }
    }

    async fn timed<T>(&self, operation: String, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                operation,
                after_ms: self.call_timeout.as_millis() as u64,
            })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch a key from one layer
    pub async fn fetch(&self, id: LayerId, key: &str) -> Result<Option<CacheEntry>> {
        let layer = self.available(id)?;
        self.timed(format!("{} get", id), layer.get(key)).await
    }

    /// Snapshot of every entry in one layer.
    ///
    /// Listing a whole layer gets its own budget instead of the per-call one.
    pub async fn snapshot(&self, id: LayerId, budget: Duration) -> Result<HashMap<String, CacheEntry>> {
        let layer = self.available(id)?;
        tokio::time::timeout(budget, layer.list_all())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{} list", id),
                after_ms: budget.as_millis() as u64,
            })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store an entry in one layer; `Ok(false)` when the adapter refused it
    pub async fn store(&self, id: LayerId, key: &str, entry: &CacheEntry) -> Result<bool> {
        let _open = self.gate.read().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        let layer = self.available(id)?;
        self.timed(format!("{} set", id), layer.set(key, entry)).await
    }

    /// Remove a key from one layer; `Ok(true)` once it is absent
    pub async fn remove(&self, id: LayerId, key: &str) -> Result<bool> {
        let _open = self.gate.read().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        let layer = self.available(id)?;
        self.timed(format!("{} delete", id), layer.delete(key)).await
    }

    /// Store unless the target already holds the same or a newer version.
    ///
    /// The caller must hold the key lock.
    pub async fn store_if_not_newer(
        &self,
        id: LayerId,
        key: &str,
        entry: &CacheEntry,
    ) -> Result<GuardedWrite> {
        if let Some(current) = self.fetch(id, key).await? {
            if current.sync_version > entry.sync_version {
                return Ok(GuardedWrite::SkippedNewer);
            }
            if current.same_content(entry) {
                return Ok(GuardedWrite::AlreadyCurrent);
            }
        }
        Ok(if self.store(id, key, entry).await? {
            GuardedWrite::Written
        } else {
            GuardedWrite::Rejected
        })
    }

    // =========================================================================
    // Coordination
    // =========================================================================

    /// Acquire the write lock of one key
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop key locks nobody holds or waits on; returns how many were dropped
    pub fn prune_locks(&self) -> usize {
        let before = self.key_locks.len();
        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.key_locks.len())
    }

    /// Number of key locks currently tracked
    pub fn lock_count(&self) -> usize {
        self.key_locks.len()
    }

    /// Refuse new writes and wait for in-flight ones to finish
    pub async fn close_writes(&self) {
        self.closed.store(true, Ordering::Release);
        let _drained = self.gate.write().await;
    }

    /// Whether writes have been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tests
// =============================================================================
