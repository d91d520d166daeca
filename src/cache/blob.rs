//! Blob Layer - Offline Object Store
//!
//! Slowest, largest layer. Entries are encoded as envelopes and handed to a
//! pluggable `BlobStore` (in memory, local filesystem, or anything that can
//! hold named byte objects).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::entry::{fx_hash, CacheEntry};
use super::layer::{LayerAdapter, LayerId, LayerStats};
use super::DEFAULT_BLOB_MAX_ENTRY;
use crate::error::{Error, Result};

const BLOB_EXTENSION: &str = "blob";

/// Blob store backend trait
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Get an object
    async fn get(&self, name: &str) -> Result<Option<Bytes>>;

    /// Put an object, replacing any previous one atomically
    async fn put(&self, name: &str, data: Bytes) -> Result<()>;

    /// Delete an object, returning whether it existed
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Names of every stored object
    async fn list(&self) -> Result<Vec<String>>;

    /// Get storage statistics
    fn stats(&self) -> BlobStoreStats;
}

/// Blob store statistics
#[derive(Debug, Clone, Default)]
pub struct BlobStoreStats {
    /// Total objects stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
}

/// Blob layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Directory for the filesystem store; `None` keeps objects in memory
    pub root_dir: Option<PathBuf>,
    /// Largest single entry accepted
    pub max_entry_size: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            max_entry_size: DEFAULT_BLOB_MAX_ENTRY,
        }
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory blob store for testing
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: DashMap<String, Bytes>,
    total_bytes: AtomicU64,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.get(name).map(|data| data.clone()))
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some(old) = self.objects.insert(name.to_string(), data) {
            self.total_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        match self.objects.remove(name) {
            Some((_, data)) => {
                self.total_bytes.fetch_sub(data.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.objects.iter().map(|e| e.key().clone()).collect())
    }

    fn stats(&self) -> BlobStoreStats {
        BlobStoreStats {
            object_count: self.objects.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Filesystem Store
// =============================================================================

/// One file per object under a root directory
pub struct FsBlobStore {
    root: PathBuf,
    object_count: AtomicU64,
    total_bytes: AtomicU64,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut count = 0;
        let mut bytes = 0;
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(file) = dir.next_entry().await? {
            if file.path().extension().and_then(|e| e.to_str()) == Some(BLOB_EXTENSION) {
                count += 1;
                bytes += file.metadata().await?.len();
            }
        }

        Ok(Self {
            root,
            object_count: AtomicU64::new(count),
            total_bytes: AtomicU64::new(bytes),
        })
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, BLOB_EXTENSION))
    }

    async fn existing_size(&self, name: &str) -> Option<u64> {
        tokio::fs::metadata(self.path_of(name)).await.ok().map(|m| m.len())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_of(name)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let previous = self.existing_size(name).await;
        let tmp = self.root.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_of(name)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        match previous {
            Some(old) => {
                self.total_bytes.fetch_sub(old, Ordering::Relaxed);
            }
            None => {
                self.object_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let previous = self.existing_size(name).await;
        match tokio::fs::remove_file(self.path_of(name)).await {
            Ok(()) => {
                self.object_count.fetch_sub(1, Ordering::Relaxed);
                self.total_bytes
                    .fetch_sub(previous.unwrap_or(0), Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        Ok(names)
    }

    fn stats(&self) -> BlobStoreStats {
        BlobStoreStats {
            object_count: self.object_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Blob Layer
// =============================================================================

/// Offline layer over a blob store
pub struct BlobLayer {
    store: Arc<dyn BlobStore>,
    max_entry_size: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

impl BlobLayer {
    /// Create a layer over the given store
    pub fn new(store: Arc<dyn BlobStore>, max_entry_size: u64) -> Self {
        Self {
            store,
            max_entry_size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Create with in-memory store (for testing)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBlobStore::new()), DEFAULT_BLOB_MAX_ENTRY)
    }

    /// Open the store named by the configuration
    pub async fn open(config: BlobConfig) -> Result<Self> {
        let store: Arc<dyn BlobStore> = match &config.root_dir {
            Some(root) => {
                let store = FsBlobStore::open(root.clone()).await.map_err(|e| {
                    Error::InitializationFailure {
                        layer: LayerId::Blob,
                        reason: format!("cannot open {}: {}", root.display(), e),
                    }
                })?;
                info!(
                    root = %root.display(),
                    objects = store.stats().object_count,
                    "Blob store opened"
                );
                Arc::new(store)
            }
            None => Arc::new(InMemoryBlobStore::new()),
        };
        Ok(Self::new(store, config.max_entry_size))
    }

    /// Object name for a cache key
    fn object_name(key: &str) -> String {
        format!("{:016x}-{}", fx_hash(key.as_bytes()), key.len())
    }

    fn fail(&self, key: &str, op: &str, e: &Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        debug!(key, op, "blob store failure: {}", e);
    }

    /// Get backend statistics
    pub fn store_stats(&self) -> BlobStoreStats {
        self.store.stats()
    }
}

#[async_trait]
impl LayerAdapter for BlobLayer {
    fn id(&self) -> LayerId {
        LayerId::Blob
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let raw = match self.store.get(&Self::object_name(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.fail(key, "get", &e);
                return None;
            }
        };
        match CacheEntry::decode(raw) {
            Ok(entry) if entry.key == key => Some(entry),
            Ok(entry) => {
                warn!(key, stored = %entry.key, "blob object name collision");
                None
            }
            Err(e) => {
                self.fail(key, "decode", &e);
                None
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> bool {
        if entry.size > self.max_entry_size {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut stored = entry.clone();
        stored.key = key.to_string();
        let encoded = match stored.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.fail(key, "encode", &e);
                return false;
            }
        };
        match self.store.put(&Self::object_name(key), encoded).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.fail(key, "put", &e);
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        match self.store.delete(&Self::object_name(key)).await {
            Ok(_) => true,
            Err(e) => {
                self.fail(key, "delete", &e);
                false
            }
        }
    }

    async fn list_all(&self) -> HashMap<String, CacheEntry> {
        let names = match self.store.list().await {
            Ok(names) => names,
            Err(e) => {
                self.fail("*", "list", &e);
                return HashMap::new();
            }
        };

        let mut entries = HashMap::with_capacity(names.len());
        for name in names {
            match self.store.get(&name).await {
                Ok(Some(raw)) => match CacheEntry::decode(raw) {
                    Ok(entry) => {
                        entries.insert(entry.key.clone(), entry);
                    }
                    Err(e) => warn!(object = %name, "Skipping unreadable blob: {}", e),
                },
                // Deleted between list and get
                Ok(None) => {}
                Err(e) => self.fail(&name, "list-get", &e),
            }
        }
        entries
    }

    fn max_entry_size(&self) -> u64 {
        self.max_entry_size
    }

    fn stats(&self) -> LayerStats {
        let store = self.store.stats();
        LayerStats {
            entries: store.object_count,
            size_bytes: store.total_bytes,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::WriteMetadata;

    fn make_entry(key: &str, data: &[u8]) -> CacheEntry {
        CacheEntry::new(key, Bytes::copy_from_slice(data), WriteMetadata::new("audio/wav"))
    }

    #[tokio::test]
    async fn test_in_memory_store_stats() {
        let store = InMemoryBlobStore::new();
        store.put("a", Bytes::from_static(b"data1")).await.unwrap();
        store.put("b", Bytes::from_static(b"data2")).await.unwrap();
        store.put("b", Bytes::from_static(b"xy")).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());

        let stats = store.stats();
        assert_eq!(stats.object_count, 1);
        assert_eq!(stats.total_bytes, 2);
    }

    #[tokio::test]
    async fn test_blob_layer_roundtrip() {
        let layer = BlobLayer::in_memory();
        let entry = make_entry("stems/bass.wav", &[9u8; 2048]);

        assert!(layer.set("stems/bass.wav", &entry).await);
        assert_eq!(layer.get("stems/bass.wav").await.unwrap(), entry);
        assert!(layer.get("stems/drums.wav").await.is_none());

        let all = layer.list_all().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("stems/bass.wav"));

        assert!(layer.delete("stems/bass.wav").await);
        assert!(layer.delete("stems/bass.wav").await);
        assert!(layer.get("stems/bass.wav").await.is_none());
    }

    #[tokio::test]
    async fn test_blob_layer_skips_corrupt_objects() {
        let store = Arc::new(InMemoryBlobStore::new());
        store
            .put(&BlobLayer::object_name("k"), Bytes::from_static(b"garbage"))
            .await
            .unwrap();
        let layer = BlobLayer::new(store, DEFAULT_BLOB_MAX_ENTRY);

        assert!(layer.get("k").await.is_none());
        assert!(layer.list_all().await.is_empty());
        assert_eq!(layer.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_fs_store_survives_reopen() {
        let root = std::env::temp_dir().join(format!("layercast-blob-{}", uuid::Uuid::new_v4()));
        let config = BlobConfig {
            root_dir: Some(root.clone()),
            ..Default::default()
        };

        let layer = BlobLayer::open(config.clone()).await.unwrap();
        let entry = make_entry("mix.opus", b"compressed audio");
        assert!(layer.set("mix.opus", &entry).await);
        drop(layer);

        let reopened = BlobLayer::open(config).await.unwrap();
        assert_eq!(reopened.get("mix.opus").await.unwrap(), entry);
        assert_eq!(reopened.store_stats().object_count, 1);

        let _ = std::fs::remove_dir_all(root);
    }
}
