//! Structured Layer - Persistent Indexed Store
//!
//! Persistent layer keeping one envelope file per entry plus in-memory
//! primary and secondary indexes (by tag, by content type). Without a root
//! directory it runs purely in memory, which is what most tests use.
//!
//! # Design
//!
//! - Writes go to a temporary file that is renamed into place, so each entry
//!   on disk is either the old or the new version, never a mix
//! - The index is only updated after the file is in place
//! - Each key owns a uniquely named file, recorded in the index; the key
//!   itself is read back from the envelope on open
//! - Capacity is reserved under the index lock before the file is written
//! - Corrupt files found at open are skipped and logged

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::layer::{LayerAdapter, LayerId, LayerStats};
use super::{DEFAULT_STRUCTURED_CAPACITY, DEFAULT_STRUCTURED_MAX_ENTRY};
use crate::error::{Error, Result};

const ENTRY_EXTENSION: &str = "lce";

/// Structured layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredConfig {
    /// Directory holding entry files; `None` keeps everything in memory
    pub root_dir: Option<PathBuf>,
    /// Maximum capacity in bytes
    pub capacity: u64,
    /// Largest single entry accepted
    pub max_entry_size: u64,
}

impl Default for StructuredConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            capacity: DEFAULT_STRUCTURED_CAPACITY,
            max_entry_size: DEFAULT_STRUCTURED_MAX_ENTRY,
        }
    }
}

#[derive(Default)]
struct Indexes {
    primary: BTreeMap<String, CacheEntry>,
    by_tag: HashMap<String, BTreeSet<String>>,
    by_content_type: HashMap<String, BTreeSet<String>>,
    /// Entry file of each key, when persistent
    files: HashMap<String, PathBuf>,
    size_bytes: u64,
    /// Bytes promised to writes whose file is not in place yet
    reserved: u64,
}

impl Indexes {
    fn insert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);
        for tag in &entry.metadata.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        self.by_content_type
            .entry(entry.metadata.content_type.clone())
            .or_default()
            .insert(entry.key.clone());
        self.size_bytes += entry.size;
        self.primary.insert(entry.key.clone(), entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let old = self.primary.remove(key)?;
        for tag in &old.metadata.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        if let Some(keys) = self.by_content_type.get_mut(&old.metadata.content_type) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_content_type.remove(&old.metadata.content_type);
            }
        }
        self.size_bytes -= old.size;
        Some(old)
    }

    fn file_for(&mut self, root: &Path, key: &str) -> PathBuf {
        self.files
            .entry(key.to_string())
            .or_insert_with(|| root.join(format!("{}.{}", uuid::Uuid::new_v4().simple(), ENTRY_EXTENSION)))
            .clone()
    }
}

/// Persistent structured layer
pub struct StructuredLayer {
    config: StructuredConfig,
    indexes: RwLock<Indexes>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

impl StructuredLayer {
    /// In-memory structured layer
    pub fn in_memory() -> Self {
        Self::empty(StructuredConfig::default())
    }

    fn empty(config: StructuredConfig) -> Self {
        Self {
            config,
            indexes: RwLock::new(Indexes::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Open the layer, loading any entries already on disk
    pub async fn open(config: StructuredConfig) -> Result<Self> {
        let layer = Self::empty(config);
        let Some(root) = layer.config.root_dir.clone() else {
            return Ok(layer);
        };

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::InitializationFailure {
                layer: LayerId::Structured,
                reason: format!("cannot create {}: {}", root.display(), e),
            })?;

        let mut dir = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| Error::InitializationFailure {
                layer: LayerId::Structured,
                reason: format!("cannot read {}: {}", root.display(), e),
            })?;

        let mut loaded = 0usize;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            match tokio::fs::read(&path).await.map_err(Error::from).and_then(|raw| CacheEntry::decode(Bytes::from(raw))) {
                Ok(entry) => {
                    // Two files for one key: keep the newer, drop the other
                    let superseded = {
                        let mut indexes = layer.indexes.write();
                        match indexes.primary.get(&entry.key) {
                            Some(current) if current.sync_version >= entry.sync_version => Some(path.clone()),
                            _ => {
                                let previous = indexes.files.insert(entry.key.clone(), path.clone());
                                if previous.is_none() {
                                    loaded += 1;
                                }
                                indexes.insert(entry);
                                previous
                            }
                        }
                    };
                    if let Some(stale) = superseded {
                        warn!("Removing duplicate entry file {}", stale.display());
                        if let Err(e) = tokio::fs::remove_file(&stale).await {
                            warn!("Cannot remove {}: {}", stale.display(), e);
                        }
                    }
                }
                Err(e) => warn!("Skipping unreadable entry file {}: {}", path.display(), e),
            }
        }

        info!(loaded, root = %root.display(), "Structured layer opened");
        Ok(layer)
    }

    async fn persist(&self, root: &Path, target: &Path, entry: &CacheEntry) -> Result<()> {
        let encoded = entry.encode()?;
        let tmp = root.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &encoded).await?;
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn unpersist(&self, path: Option<&Path>) -> Result<()> {
        let Some(path) = path else {
            return Ok(());
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys carrying a tag
    pub fn keys_with_tag(&self, tag: &str) -> Vec<String> {
        self.indexes
            .read()
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys of a content type
    pub fn keys_with_content_type(&self, content_type: &str) -> Vec<String> {
        self.indexes
            .read()
            .by_content_type
            .get(content_type)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.indexes.read().primary.len()
    }

    /// Check if the layer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LayerAdapter for StructuredLayer {
    fn id(&self) -> LayerId {
        LayerId::Structured
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.indexes.read().primary.get(key).cloned()
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> bool {
        if entry.size > self.config.max_entry_size {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let target = {
            let mut indexes = self.indexes.write();
            let replaced = indexes.primary.get(key).map(|e| e.size).unwrap_or(0);
            if (indexes.size_bytes - replaced) + indexes.reserved + entry.size > self.config.capacity {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(key, "structured layer full");
                return false;
            }
            indexes.reserved += entry.size;
            self.config
                .root_dir
                .as_deref()
                .map(|root| (root.to_path_buf(), indexes.file_for(root, key)))
        };

        let persisted = match &target {
            Some((root, path)) => self.persist(root, path, entry).await,
            None => Ok(()),
        };

        let mut stored = entry.clone();
        stored.key = key.to_string();
        stored.layer_presence.clear();
        let mut indexes = self.indexes.write();
        indexes.reserved -= entry.size;
        if let Err(e) = persisted {
            self.failures.fetch_add(1, Ordering::Relaxed);
            debug!(key, "structured write failed: {}", e);
            return false;
        }
        indexes.insert(stored);
        drop(indexes);
        self.writes.fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn delete(&self, key: &str) -> bool {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let path = self.indexes.read().files.get(key).cloned();
        if let Err(e) = self.unpersist(path.as_deref()).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            debug!(key, "structured delete failed: {}", e);
            return false;
        }
        let mut indexes = self.indexes.write();
        indexes.remove(key);
        indexes.files.remove(key);
        true
    }

    async fn list_all(&self) -> HashMap<String, CacheEntry> {
        self.indexes
            .read()
            .primary
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn max_entry_size(&self) -> u64 {
        self.config.max_entry_size
    }

    fn stats(&self) -> LayerStats {
        let indexes = self.indexes.read();
        LayerStats {
            entries: indexes.primary.len() as u64,
            size_bytes: indexes.size_bytes,
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
