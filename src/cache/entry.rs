//! Cache Entry Types
//!
//! The unit of storage shared by every layer, plus the binary envelope used
//! by the persistent layers.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::compression::CompressionAlgorithm;
use super::layer::LayerId;
use crate::error::{Error, Result};

/// Envelope magic for persisted entries
pub const ENVELOPE_MAGIC: &[u8; 4] = b"LCE1";

/// Tag that marks an entry as the authoritative copy
pub const AUTHORITATIVE_TAG: &str = "authoritative";

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Caller-declared importance of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// High or critical
    pub fn is_high(&self) -> bool {
        *self >= Priority::High
    }

    /// Weight used by the prediction models (0.0 - 1.0)
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Low => 0.0,
            Priority::Normal => 0.33,
            Priority::High => 0.66,
            Priority::Critical => 1.0,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Metadata supplied by the caller on `set`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteMetadata {
    /// MIME type of the payload (`audio/wav`, `audio/midi`, ...)
    pub content_type: String,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Importance
    pub priority: Priority,
}

impl WriteMetadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Per-entry metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Time of the write that produced this version
    pub modified_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    /// FxHash of the stored payload
    pub checksum: u64,
    pub tags: Vec<String>,
    pub priority: Priority,
}

impl EntryMetadata {
    fn fresh(meta: WriteMetadata, checksum: u64, now: DateTime<Utc>) -> Self {
        Self {
            content_type: meta.content_type,
            created_at: now,
            modified_at: now,
            last_accessed: now,
            access_count: 0,
            checksum,
            tags: meta.tags,
            priority: meta.priority,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// How the stored payload was compressed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub algorithm: CompressionAlgorithm,
    /// compressed / original (lower is better)
    pub ratio: f64,
    pub original_size: u64,
}

/// What one layer holds for a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerPresence {
    pub present: bool,
    pub size: u64,
    pub compressed: bool,
    pub sync_version: u64,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl LayerPresence {
    pub fn of(entry: &CacheEntry) -> Self {
        Self {
            present: true,
            size: entry.size,
            compressed: entry.compression_info.is_some(),
            sync_version: entry.sync_version,
            last_accessed: Some(entry.metadata.last_accessed),
        }
    }

    pub fn absent() -> Self {
        Self {
            present: false,
            size: 0,
            compressed: false,
            sync_version: 0,
            last_accessed: None,
        }
    }
}

/// Cache entry containing payload and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Opaque payload bytes (possibly compressed); carried outside the JSON header
    #[serde(skip)]
    payload: Bytes,
    pub metadata: EntryMetadata,
    /// Stored payload size in bytes
    pub size: u64,
    /// Bumped on every accepted write; 0 only for placeholders
    pub sync_version: u64,
    pub compression_info: Option<CompressionInfo>,
    /// Which layers hold a copy; filled in on reads, never persisted
    #[serde(skip)]
    pub layer_presence: HashMap<LayerId, LayerPresence>,
}

impl CacheEntry {
    /// Create a new entry at version 1
    pub fn new(key: impl Into<String>, payload: Bytes, meta: WriteMetadata) -> Self {
        Self::with_version(key, payload, meta, 1, Utc::now())
    }

    /// Create an entry with an explicit version and write time
    pub fn with_version(
        key: impl Into<String>,
        payload: Bytes,
        meta: WriteMetadata,
        sync_version: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let checksum = fx_hash(&payload);
        Self {
            key: key.into(),
            size: payload.len() as u64,
            metadata: EntryMetadata::fresh(meta, checksum, now),
            payload,
            sync_version,
            compression_info: None,
            layer_presence: HashMap::new(),
        }
    }

    /// Empty stand-in used when a conflict carries no entries at all
    pub fn placeholder(key: impl Into<String>) -> Self {
        Self::with_version(key, Bytes::new(), WriteMetadata::default(), 0, Utc::now())
    }

    /// Whether this is a placeholder that must never be written to a layer
    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.sync_version == 0
    }

    /// Payload (zero-copy)
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Replace the payload, refreshing size and checksum
    pub fn set_payload(&mut self, payload: Bytes) {
        self.size = payload.len() as u64;
        self.metadata.checksum = fx_hash(&payload);
        self.payload = payload;
    }

    /// Check the payload against the stored checksum
    pub fn verify_integrity(&self) -> bool {
        fx_hash(&self.payload) == self.metadata.checksum && self.payload.len() as u64 == self.size
    }

    /// Same version, same bytes. Access metadata and presence are ignored.
    pub fn same_content(&self, other: &CacheEntry) -> bool {
        self.sync_version == other.sync_version
            && self.metadata.checksum == other.metadata.checksum
            && self.size == other.size
    }

    /// Tagged as authoritative
    pub fn is_authoritative(&self, tag: &str) -> bool {
        self.metadata.has_tag(tag)
    }

    /// Milliseconds between the writes that produced two copies
    pub fn modified_skew_ms(&self, other: &CacheEntry) -> i64 {
        (self.metadata.modified_at - other.metadata.modified_at)
            .num_milliseconds()
            .abs()
    }

    // =========================================================================
    // Envelope Format
    // =========================================================================

    /// Encode as `magic | u32 header length | JSON header | payload`
    pub fn encode(&self) -> Result<Bytes> {
        let header = serde_json::to_vec(self)?;
        let mut buf = BytesMut::with_capacity(8 + header.len() + self.payload.len());
        buf.put_slice(ENVELOPE_MAGIC);
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode an envelope, verifying the payload checksum
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < 8 || &data[..4] != ENVELOPE_MAGIC {
            return Err(Error::EnvelopeCorrupt("missing magic".into()));
        }
        data.advance(4);
        let header_len = data.get_u32() as usize;
        if data.len() < header_len {
            return Err(Error::EnvelopeCorrupt(format!(
                "header length {} exceeds {} remaining bytes",
                header_len,
                data.len()
            )));
        }
        let header = data.split_to(header_len);
        let mut entry: CacheEntry = serde_json::from_slice(&header)?;
        entry.payload = data;
        if !entry.verify_integrity() {
            return Err(Error::EnvelopeCorrupt(format!(
                "checksum mismatch for key {}",
                entry.key
            )));
        }
        Ok(entry)
    }
}

impl PartialEq for CacheEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.payload == other.payload
            && self.metadata == other.metadata
            && self.size == other.size
            && self.sync_version == other.sync_version
            && self.compression_info == other.compression_info
    }
}

// =============================================================================
// Tests
// =============================================================================
