//! Conflict Detection
//!
//! Classifies how two or more copies of the same key diverge. Checks run in a
//! configurable order; the first one that fires names the conflict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::entry::CacheEntry;
use crate::cache::layer::LayerId;

/// Skew beyond which a timestamp conflict is raised to medium severity
const LARGE_SKEW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Version,
    Timestamp,
    Content,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConflictType::Version => "version",
            ConflictType::Timestamp => "timestamp",
            ConflictType::Content => "content",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    /// Never resolved automatically on the write path
    Critical,
}

/// Detection settings
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRules {
    pub order: Vec<ConflictType>,
    pub timestamp_skew_ms: i64,
}

impl Default for DetectionRules {
    fn default() -> Self {
        Self {
            order: vec![ConflictType::Version, ConflictType::Timestamp, ConflictType::Content],
            timestamp_skew_ms: 1000,
        }
    }
}

impl DetectionRules {
    fn fires(&self, kind: ConflictType, source: &CacheEntry, target: &CacheEntry) -> bool {
        match kind {
            ConflictType::Version => source.sync_version != target.sync_version,
            ConflictType::Timestamp => source.modified_skew_ms(target) > self.timestamp_skew_ms,
            ConflictType::Content => {
                source.size != target.size || source.metadata.checksum != target.metadata.checksum
            }
        }
    }

    /// Classify two copies; `None` when they hold the same content
    pub fn classify(&self, source: &CacheEntry, target: &CacheEntry) -> Option<ConflictType> {
        if source.same_content(target) {
            return None;
        }
        self.order
            .iter()
            .copied()
            .find(|kind| self.fires(*kind, source, target))
            // Copies differ in a way the configured checks skip
            .or(Some(if source.sync_version != target.sync_version {
                ConflictType::Version
            } else {
                ConflictType::Content
            }))
    }
}

/// A detected divergence between copies of one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub conflict_id: Uuid,
    pub conflict_type: ConflictType,
    pub source_layer: LayerId,
    pub target_layer: LayerId,
    pub entry_key: String,
    /// Distinct copies, the source copy first
    pub conflicting_entries: Vec<CacheEntry>,
    /// Layers holding any of the conflicting copies
    pub layers: Vec<LayerId>,
    pub severity: Severity,
    pub auto_resolvable: bool,
    pub detected_at: DateTime<Utc>,
    /// Resolution attempts made so far
    pub attempts: u32,
}

impl ConflictInfo {
    /// Conflict between two copies
    pub fn between(
        rules: &DetectionRules,
        authoritative_tag: &str,
        source: (LayerId, &CacheEntry),
        target: (LayerId, &CacheEntry),
    ) -> Option<Self> {
        let copies = [(source.0, source.1.clone()), (target.0, target.1.clone())];
        Self::among(rules, authoritative_tag, &copies, Some(source.0))
    }

    /// Conflict among every copy held by the layers.
    ///
    /// The source is `preferred` when it holds a copy, otherwise the copy with
    /// the highest version. The target is the first layer whose copy differs
    /// from the source.
    pub fn among(
        rules: &DetectionRules,
        authoritative_tag: &str,
        copies: &[(LayerId, CacheEntry)],
        preferred: Option<LayerId>,
    ) -> Option<Self> {
        let (source_layer, source) = preferred
            .and_then(|p| copies.iter().find(|(l, _)| *l == p))
            .or_else(|| {
                copies.iter().max_by(|(la, a), (lb, b)| {
                    a.sync_version
                        .cmp(&b.sync_version)
                        .then(a.metadata.modified_at.cmp(&b.metadata.modified_at))
                        // Faster layer wins a full tie
                        .then(lb.cmp(la))
                })
            })?;

        let (target_layer, target) = copies
            .iter()
            .find(|(l, e)| l != source_layer && !e.same_content(source))?;
        let conflict_type = rules.classify(source, target)?;

        let mut conflicting_entries = vec![source.clone()];
        for (_, entry) in copies {
            if !conflicting_entries.iter().any(|e| e.same_content(entry)) {
                conflicting_entries.push(entry.clone());
            }
        }
        for entry in &mut conflicting_entries {
            entry.layer_presence.clear();
        }
        let mut layers: Vec<LayerId> = copies.iter().map(|(l, _)| *l).collect();
        layers.sort();
        layers.dedup();

        let severity = severity(conflict_type, source, target, authoritative_tag);
        Some(Self {
            conflict_id: Uuid::new_v4(),
            conflict_type,
            source_layer: *source_layer,
            target_layer: *target_layer,
            entry_key: source.key.clone(),
            conflicting_entries,
            layers,
            severity,
            auto_resolvable: severity < Severity::Critical,
            detected_at: Utc::now(),
            attempts: 0,
        })
    }

    /// Copy held by the source layer, if it was captured
    pub fn source_entry(&self) -> Option<&CacheEntry> {
        self.conflicting_entries.first()
    }

    /// Highest version among the conflicting copies
    pub fn max_version(&self) -> u64 {
        self.conflicting_entries
            .iter()
            .map(|e| e.sync_version)
            .max()
            .unwrap_or(0)
    }
}

fn severity(kind: ConflictType, source: &CacheEntry, target: &CacheEntry, tag: &str) -> Severity {
    match kind {
        ConflictType::Version if source.sync_version >= target.sync_version => Severity::Low,
        ConflictType::Version => Severity::Medium,
        ConflictType::Timestamp if source.modified_skew_ms(target) > LARGE_SKEW_MS => Severity::Medium,
        ConflictType::Timestamp => Severity::Low,
        ConflictType::Content if source.sync_version != target.sync_version => Severity::Medium,
        // Two writers claimed the same version with different bytes
        ConflictType::Content if source.is_authoritative(tag) && target.is_authoritative(tag) => {
            Severity::Critical
        }
        ConflictType::Content => Severity::High,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{WriteMetadata, AUTHORITATIVE_TAG};
    use bytes::Bytes;

    fn copy(payload: &'static [u8], version: u64, offset_ms: i64) -> CacheEntry {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
            + chrono::Duration::milliseconds(offset_ms);
        CacheEntry::with_version("track-1", Bytes::from_static(payload), WriteMetadata::new("audio/wav"), version, at)
    }

    #[test]
    fn test_identical_copies_do_not_conflict() {
        let rules = DetectionRules::default();
        let a = copy(b"same", 3, 0);
        let mut b = a.clone();
        b.metadata.access_count = 9;
        assert!(rules.classify(&a, &b).is_none());
        assert!(ConflictInfo::between(&rules, AUTHORITATIVE_TAG, (LayerId::Volatile, &a), (LayerId::Blob, &b)).is_none());
    }

    #[test]
    fn test_default_order_checks_version_first() {
        let rules = DetectionRules::default();
        // Differs by version, timestamp and content at once
        let a = copy(b"old", 3, 0);
        let b = copy(b"newer", 4, 5000);
        assert_eq!(rules.classify(&a, &b), Some(ConflictType::Version));
        assert_eq!(rules.classify(&copy(b"x", 2, 0), &copy(b"yy", 2, 1500)), Some(ConflictType::Timestamp));
        assert_eq!(rules.classify(&copy(b"x", 2, 0), &copy(b"yy", 2, 500)), Some(ConflictType::Content));
        // Same size, different bytes
        assert_eq!(rules.classify(&copy(b"ab", 2, 0), &copy(b"ba", 2, 0)), Some(ConflictType::Content));
    }

    #[test]
    fn test_custom_detection_order() {
        let rules = DetectionRules {
            order: vec![ConflictType::Content, ConflictType::Version],
            timestamp_skew_ms: 1000,
        };
        let a = copy(b"old", 3, 0);
        let b = copy(b"newer", 4, 5000);
        assert_eq!(rules.classify(&a, &b), Some(ConflictType::Content));

        let only_timestamp = DetectionRules {
            order: vec![ConflictType::Timestamp],
            timestamp_skew_ms: 1000,
        };
        // Nothing configured fires, the copies still differ
        assert_eq!(only_timestamp.classify(&copy(b"a", 1, 0), &copy(b"a", 2, 0)), Some(ConflictType::Version));
    }

    #[test]
    fn test_severity() {
        let rules = DetectionRules::default();
        let newer = copy(b"v4", 4, 0);
        let older = copy(b"v3", 3, 0);

        let c = ConflictInfo::between(&rules, AUTHORITATIVE_TAG, (LayerId::Volatile, &newer), (LayerId::Blob, &older)).unwrap();
        assert_eq!(c.severity, Severity::Low);
        let c = ConflictInfo::between(&rules, AUTHORITATIVE_TAG, (LayerId::Volatile, &older), (LayerId::Blob, &newer)).unwrap();
        assert_eq!(c.severity, Severity::Medium);

        let a = copy(b"ab", 5, 0);
        let b = copy(b"ba", 5, 0);
        let c = ConflictInfo::between(&rules, AUTHORITATIVE_TAG, (LayerId::Volatile, &a), (LayerId::Blob, &b)).unwrap();
        assert_eq!(c.severity, Severity::High);
        assert!(c.auto_resolvable);

        let mut a = a;
        let mut b = b;
        a.metadata.tags.push(AUTHORITATIVE_TAG.into());
        b.metadata.tags.push(AUTHORITATIVE_TAG.into());
        let c = ConflictInfo::between(&rules, AUTHORITATIVE_TAG, (LayerId::Volatile, &a), (LayerId::Blob, &b)).unwrap();
        assert_eq!(c.severity, Severity::Critical);
        assert!(!c.auto_resolvable);
    }

    #[test]
    fn test_among_groups_distinct_copies() {
        let rules = DetectionRules::default();
        let v4 = copy(b"v4", 4, 0);
        let v3 = copy(b"v3", 3, 0);
        let copies = vec![
            (LayerId::Volatile, v3.clone()),
            (LayerId::Structured, v4.clone()),
            (LayerId::Blob, v4.clone()),
        ];
        let c = ConflictInfo::among(&rules, AUTHORITATIVE_TAG, &copies, None).unwrap();
        assert_eq!(c.source_layer, LayerId::Structured);
        assert_eq!(c.target_layer, LayerId::Volatile);
        assert_eq!(c.conflicting_entries.len(), 2);
        assert_eq!(c.conflicting_entries[0].sync_version, 4);
        assert_eq!(c.layers, vec![LayerId::Volatile, LayerId::Structured, LayerId::Blob]);
        assert_eq!(c.max_version(), 4);
        assert_eq!(c.entry_key, "track-1");
    }

    #[test]
    fn test_conflict_type_serde() {
        let json = serde_json::to_string(&ConflictType::Timestamp).unwrap();
        assert_eq!(json, "\"timestamp\"");
        let parsed: Vec<ConflictType> = serde_json::from_str(r#"["content","version"]"#).unwrap();
        assert_eq!(parsed, vec![ConflictType::Content, ConflictType::Version]);
    }
}
