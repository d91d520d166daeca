//! Conflict Resolution
//!
//! `ConflictResolver::resolve` is total: every conflict, including one that
//! captured no copies at all, yields an entry. Low-confidence fallbacks are
//! logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::conflict::{ConflictInfo, ConflictType};
use crate::cache::entry::CacheEntry;
use crate::cache::layer::LayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Latest modification time wins
    LastWriteWins,
    /// Highest sync version wins
    HighestVersionWins,
    /// Latest payload, merged access metadata
    MergeChanges,
    /// Copy tagged authoritative wins
    ServerWins,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::HighestVersionWins => "highest_version_wins",
            ResolutionStrategy::MergeChanges => "merge_changes",
            ResolutionStrategy::ServerWins => "server_wins",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "last_write_wins" | "lww" => Ok(ResolutionStrategy::LastWriteWins),
            "highest_version_wins" | "hvw" => Ok(ResolutionStrategy::HighestVersionWins),
            "merge_changes" | "merge" => Ok(ResolutionStrategy::MergeChanges),
            "server_wins" => Ok(ResolutionStrategy::ServerWins),
            other => Err(crate::error::Error::Config(format!(
                "unknown resolution strategy '{}'",
                other
            ))),
        }
    }
}

/// Default strategy per conflict type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTable {
    pub timestamp: ResolutionStrategy,
    pub version: ResolutionStrategy,
    /// `merge_changes` or `server_wins`
    pub content: ResolutionStrategy,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            timestamp: ResolutionStrategy::LastWriteWins,
            version: ResolutionStrategy::HighestVersionWins,
            content: ResolutionStrategy::MergeChanges,
        }
    }
}

impl StrategyTable {
    pub fn for_type(&self, kind: ConflictType) -> ResolutionStrategy {
        match kind {
            ConflictType::Timestamp => self.timestamp,
            ConflictType::Version => self.version,
            ConflictType::Content => self.content,
        }
    }
}

/// Resolver output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub method: ResolutionStrategy,
    pub resolved_entry: CacheEntry,
    pub reason: String,
    pub confidence: f64,
}

/// Outcome of `resolve_conflict`.
///
/// `success` is always true: a resolution exists for every conflict. Whether
/// it reached the layers is reported separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolutionResult {
    pub success: bool,
    pub conflict_id: Uuid,
    pub key: String,
    pub resolution: Resolution,
    /// Written back to every affected layer
    pub applied: bool,
    pub applied_layers: Vec<LayerId>,
    pub failed_layers: Vec<LayerId>,
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    authoritative_tag: String,
}

impl ConflictResolver {
    pub fn new(authoritative_tag: impl Into<String>) -> Self {
        Self {
            authoritative_tag: authoritative_tag.into(),
        }
    }

    /// Resolve a conflict.
    ///
    /// `fallback` is used when the conflict carries no copies; without one the
    /// result is a placeholder that must not be written back.
    pub fn resolve(
        &self,
        conflict: &ConflictInfo,
        strategy: ResolutionStrategy,
        fallback: Option<&CacheEntry>,
    ) -> Resolution {
        let entries: Vec<&CacheEntry> = conflict
            .conflicting_entries
            .iter()
            .filter(|e| !e.is_placeholder())
            .collect();

        match entries.as_slice() {
            [] => match fallback {
                Some(entry) => {
                    warn!(key = %conflict.entry_key, "Conflict has no copies, using source entry");
                    Resolution {
                        method: strategy,
                        resolved_entry: detached(entry),
                        reason: "no conflicting entries captured; kept source entry".into(),
                        confidence: 0.65,
                    }
                }
                None => {
                    warn!(key = %conflict.entry_key, "Conflict has no copies and no source entry");
                    Resolution {
                        method: strategy,
                        resolved_entry: CacheEntry::placeholder(conflict.entry_key.clone()),
                        reason: "no entries available; placeholder".into(),
                        confidence: 0.6,
                    }
                }
            },
            [only] => Resolution {
                method: strategy,
                resolved_entry: detached(only),
                reason: "single copy".into(),
                confidence: 0.7,
            },
            _ => self.choose(strategy, &entries),
        }
    }

    fn choose(&self, strategy: ResolutionStrategy, entries: &[&CacheEntry]) -> Resolution {
        let max_version = entries.iter().map(|e| e.sync_version).max().unwrap_or(0);
        match strategy {
            ResolutionStrategy::LastWriteWins => {
                let winner = latest_write(entries);
                Resolution {
                    method: strategy,
                    resolved_entry: selected(winner, max_version),
                    reason: format!("latest write at {}", winner.metadata.modified_at),
                    confidence: 0.9,
                }
            }
            ResolutionStrategy::HighestVersionWins => {
                let winner = highest_version(entries);
                Resolution {
                    method: strategy,
                    resolved_entry: selected(winner, max_version),
                    reason: format!("highest version {}", winner.sync_version),
                    confidence: 0.95,
                }
            }
            ResolutionStrategy::MergeChanges => Resolution {
                method: strategy,
                resolved_entry: merge(entries, max_version + 1),
                reason: format!("merged {} copies", entries.len()),
                confidence: 0.8,
            },
            ResolutionStrategy::ServerWins => {
                let authoritative: Vec<&CacheEntry> = entries
                    .iter()
                    .copied()
                    .filter(|e| e.is_authoritative(&self.authoritative_tag))
                    .collect();
                if authoritative.is_empty() {
                    let winner = highest_version(entries);
                    warn!(
                        key = %winner.key,
                        tag = %self.authoritative_tag,
                        "No authoritative copy, falling back to highest version"
                    );
                    Resolution {
                        method: strategy,
                        resolved_entry: selected(winner, max_version),
                        reason: "no authoritative copy; highest version kept".into(),
                        confidence: 0.6,
                    }
                } else {
                    let winner = highest_version(&authoritative);
                    Resolution {
                        method: strategy,
                        resolved_entry: selected(winner, max_version),
                        reason: format!("authoritative copy at version {}", winner.sync_version),
                        confidence: 0.9,
                    }
                }
            }
        }
    }
}

fn detached(entry: &CacheEntry) -> CacheEntry {
    let mut entry = entry.clone();
    entry.layer_presence.clear();
    entry
}

/// The winner, lifted to the highest version so it supersedes every copy
fn selected(winner: &CacheEntry, max_version: u64) -> CacheEntry {
    let mut entry = detached(winner);
    entry.sync_version = max_version;
    entry
}

fn write_order(a: &CacheEntry, b: &CacheEntry) -> std::cmp::Ordering {
    a.metadata
        .modified_at
        .cmp(&b.metadata.modified_at)
        .then(a.sync_version.cmp(&b.sync_version))
        .then(a.metadata.checksum.cmp(&b.metadata.checksum))
}

fn latest_write<'a>(entries: &[&'a CacheEntry]) -> &'a CacheEntry {
    entries
        .iter()
        .copied()
        .max_by(|a, b| write_order(a, b))
        .unwrap_or(entries[0])
}

fn highest_version<'a>(entries: &[&'a CacheEntry]) -> &'a CacheEntry {
    entries
        .iter()
        .copied()
        .max_by(|a, b| a.sync_version.cmp(&b.sync_version).then_with(|| write_order(a, b)))
        .unwrap_or(entries[0])
}

fn merge(entries: &[&CacheEntry], version: u64) -> CacheEntry {
    let mut merged = detached(latest_write(entries));
    let meta = &mut merged.metadata;
    meta.access_count = entries.iter().map(|e| e.metadata.access_count).sum();
    meta.last_accessed = max_time(entries.iter().map(|e| e.metadata.last_accessed), meta.last_accessed);
    meta.created_at = entries
        .iter()
        .map(|e| e.metadata.created_at)
        .min()
        .unwrap_or(meta.created_at);
    meta.priority = entries
        .iter()
        .map(|e| e.metadata.priority)
        .max()
        .unwrap_or(meta.priority);
    for entry in entries {
        for tag in &entry.metadata.tags {
            if !meta.tags.contains(tag) {
                meta.tags.push(tag.clone());
            }
        }
    }
    merged.sync_version = version;
    merged
}

fn max_time(times: impl Iterator<Item = DateTime<Utc>>, default: DateTime<Utc>) -> DateTime<Utc> {
    times.max().unwrap_or(default)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{Priority, WriteMetadata, AUTHORITATIVE_TAG};
    use crate::sync::conflict::{DetectionRules, Severity};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn at(offset_ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + chrono::Duration::milliseconds(offset_ms)
    }

    fn copy(payload: &str, version: u64, offset_ms: i64) -> CacheEntry {
        CacheEntry::with_version(
            "track-2",
            Bytes::from(payload.to_string()),
            WriteMetadata::new("audio/midi"),
            version,
            at(offset_ms),
        )
    }

    fn conflict_of(entries: Vec<CacheEntry>) -> ConflictInfo {
        ConflictInfo {
            conflict_id: Uuid::new_v4(),
            conflict_type: ConflictType::Content,
            source_layer: LayerId::Volatile,
            target_layer: LayerId::Blob,
            entry_key: "track-2".into(),
            conflicting_entries: entries,
            layers: vec![LayerId::Volatile, LayerId::Blob],
            severity: Severity::High,
            auto_resolvable: true,
            detected_at: Utc::now(),
            attempts: 0,
        }
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(AUTHORITATIVE_TAG)
    }

    #[test]
    fn test_highest_version_wins() {
        let conflict = conflict_of(vec![copy("v3", 3, 5000), copy("v4", 4, 0)]);
        let r = resolver().resolve(&conflict, ResolutionStrategy::HighestVersionWins, None);
        assert_eq!(r.resolved_entry.sync_version, 4);
        assert_eq!(r.resolved_entry.payload().as_ref(), b"v4");
        assert_eq!(r.confidence, 0.95);
    }

    #[test]
    fn test_last_write_wins_lifts_version() {
        let conflict = conflict_of(vec![copy("late", 3, 5000), copy("early", 4, 0)]);
        let r = resolver().resolve(&conflict, ResolutionStrategy::LastWriteWins, None);
        assert_eq!(r.resolved_entry.payload().as_ref(), b"late");
        // Never below a copy already in a layer
        assert_eq!(r.resolved_entry.sync_version, 4);
        assert_eq!(r.confidence, 0.9);
    }

    #[test]
    fn test_merge_changes() {
        let mut a = copy("old", 2, 0);
        a.metadata.access_count = 3;
        a.metadata.tags = vec!["drums".into()];
        a.metadata.priority = Priority::High;
        let mut b = copy("new", 2, 2000);
        b.metadata.access_count = 4;
        b.metadata.tags = vec!["loop".into()];
        b.metadata.created_at = at(1000);

        let r = resolver().resolve(&conflict_of(vec![a, b]), ResolutionStrategy::MergeChanges, None);
        let merged = r.resolved_entry;
        assert_eq!(merged.payload().as_ref(), b"new");
        assert_eq!(merged.metadata.access_count, 7);
        assert_eq!(merged.metadata.created_at, at(0));
        assert_eq!(merged.metadata.priority, Priority::High);
        assert_eq!(merged.metadata.tags, vec!["loop".to_string(), "drums".to_string()]);
        assert_eq!(merged.sync_version, 3);
        assert!(merged.verify_integrity());
        assert_eq!(r.confidence, 0.8);
    }

    #[test]
    fn test_server_wins() {
        let plain = copy("edge", 5, 9000);
        let mut server = copy("origin", 4, 0);
        server.metadata.tags.push(AUTHORITATIVE_TAG.into());

        let r = resolver().resolve(&conflict_of(vec![plain.clone(), server]), ResolutionStrategy::ServerWins, None);
        assert_eq!(r.resolved_entry.payload().as_ref(), b"origin");
        assert_eq!(r.resolved_entry.sync_version, 5);
        assert_eq!(r.confidence, 0.9);

        let r = resolver().resolve(&conflict_of(vec![plain, copy("x", 1, 0)]), ResolutionStrategy::ServerWins, None);
        assert_eq!(r.resolved_entry.payload().as_ref(), b"edge");
        assert_eq!(r.confidence, 0.6);
    }

    #[test]
    fn test_degenerate_conflicts() {
        let empty = conflict_of(vec![]);
        let r = resolver().resolve(&empty, ResolutionStrategy::MergeChanges, None);
        assert!(r.resolved_entry.is_placeholder());
        assert_eq!(r.resolved_entry.key, "track-2");
        assert_eq!(r.confidence, 0.6);

        let source = copy("source", 7, 0);
        let r = resolver().resolve(&empty, ResolutionStrategy::MergeChanges, Some(&source));
        assert_eq!(r.resolved_entry, source);
        assert_eq!(r.confidence, 0.65);

        let r = resolver().resolve(&conflict_of(vec![source.clone()]), ResolutionStrategy::LastWriteWins, None);
        assert_eq!(r.resolved_entry, source);
        assert_eq!(r.confidence, 0.7);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("merge-changes".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::MergeChanges);
        assert_eq!("LWW".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::LastWriteWins);
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_strategy_table_defaults() {
        let table = StrategyTable::default();
        assert_eq!(table.for_type(ConflictType::Timestamp), ResolutionStrategy::LastWriteWins);
        assert_eq!(table.for_type(ConflictType::Version), ResolutionStrategy::HighestVersionWins);
        assert_eq!(table.for_type(ConflictType::Content), ResolutionStrategy::MergeChanges);

        let yaml = "content: server_wins\n";
        let table: StrategyTable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.content, ResolutionStrategy::ServerWins);
        assert_eq!(table.version, ResolutionStrategy::HighestVersionWins);
    }

    #[test]
    fn test_detected_conflict_resolves_to_newest() {
        let rules = DetectionRules::default();
        let v3 = copy("three", 3, 0);
        let v4 = copy("four", 4, 100);
        let conflict = ConflictInfo::between(&rules, AUTHORITATIVE_TAG, (LayerId::Volatile, &v3), (LayerId::Blob, &v4)).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Version);
        let r = resolver().resolve(&conflict, StrategyTable::default().for_type(conflict.conflict_type), None);
        assert_eq!(r.resolved_entry.sync_version, 4);
        assert_eq!(r.resolved_entry.payload().as_ref(), b"four");
    }

    fn strategy() -> impl Strategy<Value = ResolutionStrategy> {
        prop_oneof![
            Just(ResolutionStrategy::LastWriteWins),
            Just(ResolutionStrategy::HighestVersionWins),
            Just(ResolutionStrategy::MergeChanges),
            Just(ResolutionStrategy::ServerWins),
        ]
    }

    proptest! {
        #[test]
        fn prop_resolution_is_total_and_never_regresses(
            copies in prop::collection::vec((any::<u8>(), 1u64..50, 0i64..100_000, any::<bool>()), 0..6),
            strategy in strategy(),
        ) {
            let entries: Vec<CacheEntry> = copies
                .iter()
                .map(|(b, v, t, auth)| {
                    let mut e = copy(&format!("{}", b), *v, *t);
                    if *auth {
                        e.metadata.tags.push(AUTHORITATIVE_TAG.into());
                    }
                    e
                })
                .collect();
            let max_version = entries.iter().map(|e| e.sync_version).max();
            let r = resolver().resolve(&conflict_of(entries), strategy, None);

            prop_assert!((0.6..=0.95).contains(&r.confidence));
            prop_assert_eq!(r.resolved_entry.key.as_str(), "track-2");
            match max_version {
                Some(max) => prop_assert!(r.resolved_entry.sync_version >= max),
                None => prop_assert!(r.resolved_entry.is_placeholder()),
            }
        }
    }
}
