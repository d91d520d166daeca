//! Synchronization State
//!
//! Arena of per-key records owned by one `SyncEngine`. The engine keeps it
//! behind a synchronous mutex that is never held across an await point.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::conflict::ConflictInfo;
use crate::cache::entry::{CacheEntry, LayerPresence};
use crate::cache::layer::LayerId;

/// Per-key synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySyncState {
    Consistent,
    PendingSync,
    Conflicted,
    Resolving,
}

impl KeySyncState {
    /// Whether `self → next` is a legal transition.
    ///
    /// A new write may move a key to `PendingSync` from any state.
    pub fn can_transition(self, next: KeySyncState) -> bool {
        use KeySyncState::*;
        matches!(
            (self, next),
            (_, PendingSync)
                | (PendingSync, Consistent)
                | (PendingSync, Conflicted)
                | (Consistent, Conflicted)
                | (Conflicted, Resolving)
                | (Resolving, Consistent)
                | (Resolving, Conflicted)
                | (Consistent, Consistent)
        )
    }
}

/// Health of one layer as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum LayerStatus {
    Healthy,
    /// Recent calls failed or timed out
    Degraded(String),
    /// Could not be opened; not part of the registry
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOpStatus {
    Pending,
    Completed,
    Failed,
}

/// A sync obligation from one layer to another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub operation_id: Uuid,
    pub key: String,
    pub source_layer: LayerId,
    pub target_layer: LayerId,
    /// Version written by the operation that created this obligation
    pub sync_version: u64,
    pub status: SyncOpStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Failed attempts so far
    pub attempts: u32,
}

impl SyncOperation {
    pub fn new(key: impl Into<String>, source_layer: LayerId, target_layer: LayerId, sync_version: u64) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            key: key.into(),
            source_layer,
            target_layer,
            sync_version,
            status: SyncOpStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn complete(&mut self) {
        self.status = SyncOpStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = SyncOpStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(reason.into());
    }
}

/// Logical deletion waiting for every layer to confirm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub version: u64,
    /// Layers that have not confirmed the delete yet
    pub pending: BTreeSet<LayerId>,
    pub created_at: DateTime<Utc>,
}

/// Copies older than `version` that some layers still have to drop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Version of the write that superseded the copies
    pub version: u64,
    /// Layers that may still serve an older copy
    pub pending: BTreeSet<LayerId>,
    pub created_at: DateTime<Utc>,
}

/// Everything the engine tracks about one key
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub state: KeySyncState,
    /// Highest version handed out or observed
    pub known_version: u64,
    pub presence: BTreeMap<LayerId, LayerPresence>,
    pub pending: Vec<SyncOperation>,
}

impl Default for KeyRecord {
    fn default() -> Self {
        Self {
            state: KeySyncState::Consistent,
            known_version: 0,
            presence: BTreeMap::new(),
            pending: Vec::new(),
        }
    }
}

/// Process-wide synchronization state of one engine
#[derive(Debug)]
pub struct SyncState {
    pub is_active: bool,
    pub last_full_sync: Option<DateTime<Utc>>,
    /// Number of completed full syncs
    pub sync_version: u64,
    pub layer_states: BTreeMap<LayerId, LayerStatus>,
    pub conflict_queue: VecDeque<ConflictInfo>,
    pub keys: HashMap<String, KeyRecord>,
    pub tombstones: HashMap<String, Tombstone>,
    pub invalidations: HashMap<String, Invalidation>,
    /// Retired operations and conflicts, newest last
    pub completed_ops: VecDeque<SyncOperation>,
    pub archive: VecDeque<ConflictInfo>,
    archive_capacity: usize,
}

impl SyncState {
    pub fn new(layers: &[LayerId], archive_capacity: usize) -> Self {
        Self {
            is_active: true,
            last_full_sync: None,
            sync_version: 0,
            layer_states: layers.iter().map(|l| (*l, LayerStatus::Healthy)).collect(),
            conflict_queue: VecDeque::new(),
            keys: HashMap::new(),
            tombstones: HashMap::new(),
            invalidations: HashMap::new(),
            completed_ops: VecDeque::new(),
            archive: VecDeque::new(),
            archive_capacity: archive_capacity.max(1),
        }
    }

    /// Move a key to a new state; illegal transitions are logged and ignored
    pub fn transition(&mut self, key: &str, next: KeySyncState) -> bool {
        let record = self.keys.entry(key.to_string()).or_default();
        if record.state.can_transition(next) {
            record.state = next;
            true
        } else {
            warn!(key, from = ?record.state, to = ?next, "Ignoring illegal sync state transition");
            false
        }
    }

    /// Mark a key conflicted unless it already is
    pub fn mark_conflicted(&mut self, key: &str) {
        if self.key_state(key) != KeySyncState::Conflicted {
            self.transition(key, KeySyncState::Conflicted);
        }
    }

    /// Mark a key as being resolved
    pub fn mark_resolving(&mut self, key: &str) {
        self.mark_conflicted(key);
        self.transition(key, KeySyncState::Resolving);
    }

    /// Walk a key back to `Consistent`
    pub fn settle(&mut self, key: &str) {
        if self.key_state(key) == KeySyncState::Conflicted {
            self.transition(key, KeySyncState::Resolving);
        }
        self.transition(key, KeySyncState::Consistent);
    }

    pub fn key_state(&self, key: &str) -> KeySyncState {
        self.keys
            .get(key)
            .map(|r| r.state)
            .unwrap_or(KeySyncState::Consistent)
    }

    /// Next version for a write. `observed` is the highest version seen in
    /// any layer by the caller.
    pub fn next_version(&mut self, key: &str, observed: u64) -> u64 {
        let tombstone = self.tombstones.get(key).map(|t| t.version).unwrap_or(0);
        let record = self.keys.entry(key.to_string()).or_default();
        let next = record.known_version.max(observed).max(tombstone) + 1;
        record.known_version = next;
        next
    }

    /// Raise the known version to at least `version`
    pub fn observe_version(&mut self, key: &str, version: u64) {
        let record = self.keys.entry(key.to_string()).or_default();
        record.known_version = record.known_version.max(version);
    }

    pub fn knows(&self, key: &str) -> bool {
        self.keys.get(key).map(|r| r.known_version > 0).unwrap_or(false)
            || self.tombstones.contains_key(key)
    }

    pub fn set_presence(&mut self, key: &str, layer: LayerId, entry: &CacheEntry) {
        self.keys
            .entry(key.to_string())
            .or_default()
            .presence
            .insert(layer, LayerPresence::of(entry));
    }

    pub fn clear_presence(&mut self, key: &str, layer: LayerId) {
        if let Some(record) = self.keys.get_mut(key) {
            record.presence.remove(&layer);
        }
    }

    pub fn presence(&self, key: &str) -> BTreeMap<LayerId, LayerPresence> {
        self.keys
            .get(key)
            .map(|r| r.presence.clone())
            .unwrap_or_default()
    }

    /// Queue a sync obligation and move the key to `PendingSync`
    pub fn push_pending(&mut self, op: SyncOperation) {
        let key = op.key.clone();
        let record = self.keys.entry(key.clone()).or_default();
        // A newer obligation for the same pair replaces an older one
        record
            .pending
            .retain(|p| !(p.source_layer == op.source_layer && p.target_layer == op.target_layer));
        record.pending.push(op);
        self.transition(&key, KeySyncState::PendingSync);
    }

    /// Keys with pending obligations, up to `limit`, in a stable order
    pub fn pending_keys(&self, limit: usize) -> Vec<String> {
        let mut keys: Vec<&String> = self
            .keys
            .iter()
            .filter(|(_, r)| !r.pending.is_empty())
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys.into_iter().take(limit).cloned().collect()
    }

    pub fn take_pending(&mut self, key: &str) -> Vec<SyncOperation> {
        self.keys
            .get_mut(key)
            .map(|r| std::mem::take(&mut r.pending))
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.keys.values().map(|r| r.pending.len()).sum()
    }

    pub fn retire_op(&mut self, op: SyncOperation) {
        if self.completed_ops.len() >= self.archive_capacity {
            self.completed_ops.pop_front();
        }
        self.completed_ops.push_back(op);
    }

    /// Record that `layers` may hold copies older than `version`
    pub fn invalidate(&mut self, key: &str, version: u64, layers: BTreeSet<LayerId>) {
        if layers.is_empty() {
            return;
        }
        let entry = self
            .invalidations
            .entry(key.to_string())
            .or_insert_with(|| Invalidation {
                version,
                pending: BTreeSet::new(),
                created_at: Utc::now(),
            });
        entry.version = entry.version.max(version);
        entry.pending.extend(layers);
    }

    /// `layer` now holds `held` (`None` when absent); clears its
    /// invalidation once nothing older than the superseding write is left
    pub fn satisfy_invalidation(&mut self, key: &str, layer: LayerId, held: Option<u64>) {
        let Some(invalidation) = self.invalidations.get_mut(key) else {
            return;
        };
        if held.map_or(true, |v| v >= invalidation.version) {
            invalidation.pending.remove(&layer);
        }
        if invalidation.pending.is_empty() {
            self.invalidations.remove(key);
        }
    }

    /// Version a copy in `layer` must reach to survive a failed invalidation
    pub fn invalidated_below(&self, key: &str, layer: LayerId) -> u64 {
        self.invalidations
            .get(key)
            .filter(|i| i.pending.contains(&layer))
            .map(|i| i.version)
            .unwrap_or(0)
    }

    /// Version below which a copy of `key` in `layer` is known to be stale.
    ///
    /// Covers copies left behind by a failed invalidation and targets whose
    /// write is still pending.
    pub fn superseded_below(&self, key: &str, layer: LayerId) -> u64 {
        let invalidated = self.invalidated_below(key, layer);
        let pending = self
            .keys
            .get(key)
            .map(|r| {
                r.pending
                    .iter()
                    .filter(|op| op.target_layer == layer)
                    .map(|op| op.sync_version)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        invalidated.max(pending)
    }

    pub fn archive_conflict(&mut self, conflict: ConflictInfo) {
        if self.archive.len() >= self.archive_capacity {
            self.archive.pop_front();
        }
        self.archive.push_back(conflict);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use KeySyncState::*;
        assert!(Consistent.can_transition(PendingSync));
        assert!(PendingSync.can_transition(Conflicted));
        assert!(Conflicted.can_transition(Resolving));
        assert!(Resolving.can_transition(Consistent));
        assert!(Resolving.can_transition(Conflicted));
        assert!(Resolving.can_transition(PendingSync));

        assert!(!Consistent.can_transition(Resolving));
        assert!(!Conflicted.can_transition(Consistent));
        assert!(!PendingSync.can_transition(Resolving));
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut state = SyncState::new(&LayerId::ALL, 10);
        assert!(!state.transition("k", KeySyncState::Resolving));
        assert_eq!(state.key_state("k"), KeySyncState::Consistent);
        assert!(state.transition("k", KeySyncState::Conflicted));
        assert!(state.transition("k", KeySyncState::Resolving));
        assert_eq!(state.key_state("k"), KeySyncState::Resolving);
    }

    #[test]
    fn test_next_version_is_monotonic() {
        let mut state = SyncState::new(&LayerId::ALL, 10);
        assert_eq!(state.next_version("k", 0), 1);
        assert_eq!(state.next_version("k", 0), 2);
        // Layers hold something newer than we knew about
        assert_eq!(state.next_version("k", 7), 8);
        state.tombstones.insert(
            "k".into(),
            Tombstone {
                version: 20,
                pending: BTreeSet::new(),
                created_at: Utc::now(),
            },
        );
        assert_eq!(state.next_version("k", 0), 21);
        state.observe_version("k", 5);
        assert_eq!(state.next_version("k", 0), 22);
    }

    #[test]
    fn test_pending_ops_replace_same_pair() {
        let mut state = SyncState::new(&LayerId::ALL, 10);
        state.push_pending(SyncOperation::new("k", LayerId::Volatile, LayerId::Blob, 1));
        state.push_pending(SyncOperation::new("k", LayerId::Volatile, LayerId::Blob, 2));
        state.push_pending(SyncOperation::new("k", LayerId::Volatile, LayerId::Structured, 2));
        assert_eq!(state.pending_count(), 2);
        assert_eq!(state.key_state("k"), KeySyncState::PendingSync);
        assert_eq!(state.pending_keys(10), vec!["k".to_string()]);

        let ops = state.take_pending("k");
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.sync_version == 2));
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn test_invalidation_until_layer_catches_up() {
        let mut state = SyncState::new(&LayerId::ALL, 10);
        state.invalidate("k", 2, BTreeSet::from([LayerId::Structured, LayerId::Blob]));
        state.invalidate("k", 3, BTreeSet::from([LayerId::Blob]));
        assert_eq!(state.superseded_below("k", LayerId::Structured), 3);
        assert_eq!(state.superseded_below("k", LayerId::Volatile), 0);

        // Still holding an older copy
        state.satisfy_invalidation("k", LayerId::Blob, Some(2));
        assert!(state.invalidations["k"].pending.contains(&LayerId::Blob));

        state.satisfy_invalidation("k", LayerId::Blob, None);
        state.satisfy_invalidation("k", LayerId::Structured, Some(3));
        assert!(state.invalidations.is_empty());
        assert_eq!(state.superseded_below("k", LayerId::Structured), 0);
    }

    #[test]
    fn test_pending_write_supersedes_target_copy() {
        let mut state = SyncState::new(&LayerId::ALL, 10);
        state.push_pending(SyncOperation::new("k", LayerId::Volatile, LayerId::Blob, 4));
        assert_eq!(state.superseded_below("k", LayerId::Blob), 4);
        assert_eq!(state.superseded_below("k", LayerId::Volatile), 0);
    }

    #[test]
    fn test_archive_is_bounded() {
        let mut state = SyncState::new(&LayerId::ALL, 2);
        for v in 0..5 {
            let mut op = SyncOperation::new("k", LayerId::Volatile, LayerId::Blob, v);
            op.complete();
            state.retire_op(op);
        }
        assert_eq!(state.completed_ops.len(), 2);
        assert_eq!(state.completed_ops.back().unwrap().sync_version, 4);
    }
}
