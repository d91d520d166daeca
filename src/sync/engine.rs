//! Synchronization Engine
//!
//! Owns the per-key sync state and reconciles copies across layers:
//! pending obligations from multi-layer writes, explicit `synchronize`
//! calls, full sweeps and the deferred conflict queue all funnel into one
//! reconcile step that runs under the key's write lock.
//!
//! Every write the engine issues is version-checked, and every multi-step
//! operation checks cancellation and its deadline before each write.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::conflict::{ConflictInfo, DetectionRules};
use super::resolver::{ConflictResolutionResult, ConflictResolver, Resolution, ResolutionStrategy};
use super::state::{Invalidation, KeySyncState, LayerStatus, SyncOperation, SyncState, Tombstone};
use super::{FullSyncOptions, SyncConfig, SyncOptions, SyncResult};
use crate::cache::entry::{CacheEntry, LayerPresence};
use crate::cache::layer::LayerId;
use crate::cache::registry::{GuardedWrite, LayerRegistry};
use crate::error::{Error, Result};

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    sync_operations: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    writes_applied: AtomicU64,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub sync_operations: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub writes_applied: u64,
    pub conflicts_queued: usize,
    pub pending_operations: usize,
    pub tombstones: usize,
    pub invalidations: usize,
    pub full_syncs: u64,
    pub last_full_sync: Option<DateTime<Utc>>,
}

// =============================================================================
// Reconcile plumbing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    Deadline,
}

impl std::fmt::Display for Halt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Halt::Cancelled => write!(f, "cancelled before write"),
            Halt::Deadline => write!(f, "deadline exceeded before write"),
        }
    }
}

/// Conditions under which a multi-step operation stops issuing adapter calls
struct Stop<'a> {
    tokens: Vec<&'a CancellationToken>,
    deadline: Option<Instant>,
}

impl Stop<'_> {
    fn check(&self) -> Option<Halt> {
        if self.tokens.iter().any(|t| t.is_cancelled()) {
            Some(Halt::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Halt::Deadline)
        } else {
            None
        }
    }
}

/// What to reconcile for one key
struct Plan<'a> {
    key: &'a str,
    /// Layers whose copies are compared
    layers: Vec<LayerId>,
    /// Source copy, when one is known
    preferred: Option<LayerId>,
    /// Fail when the preferred layer holds no copy
    require_source: bool,
    /// Layers that receive the winner when they hold no copy
    populate: Vec<LayerId>,
    strategy: Option<ResolutionStrategy>,
    /// Resolve even conflicts that are not auto-resolvable
    force: bool,
    prior_attempts: u32,
}

#[derive(Debug, Default)]
struct Applied {
    settled: Vec<LayerId>,
    failed: Vec<(LayerId, String)>,
    writes: usize,
    halted: Option<Halt>,
}

#[derive(Debug, Default)]
struct KeyOutcome {
    conflict: Option<ConflictInfo>,
    synced: Vec<LayerId>,
    failed: Vec<(LayerId, String)>,
    writes: usize,
    halted: Option<Halt>,
    queued: bool,
}

impl KeyOutcome {
    fn failed_on(&self, layer: LayerId) -> Option<&str> {
        self.failed
            .iter()
            .find(|(l, _)| *l == layer)
            .map(|(_, reason)| reason.as_str())
    }

    fn absorb_into(self, key: &str, result: &mut SyncResult) {
        for layer in self.synced {
            result.synced(layer);
        }
        for (layer, reason) in self.failed {
            result.fail(Some(layer), format!("{} on {}: {}", key, layer, reason));
        }
        result.writes_applied += self.writes;
        if let Some(conflict) = self.conflict {
            result.conflicts.push(conflict);
        }
        if self.halted == Some(Halt::Cancelled) {
            result.cancelled = true;
        }
    }
}

/// Clears the single-flight flag on every exit path
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

pub struct SyncEngine {
    config: SyncConfig,
    rules: DetectionRules,
    resolver: ConflictResolver,
    registry: Arc<LayerRegistry>,
    state: Mutex<SyncState>,
    counters: Counters,
    cancel: CancellationToken,
    full_sync_running: AtomicBool,
    disposed: AtomicBool,
    tasks: TaskTracker,
}

impl SyncEngine {
    pub fn new(registry: Arc<LayerRegistry>, config: SyncConfig) -> Self {
        let state = SyncState::new(&registry.ids(), config.archive_capacity);
        Self {
            rules: config.detection_rules(),
            resolver: ConflictResolver::new(config.authoritative_tag.clone()),
            config,
            registry,
            state: Mutex::new(state),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            full_sync_running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    /// Root cancellation token; cancelled by `dispose`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Layer health
    // =========================================================================

    /// Record a layer that could not be opened
    pub fn mark_failed(&self, layer: LayerId, reason: impl Into<String>) {
        self.state
            .lock()
            .layer_states
            .insert(layer, LayerStatus::Failed(reason.into()));
    }

    pub fn layer_states(&self) -> BTreeMap<LayerId, LayerStatus> {
        self.state.lock().layer_states.clone()
    }

    fn note_layer_error(&self, layer: LayerId, err: &Error) {
        if err.is_degradation() {
            warn!(layer = %layer, error = %err, "Layer degraded");
            self.state
                .lock()
                .layer_states
                .insert(layer, LayerStatus::Degraded(err.to_string()));
        }
    }

    fn note_layer_ok(state: &mut SyncState, layers: &[LayerId]) {
        for layer in layers {
            if let Some(status) = state.layer_states.get_mut(layer) {
                if matches!(status, LayerStatus::Degraded(_)) {
                    *status = LayerStatus::Healthy;
                }
            }
        }
    }

    // =========================================================================
    // Versions, presence and write registration
    // =========================================================================

    /// Whether the engine has seen the key
    pub fn knows(&self, key: &str) -> bool {
        self.state.lock().knows(key)
    }

    /// Version for the next write of `key`
    pub fn next_version(&self, key: &str, observed: u64) -> u64 {
        self.state.lock().next_version(key, observed)
    }

    pub fn key_state(&self, key: &str) -> KeySyncState {
        self.state.lock().key_state(key)
    }

    /// Layers known to hold a copy of `key`
    pub fn presence(&self, key: &str) -> HashMap<LayerId, LayerPresence> {
        self.state.lock().presence(key).into_iter().collect()
    }

    pub fn record_presence(&self, key: &str, layer: LayerId, entry: &CacheEntry) {
        self.state.lock().set_presence(key, layer, entry);
    }

    pub fn record_absence(&self, key: &str, layer: LayerId) {
        self.state.lock().clear_presence(key, layer);
    }

    /// Hand a multi-layer write to the engine.
    ///
    /// One obligation is queued per (source, target) pair, including targets
    /// whose write failed.
    pub fn register_write(&self, entry: &CacheEntry, source: LayerId, written: &[LayerId], failed: &[LayerId]) {
        let key = entry.key.as_str();
        let mut state = self.state.lock();
        state.tombstones.remove(key);
        state.observe_version(key, entry.sync_version);
        for layer in written {
            state.set_presence(key, *layer, entry);
            state.satisfy_invalidation(key, *layer, Some(entry.sync_version));
        }
        state.transition(key, KeySyncState::PendingSync);

        let mut queued = 0u64;
        for target in written.iter().chain(failed).filter(|l| **l != source) {
            state.push_pending(SyncOperation::new(key, source, *target, entry.sync_version));
            queued += 1;
        }
        if queued == 0 {
            state.settle(key);
        }
        Self::note_layer_ok(&mut state, written);
        self.counters.sync_operations.fetch_add(queued, Ordering::Relaxed);
    }

    // =========================================================================
    // Tombstones
    // =========================================================================

    pub fn is_tombstoned(&self, key: &str) -> bool {
        self.state.lock().tombstones.contains_key(key)
    }

    pub fn tombstone(&self, key: &str) -> Option<Tombstone> {
        self.state.lock().tombstones.get(key).cloned()
    }

    /// Record a delete at `version`; `pending` layers have not confirmed it.
    ///
    /// Obligations for the key are dropped. Without pending layers nothing is
    /// kept.
    pub fn register_delete(&self, key: &str, version: u64, pending: BTreeSet<LayerId>) {
        let mut state = self.state.lock();
        for mut op in state.take_pending(key) {
            op.fail("superseded by delete");
            state.retire_op(op);
        }
        for layer in LayerId::ALL {
            if !pending.contains(&layer) {
                state.clear_presence(key, layer);
            }
        }
        state.observe_version(key, version);
        state.settle(key);
        state.invalidations.remove(key);
        if pending.is_empty() {
            state.tombstones.remove(key);
        } else {
            debug!(key, pending = ?pending, "Delete pending on unreachable layers");
            state.tombstones.insert(
                key.to_string(),
                Tombstone {
                    version,
                    pending,
                    created_at: Utc::now(),
                },
            );
        }
    }

    /// Retry deletes that some layer has not confirmed; returns how many
    /// tombstones were purged
    pub async fn retry_pending_deletes(&self) -> usize {
        let keys: Vec<String> = self.state.lock().tombstones.keys().cloned().collect();
        let mut purged = 0;
        for key in keys {
            if self.cancel.is_cancelled() {
                break;
            }
            let _guard = self.registry.lock_key(&key).await;
            if self.retry_delete_locked(&key).await {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(purged, "Purged tombstones");
        }
        purged
    }

    /// Caller holds the key lock; true when the tombstone was purged
    async fn retry_delete_locked(&self, key: &str) -> bool {
        let Some(pending) = self.state.lock().tombstones.get(key).map(|t| t.pending.clone()) else {
            return false;
        };
        let mut confirmed = Vec::new();
        for layer in pending {
            match self.registry.remove(layer, key).await {
                Ok(true) => confirmed.push(layer),
                Ok(false) => debug!(key, layer = %layer, "Delete still refused"),
                Err(err) => debug!(key, layer = %layer, error = %err, "Delete still unreachable"),
            }
        }

        let mut state = self.state.lock();
        for layer in &confirmed {
            state.clear_presence(key, *layer);
        }
        let done = match state.tombstones.get_mut(key) {
            Some(tombstone) => {
                for layer in &confirmed {
                    tombstone.pending.remove(layer);
                }
                tombstone.pending.is_empty()
            }
            None => false,
        };
        if done {
            state.tombstones.remove(key);
        }
        done
    }

    // =========================================================================
    // Invalidations
    // =========================================================================

    /// Record that `layers` could not drop their copies of `key` older than
    /// `version`. Those copies are never served and are removed by the
    /// background pass.
    pub fn register_invalidation(&self, key: &str, version: u64, layers: BTreeSet<LayerId>) {
        if layers.is_empty() {
            return;
        }
        debug!(key, version, layers = ?layers, "Invalidation pending on unreachable layers");
        self.state.lock().invalidate(key, version, layers);
    }

    pub fn invalidation(&self, key: &str) -> Option<Invalidation> {
        self.state.lock().invalidations.get(key).cloned()
    }

    /// True when a copy of `key` at `version` in `layer` has been superseded by
    /// a write the layer never received
    pub fn is_superseded(&self, key: &str, layer: LayerId, version: u64) -> bool {
        version < self.state.lock().superseded_below(key, layer)
    }

    /// Retry removals of superseded copies; returns how many keys are clean
    pub async fn retry_invalidations(&self) -> usize {
        let keys: Vec<String> = self.state.lock().invalidations.keys().cloned().collect();
        let mut cleared = 0;
        for key in keys {
            if self.cancel.is_cancelled() {
                break;
            }
            let _guard = self.registry.lock_key(&key).await;
            if self.retry_invalidation_locked(&key).await {
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(cleared, "Cleared invalidations");
        }
        cleared
    }

    /// Caller holds the key lock; true when no layer is left to clean
    async fn retry_invalidation_locked(&self, key: &str) -> bool {
        let Some(Invalidation { version, pending, .. }) = self.invalidation(key) else {
            return false;
        };
        let mut held = Vec::new();
        for layer in pending {
            match self.registry.fetch(layer, key).await {
                Ok(None) => held.push((layer, None)),
                Ok(Some(copy)) if copy.sync_version >= version => held.push((layer, Some(copy.sync_version))),
                Ok(Some(_)) => match self.registry.remove(layer, key).await {
                    Ok(true) => held.push((layer, None)),
                    Ok(false) => debug!(key, layer = %layer, "Superseded copy still refused removal"),
                    Err(err) => debug!(key, layer = %layer, error = %err, "Superseded copy still unreachable"),
                },
                Err(err) => debug!(key, layer = %layer, error = %err, "Superseded copy still unreachable"),
            }
        }

        let mut state = self.state.lock();
        for (layer, version) in held {
            if version.is_none() {
                state.clear_presence(key, layer);
            }
            state.satisfy_invalidation(key, layer, version);
        }
        !state.invalidations.contains_key(key)
    }

    // =========================================================================
    // Promotion
    // =========================================================================

    /// Copy an entry found in a slower layer into `target`.
    ///
    /// Skipped when the key has been deleted or written past the entry's
    /// version since it was read.
    pub async fn promote(&self, entry: &CacheEntry, target: LayerId) -> Result<GuardedWrite> {
        let key = entry.key.as_str();
        let _guard = self.registry.lock_key(key).await;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                operation: format!("promotion of {}", key),
            });
        }
        {
            let state = self.state.lock();
            let known = state.keys.get(key).map(|r| r.known_version).unwrap_or(0);
            if state.tombstones.contains_key(key) || known > entry.sync_version {
                return Ok(GuardedWrite::SkippedNewer);
            }
        }
        let outcome = self.registry.store_if_not_newer(target, key, entry).await?;
        if outcome == GuardedWrite::Written {
            self.counters.writes_applied.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(outcome, GuardedWrite::Written | GuardedWrite::AlreadyCurrent) {
            self.state.lock().set_presence(key, target, entry);
        }
        Ok(outcome)
    }

    // =========================================================================
    // Core reconcile step
    // =========================================================================

    fn fits(&self, layer: LayerId, size: u64) -> bool {
        self.registry
            .layer(layer)
            .map(|l| size <= l.max_entry_size())
            .unwrap_or(false)
    }

    /// Write `entry` to each layer, version-checked
    async fn apply(&self, key: &str, entry: &CacheEntry, layers: &[LayerId], stop: &Stop<'_>) -> Applied {
        let mut applied = Applied::default();
        for &layer in layers {
            if let Some(halt) = stop.check() {
                applied.halted = Some(halt);
                applied.failed.push((layer, halt.to_string()));
                continue;
            }
            if !self.fits(layer, entry.size) {
                applied
                    .failed
                    .push((layer, format!("entry of {} bytes exceeds the layer limit", entry.size)));
                continue;
            }
            match self.registry.store_if_not_newer(layer, key, entry).await {
                Ok(GuardedWrite::Written) => {
                    applied.writes += 1;
                    applied.settled.push(layer);
                }
                Ok(GuardedWrite::AlreadyCurrent) => applied.settled.push(layer),
                Ok(GuardedWrite::SkippedNewer) => {
                    applied.failed.push((layer, "layer holds a newer version".into()))
                }
                Ok(GuardedWrite::Rejected) => applied.failed.push((layer, "write rejected".into())),
                Err(err) => {
                    self.note_layer_error(layer, &err);
                    applied.failed.push((layer, err.to_string()));
                }
            }
        }
        self.counters
            .writes_applied
            .fetch_add(applied.writes as u64, Ordering::Relaxed);
        let mut state = self.state.lock();
        for layer in &applied.settled {
            state.set_presence(key, *layer, entry);
            state.satisfy_invalidation(key, *layer, Some(entry.sync_version));
        }
        Self::note_layer_ok(&mut state, &applied.settled);
        applied
    }

    /// Bump the version of a resolution that produced a new value
    fn finalize_version(&self, key: &str, resolution: &mut Resolution, max_copy_version: u64) {
        let mut state = self.state.lock();
        let entry = &mut resolution.resolved_entry;
        if entry.sync_version > max_copy_version {
            entry.sync_version = state.next_version(key, entry.sync_version - 1);
        } else {
            state.observe_version(key, entry.sync_version);
        }
    }

    fn enqueue(state: &mut SyncState, conflict: ConflictInfo) {
        state
            .conflict_queue
            .retain(|c| c.entry_key != conflict.entry_key);
        state.conflict_queue.push_back(conflict);
    }

    /// Count a failed attempt; re-queue within the bound, archive beyond it
    fn requeue(&self, state: &mut SyncState, mut conflict: ConflictInfo) {
        conflict.attempts += 1;
        if conflict.attempts >= self.config.max_resolution_attempts {
            warn!(
                key = %conflict.entry_key,
                conflict = %conflict.conflict_id,
                attempts = conflict.attempts,
                "Giving up on conflict after repeated failures"
            );
            state.archive_conflict(conflict);
        } else {
            Self::enqueue(state, conflict);
        }
    }

    /// Compare the copies of one key and converge them. Caller holds the key lock.
    async fn reconcile(&self, plan: &Plan<'_>, stop: &Stop<'_>) -> KeyOutcome {
        let key = plan.key;
        let mut out = KeyOutcome::default();

        let mut copies: Vec<(LayerId, CacheEntry)> = Vec::new();
        let mut missing = Vec::new();
        let mut superseded = Vec::new();
        for &layer in &plan.layers {
            match self.registry.fetch(layer, key).await {
                Ok(Some(entry)) if entry.sync_version < self.state.lock().invalidated_below(key, layer) => {
                    superseded.push(layer)
                }
                Ok(Some(entry)) => copies.push((layer, entry)),
                Ok(None) => missing.push(layer),
                Err(err) => {
                    self.note_layer_error(layer, &err);
                    out.failed.push((layer, err.to_string()));
                }
            }
        }
        {
            let mut state = self.state.lock();
            for layer in &missing {
                state.clear_presence(key, *layer);
            }
            for (layer, entry) in &copies {
                state.set_presence(key, *layer, entry);
                state.observe_version(key, entry.sync_version);
            }
        }
        if plan.require_source {
            if let Some(source) = plan.preferred.filter(|s| missing.contains(s)) {
                out.failed.push((source, "key not present in source layer".into()));
                return out;
            }
        }
        if copies.is_empty() {
            return out;
        }

        let conflict = ConflictInfo::among(&self.rules, &self.config.authoritative_tag, &copies, plan.preferred)
            .map(|mut c| {
                c.attempts = plan.prior_attempts;
                c
            });

        let winner = match &conflict {
            None => plan
                .preferred
                .and_then(|p| copies.iter().find(|(l, _)| *l == p))
                .unwrap_or(&copies[0])
                .1
                .clone(),
            Some(conflict) => {
                self.counters.conflicts_detected.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key,
                    conflict_type = %conflict.conflict_type,
                    severity = ?conflict.severity,
                    copies = conflict.conflicting_entries.len(),
                    "Conflict detected"
                );
                if !plan.force && !conflict.auto_resolvable {
                    warn!(key, severity = ?conflict.severity, "Conflict deferred to the resolution queue");
                    let mut state = self.state.lock();
                    state.mark_conflicted(key);
                    Self::enqueue(&mut state, conflict.clone());
                    drop(state);
                    out.queued = true;
                    out.conflict = Some(conflict.clone());
                    return out;
                }
                self.state.lock().mark_resolving(key);
                let strategy = plan
                    .strategy
                    .unwrap_or_else(|| self.config.strategies.for_type(conflict.conflict_type));
                let mut resolution = self.resolver.resolve(conflict, strategy, None);
                self.finalize_version(key, &mut resolution, conflict.max_version());
                debug!(
                    key,
                    method = %resolution.method,
                    version = resolution.resolved_entry.sync_version,
                    confidence = resolution.confidence,
                    "Conflict resolved"
                );
                resolution.resolved_entry
            }
        };

        let mut targets = Vec::new();
        for (layer, entry) in &copies {
            if entry.same_content(&winner) {
                out.synced.push(*layer);
            } else {
                targets.push(*layer);
            }
        }
        for layer in &plan.populate {
            if missing.contains(layer) && !targets.contains(layer) {
                targets.push(*layer);
            }
        }
        // A surviving copy overwrites whatever an invalidation left behind
        for layer in &superseded {
            if !targets.contains(layer) {
                targets.push(*layer);
            }
        }
        targets.sort();

        let applied = self.apply(key, &winner, &targets, stop).await;
        out.synced.extend(applied.settled);
        out.failed.extend(applied.failed);
        out.writes = applied.writes;
        out.halted = applied.halted;

        let mut state = self.state.lock();
        if out.failed.is_empty() {
            state.settle(key);
            if let Some(conflict) = &conflict {
                self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                state.archive_conflict(conflict.clone());
            }
        } else if let Some(conflict) = &conflict {
            state.mark_conflicted(key);
            self.requeue(&mut state, conflict.clone());
        }
        drop(state);

        out.conflict = conflict;
        out
    }

    // =========================================================================
    // Pending obligations
    // =========================================================================

    /// Work through queued sync obligations, one batch
    #[instrument(skip(self))]
    pub async fn process_pending(&self) -> SyncResult {
        let stop = Stop {
            tokens: vec![&self.cancel],
            deadline: None,
        };
        self.run_pending(&stop, self.config.pending_batch_size).await
    }

    async fn run_pending(&self, stop: &Stop<'_>, limit: usize) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::default();
        let keys = self.state.lock().pending_keys(limit);

        for key in keys {
            if let Some(halt) = stop.check() {
                result.cancelled |= halt == Halt::Cancelled;
                break;
            }
            let _guard = self.registry.lock_key(&key).await;
            let ops = self.state.lock().take_pending(&key);
            if ops.is_empty() {
                continue;
            }
            result.keys_examined += 1;

            if self.is_tombstoned(&key) {
                let mut state = self.state.lock();
                for mut op in ops {
                    op.fail("key deleted");
                    state.retire_op(op);
                }
                continue;
            }

            let mut layers: Vec<LayerId> = ops
                .iter()
                .flat_map(|op| [op.source_layer, op.target_layer])
                .collect();
            layers.sort();
            layers.dedup();
            let plan = Plan {
                key: &key,
                layers,
                preferred: ops.last().map(|op| op.source_layer),
                require_source: false,
                populate: ops.iter().map(|op| op.target_layer).collect(),
                strategy: None,
                force: false,
                prior_attempts: 0,
            };
            let outcome = self.reconcile(&plan, stop).await;

            let mut state = self.state.lock();
            for mut op in ops {
                let failure = outcome
                    .failed_on(op.target_layer)
                    .or_else(|| outcome.failed_on(op.source_layer))
                    .map(str::to_string);
                match failure {
                    _ if outcome.queued => {
                        op.fail("deferred to conflict queue");
                        state.retire_op(op);
                    }
                    None => {
                        op.complete();
                        state.retire_op(op);
                    }
                    Some(reason) => {
                        if outcome.halted.is_none() {
                            op.attempts += 1;
                        }
                        if op.attempts >= self.config.max_resolution_attempts {
                            warn!(key = %op.key, target = %op.target_layer, error = %reason, "Dropping sync obligation");
                            op.fail(reason);
                            state.retire_op(op);
                        } else {
                            op.error = Some(reason);
                            state.push_pending(op);
                        }
                    }
                }
            }
            drop(state);
            outcome.absorb_into(&key, &mut result);
        }
        result.finish(started)
    }

    // =========================================================================
    // Explicit synchronization
    // =========================================================================

    /// Bring `targets` (every other layer by default) in line with the copy
    /// held by `source`
    #[instrument(skip_all, fields(key = %key, source = %source))]
    pub async fn synchronize(
        &self,
        key: &str,
        source: LayerId,
        targets: Option<Vec<LayerId>>,
        options: SyncOptions,
    ) -> Result<SyncResult> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let started = Instant::now();
        let budget = options.timeout.unwrap_or(self.config.synchronize_timeout);
        let mut targets: Vec<LayerId> = targets
            .unwrap_or_else(|| self.registry.ids())
            .into_iter()
            .filter(|l| *l != source)
            .collect();
        targets.sort();
        targets.dedup();
        self.counters.sync_operations.fetch_add(1, Ordering::Relaxed);

        let stop = Stop {
            tokens: vec![&self.cancel],
            deadline: Some(started + budget),
        };
        let work = async {
            let _guard = self.registry.lock_key(key).await;
            let mut result = SyncResult {
                keys_examined: 1,
                ..Default::default()
            };
            if self.is_tombstoned(key) {
                result.fail(None, format!("{} has been deleted", key));
                return result;
            }
            let mut layers = targets.clone();
            layers.push(source);
            layers.sort();
            let plan = Plan {
                key,
                layers,
                preferred: Some(source),
                require_source: true,
                populate: targets.clone(),
                strategy: options.strategy,
                force: options.strategy.is_some(),
                prior_attempts: 0,
            };
            self.reconcile(&plan, &stop).await.absorb_into(key, &mut result);
            result
        };

        let result = match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) => {
                let err = Error::Timeout {
                    operation: format!("synchronize {}", key),
                    after_ms: budget.as_millis() as u64,
                };
                warn!(error = %err, "Synchronize timed out");
                let mut result = SyncResult::default();
                for target in &targets {
                    result.fail(Some(*target), err.to_string());
                }
                result
            }
        };
        let result = result.finish(started);
        debug!(
            synced = ?result.synced_layers,
            failed = ?result.failed_layers,
            conflicts = result.conflicts.len(),
            "Synchronize finished"
        );
        Ok(result)
    }

    /// Reconcile every key held by any layer.
    ///
    /// Layer contents are listed once to enumerate keys; each key is then
    /// re-read under its lock, so concurrent writes are never undone. Copies
    /// are only rewritten where they diverge.
    #[instrument(skip(self, options))]
    pub async fn full_sync(&self, options: FullSyncOptions) -> Result<SyncResult> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let started = Instant::now();
        if self
            .full_sync_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let mut result = SyncResult::default();
            result.fail(None, "full sync already in progress");
            return Ok(result.finish(started));
        }
        let _running = RunningFlag(&self.full_sync_running);

        let budget = options.timeout.unwrap_or(self.config.full_sync_timeout);
        let deadline = started + budget;
        let mut tokens = vec![&self.cancel];
        if let Some(token) = &options.cancel {
            tokens.push(token);
        }
        let stop = Stop {
            tokens,
            deadline: Some(deadline),
        };
        self.counters.sync_operations.fetch_add(1, Ordering::Relaxed);

        let mut result = SyncResult::default();
        let mut keys: BTreeSet<String> = BTreeSet::new();
        let mut reachable = Vec::new();
        for layer in self.registry.ids() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.registry.snapshot(layer, remaining).await {
                Ok(snapshot) => {
                    keys.extend(snapshot.into_keys());
                    reachable.push(layer);
                }
                Err(err) => {
                    self.note_layer_error(layer, &err);
                    result.fail(Some(layer), format!("listing {}: {}", layer, err));
                }
            }
        }
        {
            let state = self.state.lock();
            keys.extend(state.tombstones.keys().cloned());
            keys.extend(state.invalidations.keys().cloned());
        }
        info!(keys = keys.len(), layers = ?reachable, "Full sync started");

        for key in &keys {
            match stop.check() {
                Some(Halt::Cancelled) => {
                    result.cancelled = true;
                    break;
                }
                Some(Halt::Deadline) => {
                    let err = Error::Timeout {
                        operation: "full sync".into(),
                        after_ms: budget.as_millis() as u64,
                    };
                    result.fail(None, err.to_string());
                    break;
                }
                None => {}
            }
            let _guard = self.registry.lock_key(key).await;
            result.keys_examined += 1;
            if self.is_tombstoned(key) {
                self.retry_delete_locked(key).await;
                continue;
            }
            self.retry_invalidation_locked(key).await;
            let plan = Plan {
                key,
                layers: reachable.clone(),
                preferred: None,
                require_source: false,
                populate: Vec::new(),
                strategy: options.strategy,
                force: true,
                prior_attempts: 0,
            };
            self.reconcile(&plan, &stop).await.absorb_into(key, &mut result);
        }

        if !result.cancelled {
            let mut state = self.state.lock();
            state.last_full_sync = Some(Utc::now());
            state.sync_version += 1;
        }
        let result = result.finish(started);
        info!(
            keys = result.keys_examined,
            conflicts = result.conflicts.len(),
            writes = result.writes_applied,
            failures = result.failures.len(),
            cancelled = result.cancelled,
            duration_ms = result.duration_ms,
            "Full sync finished"
        );
        Ok(result)
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Resolve a conflict and write the result back to its layers
    #[instrument(skip(self, conflict), fields(key = %conflict.entry_key, conflict = %conflict.conflict_id))]
    pub async fn resolve_conflict(
        &self,
        conflict: &ConflictInfo,
        strategy: Option<ResolutionStrategy>,
    ) -> ConflictResolutionResult {
        let key = conflict.entry_key.as_str();
        let strategy = strategy.unwrap_or_else(|| self.config.strategies.for_type(conflict.conflict_type));
        let _guard = self.registry.lock_key(key).await;

        let fallback = if conflict.conflicting_entries.is_empty() {
            self.registry
                .fetch(conflict.source_layer, key)
                .await
                .ok()
                .flatten()
        } else {
            None
        };
        let mut resolution = self.resolver.resolve(conflict, strategy, fallback.as_ref());
        let mut result = ConflictResolutionResult {
            success: true,
            conflict_id: conflict.conflict_id,
            key: key.to_string(),
            resolution: resolution.clone(),
            applied: false,
            applied_layers: Vec::new(),
            failed_layers: Vec::new(),
        };
        if resolution.resolved_entry.is_placeholder() || self.is_tombstoned(key) {
            return result;
        }

        self.state.lock().mark_resolving(key);
        let max_version = conflict.max_version().max(fallback.map(|e| e.sync_version).unwrap_or(0));
        self.finalize_version(key, &mut resolution, max_version);

        let mut layers = conflict.layers.clone();
        layers.extend([conflict.source_layer, conflict.target_layer]);
        layers.retain(|l| self.registry.contains(*l));
        layers.sort();
        layers.dedup();

        let stop = Stop {
            tokens: vec![&self.cancel],
            deadline: Some(Instant::now() + self.config.synchronize_timeout),
        };
        let applied = self.apply(key, &resolution.resolved_entry, &layers, &stop).await;

        let mut state = self.state.lock();
        if applied.failed.is_empty() {
            state.settle(key);
            state.conflict_queue.retain(|c| c.conflict_id != conflict.conflict_id);
            state.archive_conflict(conflict.clone());
            self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
        } else {
            state.mark_conflicted(key);
            self.requeue(&mut state, conflict.clone());
        }
        drop(state);

        result.applied = applied.failed.is_empty();
        result.applied_layers = applied.settled;
        result.failed_layers = applied.failed.into_iter().map(|(l, _)| l).collect();
        result.resolution = resolution;
        result
    }

    /// Resolve up to `max` queued conflicts against fresh copies; returns how
    /// many were settled
    #[instrument(skip(self))]
    pub async fn drain_conflicts(&self, max: usize) -> usize {
        let batch: Vec<ConflictInfo> = {
            let mut state = self.state.lock();
            let n = max.min(state.conflict_queue.len());
            state.conflict_queue.drain(..n).collect()
        };
        let stop = Stop {
            tokens: vec![&self.cancel],
            deadline: None,
        };
        let layers = self.registry.ids();
        let mut settled = 0;

        for conflict in batch {
            if self.cancel.is_cancelled() {
                Self::enqueue(&mut self.state.lock(), conflict);
                continue;
            }
            let key = conflict.entry_key.clone();
            let _guard = self.registry.lock_key(&key).await;
            if self.is_tombstoned(&key) {
                self.state.lock().archive_conflict(conflict);
                settled += 1;
                continue;
            }
            let plan = Plan {
                key: &key,
                layers: layers.clone(),
                preferred: Some(conflict.source_layer),
                require_source: false,
                populate: Vec::new(),
                strategy: None,
                force: true,
                prior_attempts: conflict.attempts,
            };
            let outcome = self.reconcile(&plan, &stop).await;
            let ok = outcome.failed.is_empty();
            if ok {
                settled += 1;
            }
            if outcome.conflict.is_none() {
                // Copies converged since the conflict was queued
                let mut state = self.state.lock();
                if ok {
                    state.archive_conflict(conflict);
                    self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.requeue(&mut state, conflict);
                }
            }
        }
        settled
    }

    /// Conflicts waiting for resolution
    pub fn pending_conflicts(&self) -> Vec<ConflictInfo> {
        self.state.lock().conflict_queue.iter().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().conflict_queue.len()
    }

    /// Resolved or abandoned conflicts, oldest first
    pub fn archived_conflicts(&self) -> Vec<ConflictInfo> {
        self.state.lock().archive.iter().cloned().collect()
    }

    pub fn stats(&self) -> SyncStats {
        let state = self.state.lock();
        SyncStats {
            sync_operations: self.counters.sync_operations.load(Ordering::Relaxed),
            conflicts_detected: self.counters.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.counters.conflicts_resolved.load(Ordering::Relaxed),
            writes_applied: self.counters.writes_applied.load(Ordering::Relaxed),
            conflicts_queued: state.conflict_queue.len(),
            pending_operations: state.pending_count(),
            tombstones: state.tombstones.len(),
            invalidations: state.invalidations.len(),
            full_syncs: state.sync_version,
            last_full_sync: state.last_full_sync,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the periodic pass over pending obligations, deletes and
    /// invalidations
    pub fn spawn_sync_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = engine.config.sync_interval.as_millis() as u64, "Sync loop started");
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = engine.process_pending().await;
                        let purged = engine.retry_pending_deletes().await;
                        let cleared = engine.retry_invalidations().await;
                        if result.keys_examined > 0 || purged > 0 || cleared > 0 {
                            debug!(
                                keys = result.keys_examined,
                                writes = result.writes_applied,
                                purged,
                                cleared,
                                "Sync pass complete"
                            );
                        }
                    }
                }
            }
            debug!("Sync loop stopped");
        });
    }

    /// Stop background work, flush pending obligations best-effort, then
    /// close the write gate. No adapter write is issued after this returns.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Disposing sync engine");
        self.cancel.cancel();
        // A pass interrupted mid-key puts its obligations back for the flush
        self.tasks.close();
        self.tasks.wait().await;

        let budget = self.config.synchronize_timeout;
        let flush = Stop {
            tokens: Vec::new(),
            deadline: Some(Instant::now() + budget),
        };
        match tokio::time::timeout(budget, self.run_pending(&flush, usize::MAX)).await {
            Ok(result) => info!(
                keys = result.keys_examined,
                writes = result.writes_applied,
                "Flushed pending sync obligations"
            ),
            Err(_) => warn!(after_ms = budget.as_millis() as u64, "Flushing pending sync obligations timed out"),
        }

        self.registry.close_writes().await;
        self.state.lock().is_active = false;
        info!("Sync engine disposed");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blob::BlobLayer;
    use crate::cache::entry::{Priority, WriteMetadata, AUTHORITATIVE_TAG};
    use crate::cache::layer::LayerAdapter;
    use crate::cache::structured::StructuredLayer;
    use crate::cache::volatile::VolatileLayer;
    use crate::sync::conflict::{ConflictType, Severity};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::time::Duration;
    use uuid::Uuid;

    fn engine() -> Arc<SyncEngine> {
        let layers: Vec<Arc<dyn LayerAdapter>> = vec![
            Arc::new(VolatileLayer::new()),
            Arc::new(StructuredLayer::in_memory()),
            Arc::new(BlobLayer::in_memory()),
        ];
        let registry = Arc::new(LayerRegistry::new(layers, Duration::from_millis(500)).unwrap());
        Arc::new(SyncEngine::new(registry, SyncConfig::default()))
    }

    fn entry(key: &str, payload: &str, version: u64) -> CacheEntry {
        CacheEntry::with_version(
            key,
            Bytes::from(payload.to_string()),
            WriteMetadata::new("audio/wav"),
            version,
            Utc::now(),
        )
    }

    async fn put(engine: &SyncEngine, layer: LayerId, e: &CacheEntry) {
        assert!(engine.registry().store(layer, &e.key, e).await.unwrap());
    }

    async fn version_in(engine: &SyncEngine, layer: LayerId, key: &str) -> Option<u64> {
        engine
            .registry()
            .fetch(layer, key)
            .await
            .unwrap()
            .map(|e| e.sync_version)
    }

    #[tokio::test]
    async fn test_pending_write_propagates_to_failed_target() {
        let engine = engine();
        let e = entry("track-1", "pcm", 1);
        put(&engine, LayerId::Volatile, &e).await;
        engine.register_write(&e, LayerId::Volatile, &[LayerId::Volatile], &[LayerId::Blob]);
        assert_eq!(engine.key_state("track-1"), KeySyncState::PendingSync);
        assert_eq!(engine.stats().pending_operations, 1);

        let result = engine.process_pending().await;
        assert!(result.success);
        assert_eq!(result.writes_applied, 1);
        assert_eq!(version_in(&engine, LayerId::Blob, "track-1").await, Some(1));
        assert_eq!(engine.key_state("track-1"), KeySyncState::Consistent);
        assert_eq!(engine.stats().pending_operations, 0);

        let presence = engine.presence("track-1");
        assert!(presence[&LayerId::Volatile].present);
        assert!(presence[&LayerId::Blob].present);
    }

    #[tokio::test]
    async fn test_synchronize_resolves_version_conflict() {
        let engine = engine();
        put(&engine, LayerId::Volatile, &entry("track-2", "four", 4)).await;
        put(&engine, LayerId::Blob, &entry("track-2", "three", 3)).await;

        let result = engine
            .synchronize("track-2", LayerId::Volatile, None, SyncOptions::default())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.failures);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Version);
        assert_eq!(version_in(&engine, LayerId::Blob, "track-2").await, Some(4));
        assert_eq!(version_in(&engine, LayerId::Structured, "track-2").await, Some(4));
        assert_eq!(engine.stats().conflicts_resolved, 1);
        assert_eq!(engine.archived_conflicts().len(), 1);
    }

    #[tokio::test]
    async fn test_synchronize_requires_source_copy() {
        let engine = engine();
        put(&engine, LayerId::Blob, &entry("k", "x", 1)).await;
        let result = engine
            .synchronize("k", LayerId::Volatile, Some(vec![LayerId::Structured]), SyncOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failed_layers, vec![LayerId::Volatile]);
        assert_eq!(version_in(&engine, LayerId::Structured, "k").await, None);
    }

    #[tokio::test]
    async fn test_full_sync_is_idempotent() {
        let engine = engine();
        put(&engine, LayerId::Volatile, &entry("a", "new", 2)).await;
        put(&engine, LayerId::Blob, &entry("a", "old", 1)).await;
        put(&engine, LayerId::Structured, &entry("b", "only", 1)).await;

        let first = engine.full_sync(FullSyncOptions::default()).await.unwrap();
        assert!(first.success, "{:?}", first.failures);
        assert_eq!(first.keys_examined, 2);
        assert_eq!(first.conflicts.len(), 1);
        assert_eq!(first.writes_applied, 1);
        let presence = (engine.presence("a"), engine.presence("b"));

        let second = engine.full_sync(FullSyncOptions::default()).await.unwrap();
        assert!(second.success);
        assert!(second.conflicts.is_empty());
        assert_eq!(second.writes_applied, 0);
        assert_eq!((engine.presence("a"), engine.presence("b")), presence);
        assert_eq!(engine.stats().full_syncs, 2);
        // Full sync does not copy keys into layers that never held them
        assert_eq!(version_in(&engine, LayerId::Structured, "a").await, None);
    }

    #[tokio::test]
    async fn test_full_sync_stops_when_cancelled() {
        let engine = engine();
        put(&engine, LayerId::Volatile, &entry("a", "new", 2)).await;
        put(&engine, LayerId::Blob, &entry("a", "old", 1)).await;

        let token = CancellationToken::new();
        token.cancel();
        let result = engine
            .full_sync(FullSyncOptions {
                cancel: Some(token),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.writes_applied, 0);
        assert_eq!(version_in(&engine, LayerId::Blob, "a").await, Some(1));
        assert!(engine.stats().last_full_sync.is_none());
    }

    #[tokio::test]
    async fn test_critical_conflict_is_queued_then_drained() {
        let engine = engine();
        let mut a = entry("master", "take-a", 5);
        a.metadata.tags.push(AUTHORITATIVE_TAG.into());
        let mut b = entry("master", "take-b", 5);
        b.metadata.tags.push(AUTHORITATIVE_TAG.into());
        put(&engine, LayerId::Volatile, &a).await;
        put(&engine, LayerId::Structured, &b).await;
        engine.register_write(&a, LayerId::Volatile, &[LayerId::Volatile], &[LayerId::Structured]);

        let result = engine.process_pending().await;
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].severity, Severity::Critical);
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(engine.key_state("master"), KeySyncState::Conflicted);

        assert_eq!(engine.drain_conflicts(10).await, 1);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.key_state("master"), KeySyncState::Consistent);
        let v = engine.registry().fetch(LayerId::Volatile, "master").await.unwrap().unwrap();
        let s = engine.registry().fetch(LayerId::Structured, "master").await.unwrap().unwrap();
        assert!(v.same_content(&s));
        // Content conflicts merge into a new version
        assert_eq!(v.sync_version, 6);
    }

    #[tokio::test]
    async fn test_tombstone_retry_and_purge() {
        let engine = engine();
        put(&engine, LayerId::Blob, &entry("gone", "x", 3)).await;
        engine.register_delete("gone", 4, BTreeSet::from([LayerId::Blob]));
        assert!(engine.is_tombstoned("gone"));
        assert_eq!(engine.tombstone("gone").unwrap().version, 4);
        // A later write must supersede the delete
        assert_eq!(engine.next_version("other", 0), 1);

        assert_eq!(engine.retry_pending_deletes().await, 1);
        assert!(!engine.is_tombstoned("gone"));
        assert_eq!(version_in(&engine, LayerId::Blob, "gone").await, None);
        assert_eq!(engine.next_version("gone", 0), 5);
    }

    #[tokio::test]
    async fn test_invalidation_removes_only_older_copies() {
        let engine = engine();
        put(&engine, LayerId::Structured, &entry("take", "old", 1)).await;
        put(&engine, LayerId::Blob, &entry("take", "newer", 3)).await;
        engine.register_invalidation("take", 2, BTreeSet::from([LayerId::Structured, LayerId::Blob]));
        assert!(engine.is_superseded("take", LayerId::Structured, 1));
        assert!(!engine.is_superseded("take", LayerId::Blob, 3));

        assert_eq!(engine.retry_invalidations().await, 1);
        assert!(engine.invalidation("take").is_none());
        assert_eq!(version_in(&engine, LayerId::Structured, "take").await, None);
        assert_eq!(version_in(&engine, LayerId::Blob, "take").await, Some(3));
    }

    #[tokio::test]
    async fn test_full_sync_clears_superseded_copy() {
        let engine = engine();
        put(&engine, LayerId::Volatile, &entry("take", "fresh", 2)).await;
        put(&engine, LayerId::Structured, &entry("take", "stale", 1)).await;
        engine.register_invalidation("take", 2, BTreeSet::from([LayerId::Structured]));

        let result = engine.full_sync(FullSyncOptions::default()).await.unwrap();
        assert!(result.success);
        assert!(engine.invalidation("take").is_none());
        assert_eq!(version_in(&engine, LayerId::Structured, "take").await, None);
        assert_eq!(version_in(&engine, LayerId::Volatile, "take").await, Some(2));
    }

    #[tokio::test]
    async fn test_promotion_never_overwrites_newer() {
        let engine = engine();
        let old = entry("p", "old", 1);
        put(&engine, LayerId::Volatile, &entry("p", "new", 2)).await;
        assert_eq!(
            engine.promote(&old, LayerId::Volatile).await.unwrap(),
            GuardedWrite::SkippedNewer
        );

        // Key written past the promoted copy since it was read
        engine.next_version("q", 0);
        engine.next_version("q", 0);
        assert_eq!(
            engine.promote(&entry("q", "v1", 1), LayerId::Volatile).await.unwrap(),
            GuardedWrite::SkippedNewer
        );
        assert_eq!(version_in(&engine, LayerId::Volatile, "q").await, None);

        let fresh = entry("r", "v1", 1);
        assert_eq!(
            engine.promote(&fresh, LayerId::Volatile).await.unwrap(),
            GuardedWrite::Written
        );
        assert!(engine.presence("r")[&LayerId::Volatile].present);
    }

    #[tokio::test]
    async fn test_resolve_degenerate_conflict() {
        let engine = engine();
        let conflict = ConflictInfo {
            conflict_id: Uuid::new_v4(),
            conflict_type: ConflictType::Content,
            source_layer: LayerId::Volatile,
            target_layer: LayerId::Blob,
            entry_key: "nothing".into(),
            conflicting_entries: vec![],
            layers: vec![],
            severity: Severity::Low,
            auto_resolvable: true,
            detected_at: Utc::now(),
            attempts: 0,
        };
        let result = engine.resolve_conflict(&conflict, None).await;
        assert!(result.success);
        assert!(!result.applied);
        assert!(result.resolution.resolved_entry.is_placeholder());

        put(&engine, LayerId::Volatile, &entry("nothing", "src", 2)).await;
        let result = engine
            .resolve_conflict(&conflict, Some(ResolutionStrategy::LastWriteWins))
            .await;
        assert!(result.applied);
        assert_eq!(result.resolution.confidence, 0.65);
        assert_eq!(result.applied_layers, vec![LayerId::Volatile, LayerId::Blob]);
        assert_eq!(version_in(&engine, LayerId::Blob, "nothing").await, Some(2));
    }

    #[tokio::test]
    async fn test_dispose_closes_writes() {
        let engine = engine();
        let e = entry("k", "x", 1);
        put(&engine, LayerId::Volatile, &e).await;
        engine.register_write(&e, LayerId::Volatile, &[LayerId::Volatile], &[LayerId::Structured]);
        engine.spawn_sync_loop();

        engine.dispose().await;
        // Pending obligations were flushed before the gate closed
        assert_eq!(version_in(&engine, LayerId::Structured, "k").await, Some(1));
        assert_matches!(
            engine.registry().store(LayerId::Blob, "k", &e).await,
            Err(Error::Disposed)
        );
        assert_matches!(
            engine.synchronize("k", LayerId::Volatile, None, SyncOptions::default()).await,
            Err(Error::Disposed)
        );
        assert_matches!(engine.full_sync(FullSyncOptions::default()).await, Err(Error::Disposed));
        assert_matches!(
            engine.promote(&e, LayerId::Blob).await,
            Err(Error::Cancelled { .. })
        );
    }

    #[tokio::test]
    async fn test_register_write_single_layer_stays_consistent() {
        let engine = engine();
        let mut e = entry("solo", "x", 1);
        e.metadata.priority = Priority::Low;
        engine.register_write(&e, LayerId::Volatile, &[LayerId::Volatile], &[]);
        assert_eq!(engine.key_state("solo"), KeySyncState::Consistent);
        assert_eq!(engine.stats().pending_operations, 0);
        assert!(engine.knows("solo"));
    }
}
