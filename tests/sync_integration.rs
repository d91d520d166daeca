//! Synchronization Integration Tests
//!
//! Full sync, conflict handling and dispose behavior through the public API.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use proptest::prelude::*;
use uuid::Uuid;

use common::Harness;
use layercast::cache::{GuardedWrite, LayerPresence};
use layercast::sync::{ConflictInfo, ConflictType, FullSyncOptions, KeySyncState, Severity, SyncOptions};
use layercast::{CacheEntry, CacheManager, LayerId, ResolutionStrategy, WriteMetadata};

fn entry(key: &str, payload: &str, version: u64) -> CacheEntry {
    CacheEntry::with_version(
        key,
        Bytes::from(payload.to_string()),
        WriteMetadata::new("audio/wav"),
        version,
        Utc::now(),
    )
}

async fn seed(cache: &CacheManager, layer: LayerId, e: &CacheEntry) {
    assert!(cache.registry().store(layer, &e.key, e).await.unwrap());
}

async fn version_in(cache: &CacheManager, layer: LayerId, key: &str) -> Option<u64> {
    cache
        .registry()
        .fetch(layer, key)
        .await
        .unwrap()
        .map(|e| e.sync_version)
}

fn presence_map(cache: &CacheManager, keys: &[&str]) -> HashMap<String, Vec<(LayerId, LayerPresence)>> {
    keys.iter()
        .map(|k| {
            let mut p: Vec<_> = cache.engine().presence(k).into_iter().collect();
            p.sort_by_key(|(l, _)| *l);
            (k.to_string(), p)
        })
        .collect()
}

// =============================================================================
// Full Sync
// =============================================================================

#[tokio::test]
async fn test_full_sync_is_idempotent() {
    let harness = Harness::new();
    let cache = harness.cache();
    seed(&cache, LayerId::Volatile, &entry("a", "old", 1)).await;
    seed(&cache, LayerId::Structured, &entry("a", "new", 2)).await;
    seed(&cache, LayerId::Blob, &entry("b", "only", 1)).await;
    seed(&cache, LayerId::Structured, &entry("c", "same", 3)).await;
    seed(&cache, LayerId::Blob, &cache.registry().fetch(LayerId::Structured, "c").await.unwrap().unwrap()).await;

    let first = cache.full_sync(FullSyncOptions::default()).await.unwrap();
    assert!(first.success);
    assert_eq!(first.keys_examined, 3);
    assert_eq!(first.conflicts.len(), 1);
    assert_eq!(first.conflicts[0].conflict_type, ConflictType::Version);
    assert_eq!(version_in(&cache, LayerId::Volatile, "a").await, Some(2));
    let before = presence_map(&cache, &["a", "b", "c"]);

    let second = cache.full_sync(FullSyncOptions::default()).await.unwrap();
    assert!(second.success);
    assert!(second.conflicts.is_empty());
    assert_eq!(second.writes_applied, 0);
    assert_eq!(presence_map(&cache, &["a", "b", "c"]), before);
}

#[tokio::test]
async fn test_out_of_order_versions_converge_on_newest() {
    let harness = Harness::new();
    let cache = harness.cache();
    let v3 = entry("track-2", "take three", 3);
    let v4 = entry("track-2", "take four!", 4);

    // v4 lands first everywhere, then a late v3 overwrites the blob copy
    for layer in LayerId::ALL {
        seed(&cache, layer, &v4).await;
    }
    seed(&cache, LayerId::Blob, &v3).await;

    let result = cache.full_sync(FullSyncOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].conflict_type, ConflictType::Version);
    for layer in LayerId::ALL {
        let copy = cache.registry().fetch(layer, "track-2").await.unwrap().unwrap();
        assert_eq!(copy.sync_version, 4);
        assert_eq!(copy.payload(), v4.payload());
    }
}

#[tokio::test]
async fn test_version_checked_write_rejects_late_older_copy() {
    let harness = Harness::new();
    let cache = harness.cache();
    let v4 = entry("track-2", "four", 4);
    seed(&cache, LayerId::Structured, &v4).await;

    let _guard = cache.registry().lock_key("track-2").await;
    let outcome = cache
        .registry()
        .store_if_not_newer(LayerId::Structured, "track-2", &entry("track-2", "three", 3))
        .await
        .unwrap();
    assert_eq!(outcome, GuardedWrite::SkippedNewer);
    assert_eq!(version_in(&cache, LayerId::Structured, "track-2").await, Some(4));
}

#[tokio::test]
async fn test_full_sync_isolates_failed_layer() {
    let harness = Harness::new();
    let cache = harness.cache();
    seed(&cache, LayerId::Volatile, &entry("x", "new", 2)).await;
    seed(&cache, LayerId::Blob, &entry("x", "old", 1)).await;
    seed(&cache, LayerId::Volatile, &entry("y", "solo", 1)).await;
    harness.blob.hang();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        cache.full_sync(FullSyncOptions {
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        }),
    )
    .await
    .expect("full sync bounded by its timeout")
    .unwrap();
    assert!(!result.success);
    assert!(result.failed_layers.contains(&LayerId::Blob));
    assert!(!result.failures.is_empty());
}

// =============================================================================
// Explicit Synchronization and Conflicts
// =============================================================================

#[tokio::test]
async fn test_synchronize_with_explicit_strategy() {
    let harness = Harness::new();
    let cache = harness.cache();
    let mut older = entry("mix", "older but later", 1);
    older.metadata.modified_at = Utc::now() + chrono::Duration::seconds(30);
    seed(&cache, LayerId::Volatile, &older).await;
    seed(&cache, LayerId::Structured, &entry("mix", "newer version", 2)).await;

    let result = cache
        .synchronize(
            "mix",
            LayerId::Volatile,
            Some(vec![LayerId::Structured]),
            SyncOptions {
                strategy: Some(ResolutionStrategy::LastWriteWins),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.synced_layers, vec![LayerId::Volatile, LayerId::Structured]);

    let copy = cache.registry().fetch(LayerId::Structured, "mix").await.unwrap().unwrap();
    assert_eq!(copy.payload(), older.payload());
    assert!(copy.sync_version >= 2);
}

#[tokio::test]
async fn test_degenerate_conflict_still_resolves() {
    let harness = Harness::new();
    let cache = harness.cache();
    let conflict = ConflictInfo {
        conflict_id: Uuid::new_v4(),
        conflict_type: ConflictType::Content,
        source_layer: LayerId::Volatile,
        target_layer: LayerId::Blob,
        entry_key: "ghost".into(),
        conflicting_entries: vec![],
        layers: vec![],
        severity: Severity::High,
        auto_resolvable: true,
        detected_at: Utc::now(),
        attempts: 0,
    };

    for strategy in [
        None,
        Some(ResolutionStrategy::LastWriteWins),
        Some(ResolutionStrategy::HighestVersionWins),
        Some(ResolutionStrategy::MergeChanges),
        Some(ResolutionStrategy::ServerWins),
    ] {
        let result = cache.resolve_conflict(&conflict, strategy).await;
        assert!(result.success);
        assert_eq!(result.resolution.resolved_entry.key, "ghost");
        assert!(result.resolution.confidence > 0.0);
    }
    // Nothing is fabricated into the layers
    assert_eq!(harness.sets_started(), 0);
}

fn version_conflict(key: &str, newer: &CacheEntry, older: &CacheEntry) -> ConflictInfo {
    ConflictInfo {
        conflict_id: Uuid::new_v4(),
        conflict_type: ConflictType::Version,
        source_layer: LayerId::Volatile,
        target_layer: LayerId::Blob,
        entry_key: key.into(),
        conflicting_entries: vec![newer.clone(), older.clone()],
        layers: vec![LayerId::Volatile, LayerId::Blob],
        severity: Severity::Medium,
        auto_resolvable: true,
        detected_at: Utc::now(),
        attempts: 0,
    }
}

#[tokio::test]
async fn test_failed_resolution_is_requeued() {
    let harness = Harness::new();
    let cache = harness.cache();
    let v4 = entry("stem", "four", 4);
    let v3 = entry("stem", "three", 3);
    seed(&cache, LayerId::Volatile, &v4).await;
    seed(&cache, LayerId::Blob, &v3).await;
    harness.blob.crash();

    let conflict = version_conflict("stem", &v4, &v3);
    let result = cache
        .resolve_conflict(&conflict, Some(ResolutionStrategy::HighestVersionWins))
        .await;
    assert!(!result.applied);
    assert_eq!(result.failed_layers, vec![LayerId::Blob]);
    assert_eq!(cache.engine().queue_len(), 1);
    assert_eq!(cache.engine().pending_conflicts()[0].attempts, 1);
    assert_eq!(cache.engine().key_state("stem"), KeySyncState::Conflicted);

    harness.blob.recover();
    assert_eq!(cache.engine().drain_conflicts(10).await, 1);
    assert_eq!(cache.engine().queue_len(), 0);
    assert_eq!(version_in(&cache, LayerId::Blob, "stem").await, Some(4));
    assert_eq!(cache.engine().key_state("stem"), KeySyncState::Consistent);
}

#[tokio::test]
async fn test_unresolvable_conflict_is_archived_after_bounded_attempts() {
    let harness = Harness::new();
    let cache = harness.cache();
    let v4 = entry("stem", "four", 4);
    let v3 = entry("stem", "three", 3);
    seed(&cache, LayerId::Volatile, &v4).await;
    seed(&cache, LayerId::Blob, &v3).await;
    harness.blob.crash();

    cache.resolve_conflict(&version_conflict("stem", &v4, &v3), None).await;
    let max = cache.engine().config().max_resolution_attempts as usize;
    for _ in 0..max {
        cache.engine().drain_conflicts(10).await;
    }
    assert_eq!(cache.engine().queue_len(), 0);
    let archived = cache.engine().archived_conflicts();
    assert!(archived.iter().any(|c| c.entry_key == "stem" && c.attempts as usize >= max));
}

// =============================================================================
// Dispose
// =============================================================================

#[tokio::test]
async fn test_dispose_during_full_sync_stops_writes() {
    let harness = Harness::new();
    let cache = Arc::new(harness.cache());
    for i in 0..40 {
        let key = format!("bulk-{}", i);
        seed(&cache, LayerId::Volatile, &entry(&key, "fresh", 2)).await;
        seed(&cache, LayerId::Blob, &entry(&key, "stale", 1)).await;
    }
    harness.blob.slow_writes(Duration::from_millis(20));

    let sync = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.full_sync(FullSyncOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;

    tokio::time::timeout(Duration::from_secs(10), cache.dispose())
        .await
        .expect("dispose finished");
    let writes_at_dispose = harness.sets_started();
    assert!(cache.registry().is_closed());

    let outcome = sync.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.sets_started(), writes_at_dispose);
    if let Ok(result) = outcome {
        assert!(!result.success);
    }

    // Every copy is a whole entry: either the stale or the fresh one
    for (key, copy) in cache.registry().snapshot(LayerId::Blob, Duration::from_secs(1)).await.unwrap() {
        assert!(copy.verify_integrity(), "{} is intact", key);
        assert!(copy.sync_version == 1 || copy.sync_version == 2);
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_full_sync_converges(copies in proptest::collection::vec((0usize..3, 1u64..6, 0u8..3), 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let harness = Harness::new();
            let cache = harness.cache();
            let mut held: HashMap<LayerId, u64> = HashMap::new();
            for (layer, version, variant) in copies {
                let layer = LayerId::ALL[layer];
                seed(&cache, layer, &entry("prop", &format!("payload-{}", variant), version)).await;
                held.insert(layer, version);
            }
            let max = held.values().copied().max().unwrap_or(0);

            let first = cache.full_sync(FullSyncOptions::default()).await.unwrap();
            assert!(first.success, "{:?}", first.failures);

            let mut versions = Vec::new();
            for layer in held.keys() {
                let copy = cache.registry().fetch(*layer, "prop").await.unwrap().unwrap();
                assert!(copy.sync_version >= max);
                versions.push((copy.sync_version, copy.metadata.checksum));
            }
            versions.dedup();
            assert_eq!(versions.len(), 1, "copies converged");

            let second = cache.full_sync(FullSyncOptions::default()).await.unwrap();
            assert_eq!(second.writes_applied, 0);
            assert!(second.conflicts.is_empty());
        });
    }
}
