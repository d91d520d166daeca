//! Cache Manager - Unified Multi-Layer Cache
//!
//! The exposed API surface. Reads follow the layer prediction and fall back
//! through the remaining layers, promoting on a slower hit. Writes fan out to
//! the layers chosen by the routing policy and hand the copies to the
//! synchronization engine.
//!
//! Reads never take a key lock, so they proceed while a full sync runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::blob::BlobLayer;
use super::compression::{compress_or_fallback, Codec, Lz4Codec};
use super::entry::{CacheEntry, CompressionInfo, LayerPresence, Priority, WriteMetadata};
use super::history::{OperationHistory, OperationKind, OperationRecord};
use super::layer::{LayerAdapter, LayerId};
use super::metrics::{Analytics, CacheMetrics};
use super::policy::RoutingPolicy;
use super::prediction::{AccessFeatures, PredictionEngine, TrainedModel};
use super::registry::{GuardedWrite, LayerRegistry};
use super::structured::StructuredLayer;
use super::volatile::VolatileLayer;
use crate::config::CacheConfig;
use crate::domain::ports::{AssetFetcher, FetchOptions, NetworkConditions, NetworkSampler};
use crate::error::{Error, Result};
use crate::sync::{
    ConflictInfo, ConflictResolutionResult, FullSyncOptions, KeySyncState, LayerStatus, ResolutionStrategy,
    SyncEngine, SyncOptions, SyncResult,
};

/// Outcome of `set` and `delete`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    /// Layers that accepted the write (or confirmed the delete)
    pub layers_written: Vec<LayerId>,
    pub failed_layers: Vec<LayerId>,
    pub compression_used: bool,
    pub sync_version: u64,
    pub duration_ms: u64,
}

/// What the manager remembers about a key between calls
#[derive(Debug, Clone, Default)]
struct AccessStats {
    count: u64,
    last: Option<Instant>,
    size: u64,
    content_type: String,
    priority: Priority,
}

/// Unified cache manager
pub struct CacheManager {
    config: CacheConfig,
    registry: Arc<LayerRegistry>,
    engine: Arc<SyncEngine>,
    predictor: PredictionEngine,
    policy: RoutingPolicy,
    metrics: Arc<CacheMetrics>,
    history: Arc<OperationHistory>,
    access: DashMap<String, AccessStats>,
    network: RwLock<NetworkConditions>,
    suggestions: RwLock<Vec<String>>,
    codec: Arc<dyn Codec>,
    fetcher: Option<Arc<dyn AssetFetcher>>,
    sampler: Option<Arc<dyn NetworkSampler>>,
    /// Promotions and the optimization loop
    tasks: TaskTracker,
}

impl CacheManager {
    /// Open every configured layer.
    ///
    /// A layer that fails to open is recorded as failed and left out; the
    /// cache runs on the rest.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let mut layers: Vec<Arc<dyn LayerAdapter>> = Vec::new();
        let mut failures: Vec<(LayerId, String)> = Vec::new();

        if let Some(volatile) = &config.layers.volatile {
            layers.push(Arc::new(VolatileLayer::with_config(volatile.clone())));
        }
        if let Some(structured) = &config.layers.structured {
            match StructuredLayer::open(structured.clone()).await {
                Ok(layer) => layers.push(Arc::new(layer)),
                Err(e) => failures.push((LayerId::Structured, e.to_string())),
            }
        }
        if let Some(blob) = &config.layers.blob {
            match BlobLayer::open(blob.clone()).await {
                Ok(layer) => layers.push(Arc::new(layer)),
                Err(e) => failures.push((LayerId::Blob, e.to_string())),
            }
        }

        if layers.is_empty() {
            let reasons: Vec<String> = failures.iter().map(|(l, r)| format!("{}: {}", l, r)).collect();
            return Err(Error::Config(format!("no cache layer could be opened ({})", reasons.join("; "))));
        }

        let manager = Self::with_layers(config, layers)?;
        for (layer, reason) in failures {
            warn!(layer = %layer, reason = %reason, "Layer failed to open, continuing without it");
            manager.engine.mark_failed(layer, reason);
        }
        info!(layers = ?manager.registry.ids(), policy = %manager.policy.name, "Cache opened");
        Ok(manager)
    }

    /// Build over explicitly constructed layers
    pub fn with_layers(config: CacheConfig, layers: Vec<Arc<dyn LayerAdapter>>) -> Result<Self> {
        let registry = Arc::new(LayerRegistry::new(layers, config.sync.layer_timeout)?);
        let engine = Arc::new(SyncEngine::new(Arc::clone(&registry), config.sync.clone()));
        Ok(Self {
            predictor: PredictionEngine::new(config.prediction.clone()),
            policy: config.routing.clone(),
            history: Arc::new(OperationHistory::new(config.history_capacity)),
            config,
            registry,
            engine,
            metrics: Arc::new(CacheMetrics::new()),
            access: DashMap::new(),
            network: RwLock::new(NetworkConditions::default()),
            suggestions: RwLock::new(Vec::new()),
            codec: Arc::new(Lz4Codec::new()),
            fetcher: None,
            sampler: None,
            tasks: TaskTracker::new(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn AssetFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn NetworkSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Let a trained model override the layer heuristics
    pub fn with_trained_model(mut self, model: Arc<dyn TrainedModel>) -> Self {
        self.predictor = self.predictor.with_trained_model(model);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    /// Adapter for one layer
    pub fn layer(&self, id: LayerId) -> Option<&Arc<dyn LayerAdapter>> {
        self.registry.layer(id)
    }

    pub fn predictor(&self) -> &PredictionEngine {
        &self.predictor
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn history(&self) -> &OperationHistory {
        &self.history
    }

    pub fn sampler(&self) -> Option<&Arc<dyn NetworkSampler>> {
        self.sampler.as_ref()
    }

    pub fn layer_states(&self) -> BTreeMap<LayerId, LayerStatus> {
        self.engine.layer_states()
    }

    pub fn key_state(&self, key: &str) -> KeySyncState {
        self.engine.key_state(key)
    }

    pub fn network(&self) -> NetworkConditions {
        self.network.read().clone()
    }

    /// Latest network conditions, fed into every prediction
    pub fn update_network(&self, conditions: NetworkConditions) {
        *self.network.write() = conditions;
    }

    pub fn set_suggestions(&self, suggestions: Vec<String>) {
        *self.suggestions.write() = suggestions;
    }

    // =========================================================================
    // Prediction inputs
    // =========================================================================

    fn available_layers(&self) -> Vec<LayerId> {
        self.registry
            .layers()
            .iter()
            .filter(|l| l.is_available())
            .map(|l| l.id())
            .collect()
    }

    fn features(&self, key: &str) -> AccessFeatures {
        let stats = self.access.get(key).map(|s| s.clone()).unwrap_or_default();
        AccessFeatures {
            size: stats.size,
            content_type: stats.content_type,
            access_count: stats.count,
            age_ms: stats.last.map(|t| t.elapsed().as_millis() as u64),
            priority: stats.priority,
            network: self.network(),
        }
    }

    fn touch(&self, entry: &CacheEntry) {
        let mut stats = self.access.entry(entry.key.clone()).or_default();
        stats.count += 1;
        stats.last = Some(Instant::now());
        stats.size = entry.size;
        stats.content_type = entry.metadata.content_type.clone();
        stats.priority = entry.metadata.priority;
    }

    fn fits(&self, layer: LayerId, size: u64) -> bool {
        self.registry
            .layer(layer)
            .map(|l| size <= l.max_entry_size())
            .unwrap_or(false)
    }

    // =========================================================================
    // get
    // =========================================================================

    /// Look a key up; `None` when no layer holds it.
    ///
    /// Returns the entry exactly as the serving layer stores it, with the
    /// engine's view of layer presence attached.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        if self.engine.is_disposed() {
            return Err(Error::Disposed);
        }
        let started = Instant::now();
        let mut record = OperationRecord::new(OperationKind::Get, key);

        if self.engine.is_tombstoned(key) {
            self.metrics.record_not_found();
            record.duration_us = started.elapsed().as_micros() as u64;
            self.history.record(record);
            return Ok(None);
        }

        let available = self.available_layers();
        let recommended = self
            .predictor
            .predict_layer(&self.features(key), &available)
            .map(|p| p.recommended_layer);
        record.predicted = recommended;

        let order: Vec<LayerId> = recommended
            .into_iter()
            .chain(self.registry.ids().into_iter().filter(|l| Some(*l) != recommended))
            .collect();

        for layer in order {
            let lookup = Instant::now();
            match self.registry.fetch(layer, key).await {
                Ok(Some(entry)) if self.engine.is_superseded(key, layer, entry.sync_version) => {
                    debug!(layer = %layer, version = entry.sync_version, "Skipping superseded copy");
                    self.metrics.record_miss(layer, lookup.elapsed());
                }
                Ok(Some(mut entry)) => {
                    self.metrics.record_hit(layer, lookup.elapsed());
                    self.touch(&entry);

                    if let Some(target) = recommended.and_then(|r| self.policy.promotion_target(r, layer)) {
                        if self.fits(target, entry.size) {
                            self.spawn_promotion(entry.clone(), target);
                        }
                    }

                    let mut presence = self.engine.presence(key);
                    presence.insert(layer, LayerPresence::of(&entry));
                    entry.layer_presence = presence;

                    record.layers = vec![layer];
                    record.hit = true;
                    record.size = entry.size;
                    record.content_type = entry.metadata.content_type.clone();
                    record.priority = entry.metadata.priority;
                    record.duration_us = started.elapsed().as_micros() as u64;
                    self.history.record(record);
                    debug!(layer = %layer, version = entry.sync_version, "Cache hit");
                    return Ok(Some(entry));
                }
                Ok(None) => self.metrics.record_miss(layer, lookup.elapsed()),
                Err(e) => {
                    debug!(layer = %layer, error = %e, "Layer skipped on read");
                    self.metrics.record_miss(layer, lookup.elapsed());
                }
            }
        }

        self.metrics.record_not_found();
        record.duration_us = started.elapsed().as_micros() as u64;
        self.history.record(record);
        Ok(None)
    }

    /// Payload of `key` with lossless compression undone
    pub async fn read_payload(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(entry) = self.get(key).await? else {
            return Ok(None);
        };
        match &entry.compression_info {
            Some(info) if info.algorithm.is_lossless() => {
                self.codec.decompress(entry.payload(), info.algorithm).map(Some)
            }
            _ => Ok(Some(entry.payload().clone())),
        }
    }

    fn spawn_promotion(&self, entry: CacheEntry, target: LayerId) {
        if self.engine.is_disposed() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let metrics = Arc::clone(&self.metrics);
        let history = Arc::clone(&self.history);
        self.tasks.spawn(async move {
            let started = Instant::now();
            match engine.promote(&entry, target).await {
                Ok(GuardedWrite::Written) => {
                    metrics.record_promotion(target);
                    let mut record = OperationRecord::new(OperationKind::Promotion, entry.key.as_str());
                    record.layers = vec![target];
                    record.hit = true;
                    record.size = entry.size;
                    record.content_type = entry.metadata.content_type.clone();
                    record.priority = entry.metadata.priority;
                    record.duration_us = started.elapsed().as_micros() as u64;
                    history.record(record);
                    debug!(key = %entry.key, target = %target, "Promoted");
                }
                Ok(outcome) => debug!(key = %entry.key, target = %target, ?outcome, "Promotion skipped"),
                Err(e) => debug!(key = %entry.key, target = %target, error = %e, "Promotion failed"),
            }
        });
    }

    // =========================================================================
    // set
    // =========================================================================

    /// Store a payload.
    ///
    /// Succeeds when at least one layer accepted it; fails with
    /// `WriteFailedEverywhere` otherwise.
    #[instrument(skip(self, payload, meta), fields(key = %key, size = payload.len()))]
    pub async fn set(&self, key: &str, payload: Bytes, meta: WriteMetadata) -> Result<OperationResult> {
        if self.engine.is_disposed() {
            return Err(Error::Disposed);
        }
        let started = Instant::now();
        let original_size = payload.len() as u64;

        let features = AccessFeatures {
            size: original_size,
            content_type: meta.content_type.clone(),
            priority: meta.priority,
            ..self.features(key)
        };
        let available = self.available_layers();
        let primary = self
            .predictor
            .predict_layer(&features, &available)
            .map(|p| p.recommended_layer)
            .or_else(|| self.registry.ids().first().copied())
            .ok_or_else(|| Error::Internal("registry holds no layers".into()))?;

        let mut stored = payload;
        let mut compression_info = None;
        if self.policy.may_compress(primary) {
            let prediction = self.predictor.predict_compression(&features);
            if prediction.beneficial {
                if let Some(out) = compress_or_fallback(self.codec.as_ref(), &stored, &prediction.profile) {
                    self.metrics.record_compression(original_size, out.bytes.len() as u64);
                    compression_info = Some(CompressionInfo {
                        algorithm: out.algorithm,
                        ratio: out.ratio,
                        original_size,
                    });
                    stored = out.bytes;
                }
            }
        }

        let limits: Vec<(LayerId, u64)> = self
            .registry
            .layers()
            .iter()
            .map(|l| (l.id(), l.max_entry_size()))
            .collect();
        let targets = self.policy.targets(primary, meta.priority, stored.len() as u64, &limits);
        if targets.is_empty() {
            error!(size = stored.len(), "No layer can hold the entry");
            return Err(Error::WriteFailedEverywhere {
                key: key.to_string(),
                failures: vec![format!("no layer accepts {} bytes", stored.len())],
            });
        }

        let _guard = self.registry.lock_key(key).await;

        let observed = if self.engine.knows(key) {
            0
        } else {
            self.observed_version(key).await
        };
        let version = self.engine.next_version(key, observed);
        let mut entry = CacheEntry::with_version(key, stored, meta, version, Utc::now());
        entry.compression_info = compression_info;

        let writes = targets.iter().map(|layer| {
            let entry = &entry;
            async move {
                let t = Instant::now();
                let outcome = self.registry.store(*layer, key, entry).await;
                (*layer, outcome, t.elapsed())
            }
        });
        let mut written = Vec::new();
        let mut failed = Vec::new();
        let mut failures = Vec::new();
        for (layer, outcome, latency) in join_all(writes).await {
            match outcome {
                Ok(true) => {
                    self.metrics.record_write(layer, true, latency);
                    written.push(layer);
                }
                Ok(false) => {
                    self.metrics.record_write(layer, false, latency);
                    failures.push(format!("{} refused the entry", layer));
                    failed.push(layer);
                }
                Err(e) => {
                    self.metrics.record_write(layer, false, latency);
                    failures.push(e.to_string());
                    failed.push(layer);
                }
            }
        }

        if written.is_empty() {
            error!(failures = ?failures, "Write failed on every layer");
            let mut record = OperationRecord::new(OperationKind::Set, key);
            record.predicted = Some(primary);
            record.size = entry.size;
            record.duration_us = started.elapsed().as_micros() as u64;
            self.history.record(record);
            return Err(Error::WriteFailedEverywhere {
                key: key.to_string(),
                failures,
            });
        }

        // Drop copies the write did not replace so they cannot be served
        let mut unconfirmed = BTreeSet::new();
        for layer in self.registry.ids().into_iter().filter(|l| !targets.contains(l)) {
            match self.registry.remove(layer, key).await {
                Ok(true) => self.engine.record_absence(key, layer),
                Ok(false) => {
                    warn!(layer = %layer, "Stale copy not removed");
                    unconfirmed.insert(layer);
                }
                Err(e) => {
                    warn!(layer = %layer, error = %e, "Stale copy not removed");
                    unconfirmed.insert(layer);
                }
            }
        }

        let source = if written.contains(&primary) { primary } else { written[0] };
        self.engine.register_write(&entry, source, &written, &failed);
        self.engine.register_invalidation(key, version, unconfirmed);

        {
            let mut stats = self.access.entry(key.to_string()).or_default();
            stats.size = original_size;
            stats.content_type = entry.metadata.content_type.clone();
            stats.priority = entry.metadata.priority;
        }

        let mut record = OperationRecord::new(OperationKind::Set, key);
        record.predicted = Some(primary);
        record.layers = written.clone();
        record.hit = true;
        record.size = entry.size;
        record.content_type = entry.metadata.content_type.clone();
        record.priority = entry.metadata.priority;
        record.duration_us = started.elapsed().as_micros() as u64;
        self.history.record(record);

        debug!(version, written = ?written, failed = ?failed, "Stored");
        Ok(OperationResult {
            success: true,
            layers_written: written,
            failed_layers: failed,
            compression_used: entry.compression_info.is_some(),
            sync_version: version,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Highest version any reachable layer holds for a key the engine has
    /// not seen, such as one reloaded from disk
    async fn observed_version(&self, key: &str) -> u64 {
        let mut highest = 0;
        for layer in self.registry.ids() {
            if let Ok(Some(entry)) = self.registry.fetch(layer, key).await {
                highest = highest.max(entry.sync_version);
            }
        }
        highest
    }

    // =========================================================================
    // delete
    // =========================================================================

    /// Remove a key from every layer.
    ///
    /// Succeeds when every reachable layer confirmed; layers that could not
    /// be reached keep a tombstone that the background pass retries.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<OperationResult> {
        if self.engine.is_disposed() {
            return Err(Error::Disposed);
        }
        let started = Instant::now();
        let _guard = self.registry.lock_key(key).await;
        let version = self.engine.next_version(key, 0);

        let mut confirmed = Vec::new();
        let mut refused = Vec::new();
        let mut pending = BTreeSet::new();
        for layer in self.registry.ids() {
            match self.registry.remove(layer, key).await {
                Ok(true) => confirmed.push(layer),
                Ok(false) => {
                    refused.push(layer);
                    pending.insert(layer);
                }
                Err(e) => {
                    debug!(layer = %layer, error = %e, "Delete deferred");
                    pending.insert(layer);
                }
            }
        }
        self.engine.register_delete(key, version, pending.clone());
        self.access.remove(key);

        let mut record = OperationRecord::new(OperationKind::Delete, key);
        record.layers = confirmed.clone();
        record.hit = refused.is_empty();
        record.duration_us = started.elapsed().as_micros() as u64;
        self.history.record(record);

        Ok(OperationResult {
            success: refused.is_empty(),
            layers_written: confirmed,
            failed_layers: pending.into_iter().collect(),
            compression_used: false,
            sync_version: version,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    // =========================================================================
    // Fetch-through
    // =========================================================================

    /// Cached payload for `bucket/path`, fetched and stored on a miss
    #[instrument(skip(self, options), fields(bucket = %bucket, path = %path))]
    pub async fn fetch_through(&self, bucket: &str, path: &str, options: FetchOptions) -> Result<Bytes> {
        let key = format!("{}/{}", bucket, path);
        if options.use_cache {
            if let Some(payload) = self.read_payload(&key).await? {
                return Ok(payload);
            }
        }
        let fetcher = self.fetcher.as_ref().ok_or_else(|| Error::Fetch {
            bucket: bucket.to_string(),
            path: path.to_string(),
            reason: "no asset fetcher configured".into(),
        })?;
        let payload = fetcher
            .fetch_asset(bucket, path, &options)
            .await
            .map_err(|e| match e {
                e @ Error::Fetch { .. } => e,
                other => Error::Fetch {
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                    reason: other.to_string(),
                },
            })?;

        if options.use_cache {
            let meta = WriteMetadata::new(content_type_for(path)).with_priority(options.priority);
            if let Err(e) = self.set(&key, payload.clone(), meta).await {
                warn!(key = %key, error = %e, "Fetched asset not cached");
            }
        }
        Ok(payload)
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    pub async fn synchronize(
        &self,
        key: &str,
        source: LayerId,
        targets: Option<Vec<LayerId>>,
        options: SyncOptions,
    ) -> Result<SyncResult> {
        self.engine.synchronize(key, source, targets, options).await
    }

    pub async fn full_sync(&self, options: FullSyncOptions) -> Result<SyncResult> {
        self.engine.full_sync(options).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict: &ConflictInfo,
        strategy: Option<ResolutionStrategy>,
    ) -> ConflictResolutionResult {
        self.engine.resolve_conflict(conflict, strategy).await
    }

    /// Copy the most-read keys into the layer the model now recommends.
    ///
    /// Returns how many copies were written.
    pub async fn rebalance(&self, max_moves: usize) -> usize {
        let mut reads: HashMap<String, u64> = HashMap::new();
        for record in self.history.snapshot() {
            if record.kind == OperationKind::Get && record.hit {
                *reads.entry(record.key).or_default() += 1;
            }
        }
        let mut hottest: Vec<(String, u64)> = reads.into_iter().collect();
        hottest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let available = self.available_layers();
        let cancel = self.engine.cancel_token();
        let mut moved = 0;
        for (key, _) in hottest {
            if moved >= max_moves || cancel.is_cancelled() {
                break;
            }
            if self.engine.is_tombstoned(&key) {
                continue;
            }
            let Some(prediction) = self.predictor.predict_layer(&self.features(&key), &available) else {
                break;
            };
            let target = prediction.recommended_layer;
            let presence = self.engine.presence(&key);
            if presence.get(&target).map(|p| p.present).unwrap_or(false) {
                continue;
            }
            let Some(source) = presence.iter().filter(|(_, p)| p.present).map(|(l, _)| *l).min() else {
                continue;
            };
            let entry = match self.registry.fetch(source, &key).await {
                Ok(Some(entry)) if self.fits(target, entry.size) => entry,
                _ => continue,
            };
            match self.engine.promote(&entry, target).await {
                Ok(GuardedWrite::Written) => {
                    self.metrics.record_promotion(target);
                    moved += 1;
                }
                Ok(_) => {}
                Err(e) => debug!(key = %key, target = %target, error = %e, "Rebalance copy failed"),
            }
        }
        if moved > 0 {
            info!(moved, "Rebalanced hot entries");
        }
        moved
    }

    // =========================================================================
    // Analytics
    // =========================================================================

    pub fn get_analytics(&self) -> Analytics {
        let sync = self.engine.stats();
        let mut hit_rates = BTreeMap::new();
        let mut layers = BTreeMap::new();
        for layer in self.registry.layers() {
            let id = layer.id();
            hit_rates.insert(id, self.metrics.hit_ratio(id));
            layers.insert(id, self.metrics.layer_snapshot(id, layer.stats()));
        }
        Analytics {
            generated_at: Utc::now(),
            hit_rates,
            layers,
            overall_hit_rate: self.metrics.overall_hit_ratio(),
            compression_efficiency: self.metrics.compression_efficiency(),
            conflict_rate: sync.conflicts_detected as f64 / sync.sync_operations.max(1) as f64,
            conflicts_detected: sync.conflicts_detected,
            conflicts_resolved: sync.conflicts_resolved,
            conflicts_queued: sync.conflicts_queued,
            sync_operations: sync.sync_operations,
            history_len: self.history.len(),
            optimization_suggestions: self.suggestions.read().clone(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the engine's sync loop and the optimization loop
    pub fn start_background(self: &Arc<Self>) {
        self.engine.spawn_sync_loop();
        let optimizer = crate::optimizer::OptimizationLoop::new(Arc::clone(self), self.config.optimizer.clone());
        let cancel = self.engine.cancel_token();
        self.tasks.spawn(async move { optimizer.run(cancel).await });
        info!(
            sync_interval_ms = self.config.sync.sync_interval.as_millis() as u64,
            tick_interval_ms = self.config.optimizer.tick_interval.as_millis() as u64,
            "Background loops started"
        );
    }

    /// Stop background work, flush pending obligations and close the layers
    /// to writes. Idempotent.
    pub async fn dispose(&self) {
        info!("Disposing cache");
        self.engine.cancel_token().cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.engine.dispose().await;
        info!("Cache disposed");
    }
}

/// Content type guessed from a path extension
fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "wav" => "audio/wav",
        "aif" | "aiff" => "audio/aiff",
        "mid" | "midi" => "audio/midi",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "opus" => "audio/opus",
        "flac" => "audio/flac",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

// =============================================================================
// Tests
// =============================================================================
