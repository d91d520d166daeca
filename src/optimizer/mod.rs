//! Optimization Loop
//!
//! Periodic housekeeping over a running cache:
//!
//! 1. sample network conditions (when a sampler is configured)
//! 2. derive suggestions from analytics and recent history
//! 3. copy hot keys into the layer the model recommends
//! 4. refit prediction parameters once enough new history exists
//! 5. drain queued conflicts
//! 6. drop idle per-key locks
//!
//! A tick never runs concurrently with itself; one that is due while the
//! previous is still running is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::history::{OperationKind, OperationRecord};
use crate::cache::layer::LayerId;
use crate::cache::manager::CacheManager;
use crate::cache::metrics::Analytics;
use crate::config::OptimizerConfig;

/// Layers with less traffic than this get no hit-rate advice
const MIN_LAYER_TRAFFIC: u64 = 20;
const LOW_HIT_RATE: f64 = 0.3;
/// Reads with a prediction needed before judging its accuracy
const MIN_PREDICTION_SAMPLES: usize = 20;
const LOW_PREDICTION_ACCURACY: f64 = 0.5;
const HIGH_CONFLICT_RATE: f64 = 0.1;
const LOW_COMPRESSION_SAVINGS: f64 = 0.1;
/// Reads after which a key counts as hot
const HOT_KEY_READS: u64 = 3;

/// What one tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// The previous tick was still running
    pub skipped: bool,
    pub network_sampled: bool,
    pub suggestions: Vec<String>,
    pub entries_moved: usize,
    pub retrained: bool,
    pub conflicts_drained: usize,
    pub locks_pruned: usize,
    pub duration_ms: u64,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic optimizer bound to one cache
pub struct OptimizationLoop {
    cache: Arc<CacheManager>,
    config: OptimizerConfig,
    running: AtomicBool,
    /// History sequence number the parameters were last fit up to
    trained_seq: AtomicU64,
    ticks: AtomicU64,
}

impl OptimizationLoop {
    pub fn new(cache: Arc<CacheManager>, config: OptimizerConfig) -> Self {
        Self {
            cache,
            config,
            running: AtomicBool::new(false),
            trained_seq: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    /// Completed ticks
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Tick on the configured interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "Optimization loop started"
        );
        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; start one interval in
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Optimization loop shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let report = self.tick().await;
                    if !report.skipped {
                        debug!(
                            moved = report.entries_moved,
                            retrained = report.retrained,
                            drained = report.conflicts_drained,
                            suggestions = report.suggestions.len(),
                            "Optimization tick complete"
                        );
                    }
                }
            }
        }
    }

    /// Run one tick now; skipped when another is in progress
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Optimization tick still running, skipping");
            return TickReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = TickGuard(&self.running);
        let started = Instant::now();
        let mut report = TickReport::default();

        if let Some(sampler) = self.cache.sampler() {
            match sampler.sample().await {
                Ok(conditions) => {
                    self.cache.update_network(conditions);
                    report.network_sampled = true;
                }
                Err(e) => warn!("Network sampling failed, keeping last conditions: {}", e),
            }
        }

        let history = self.cache.history().snapshot();
        report.suggestions = suggest(&self.cache.get_analytics(), &history);

        report.entries_moved = self.cache.rebalance(self.config.max_rebalance_moves).await;

        let since = self.trained_seq.load(Ordering::Acquire);
        let fresh = history.iter().filter(|r| r.seq > since).count();
        if fresh >= self.config.min_retrain_samples {
            if let Some(params) = self
                .cache
                .predictor()
                .retrain(&history, self.config.min_retrain_samples)
            {
                let last = history.last().map(|r| r.seq).unwrap_or(since);
                self.trained_seq.store(last, Ordering::Release);
                report.retrained = true;
                info!(
                    samples = history.len(),
                    half_life_ms = params.recency_half_life_ms,
                    "Prediction parameters refit"
                );
            }
        }

        report.conflicts_drained = self
            .cache
            .engine()
            .drain_conflicts(self.config.conflict_drain_batch)
            .await;

        self.cache.set_suggestions(report.suggestions.clone());
        report.locks_pruned = self.cache.registry().prune_locks();
        report.duration_ms = started.elapsed().as_millis() as u64;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        report
    }
}

/// Layer-distribution advice from current analytics and history
pub fn suggest(analytics: &Analytics, history: &[OperationRecord]) -> Vec<String> {
    let mut out = Vec::new();

    for (layer, stats) in &analytics.layers {
        if stats.hits + stats.misses >= MIN_LAYER_TRAFFIC && stats.hit_rate < LOW_HIT_RATE {
            out.push(format!(
                "{} layer hit rate is {:.0}%; consider raising its capacity or routing fewer keys to it",
                layer,
                stats.hit_rate * 100.0
            ));
        }
    }

    let predicted: Vec<&OperationRecord> = history
        .iter()
        .filter(|r| r.kind == OperationKind::Get && r.hit && r.predicted.is_some())
        .collect();
    if predicted.len() >= MIN_PREDICTION_SAMPLES {
        let correct = predicted.iter().filter(|r| r.prediction_correct()).count();
        let accuracy = correct as f64 / predicted.len() as f64;
        if accuracy < LOW_PREDICTION_ACCURACY {
            out.push(format!(
                "layer predictions matched the serving layer for {:.0}% of reads; retraining is due",
                accuracy * 100.0
            ));
        }
    }

    if analytics.sync_operations > 0 && analytics.conflict_rate > HIGH_CONFLICT_RATE {
        out.push(format!(
            "{:.0}% of sync operations hit a conflict; check for writers racing on the same keys",
            analytics.conflict_rate * 100.0
        ));
    }
    if analytics.conflicts_queued > 0 {
        out.push(format!(
            "{} conflicts are waiting for resolution",
            analytics.conflicts_queued
        ));
    }

    if analytics.compression_efficiency > 0.0 && analytics.compression_efficiency < LOW_COMPRESSION_SAVINGS {
        out.push(format!(
            "compression saves only {:.0}% of stored bytes; consider disabling it",
            analytics.compression_efficiency * 100.0
        ));
    }

    let mut slow_reads: HashMap<&str, u64> = HashMap::new();
    for record in history
        .iter()
        .filter(|r| r.kind == OperationKind::Get && r.hit && r.layers.first() == Some(&LayerId::Blob))
    {
        *slow_reads.entry(record.key.as_str()).or_default() += 1;
    }
    let hot = slow_reads.values().filter(|n| **n >= HOT_KEY_READS).count();
    if hot > 0 {
        out.push(format!("{} hot keys are still served from the blob layer", hot));
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
