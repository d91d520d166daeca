//! Cache Metrics Collection
//!
//! Per-layer hit/miss/latency counters, the `Analytics` report built from
//! them, and its Prometheus text rendering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use super::layer::{LayerId, LayerStats};
use crate::error::Result;

#[derive(Debug, Default)]
struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    promotions: AtomicU64,
    // Exponential moving averages in microseconds
    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    layers: [LayerCounters; 3],
    not_found: AtomicU64,
    compressed_writes: AtomicU64,
    bytes_before_compression: AtomicU64,
    bytes_after_compression: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn layer(&self, id: LayerId) -> &LayerCounters {
        &self.layers[id.index()]
    }

    pub fn record_hit(&self, id: LayerId, latency: Duration) {
        let layer = self.layer(id);
        layer.hits.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&layer.read_latency_us, latency);
    }

    pub fn record_miss(&self, id: LayerId, latency: Duration) {
        let layer = self.layer(id);
        layer.misses.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&layer.read_latency_us, latency);
    }

    /// A `get` that found the key nowhere
    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, id: LayerId, ok: bool, latency: Duration) {
        let layer = self.layer(id);
        if ok {
            layer.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            layer.write_failures.fetch_add(1, Ordering::Relaxed);
        }
        update_latency_ema(&layer.write_latency_us, latency);
    }

    pub fn record_promotion(&self, target: LayerId) {
        self.layer(target).promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self, original: u64, stored: u64) {
        self.compressed_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_before_compression
            .fetch_add(original, Ordering::Relaxed);
        self.bytes_after_compression.fetch_add(stored, Ordering::Relaxed);
    }

    pub fn hits(&self, id: LayerId) -> u64 {
        self.layer(id).hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self, id: LayerId) -> u64 {
        self.layer(id).misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self, id: LayerId) -> u64 {
        self.layer(id).promotions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self, id: LayerId) -> f64 {
        let hits = self.hits(id) as f64;
        let total = hits + self.misses(id) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Fraction of lookups served by any layer
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits: u64 = LayerId::ALL.iter().map(|id| self.hits(*id)).sum();
        // Only count final misses
        let total = hits + self.not_found.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Bytes saved by compression as a fraction of the original bytes
    pub fn compression_efficiency(&self) -> f64 {
        let before = self.bytes_before_compression.load(Ordering::Relaxed);
        let after = self.bytes_after_compression.load(Ordering::Relaxed);
        if before == 0 {
            0.0
        } else {
            1.0 - after as f64 / before as f64
        }
    }

    /// Snapshot of one layer's counters
    pub fn layer_snapshot(&self, id: LayerId, stats: LayerStats) -> LayerAnalytics {
        let layer = self.layer(id);
        LayerAnalytics {
            hits: self.hits(id),
            misses: self.misses(id),
            hit_rate: self.hit_ratio(id),
            writes: layer.writes.load(Ordering::Relaxed),
            write_failures: layer.write_failures.load(Ordering::Relaxed),
            promotions: self.promotions(id),
            read_latency_us: layer.read_latency_us.load(Ordering::Relaxed),
            write_latency_us: layer.write_latency_us.load(Ordering::Relaxed),
            stats,
        }
    }

    pub fn compressed_writes(&self) -> u64 {
        self.compressed_writes.load(Ordering::Relaxed)
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

// =============================================================================
// Analytics Report
// =============================================================================

/// Metrics for one layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerAnalytics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub writes: u64,
    pub write_failures: u64,
    pub promotions: u64,
    pub read_latency_us: u64,
    pub write_latency_us: u64,
    /// Adapter-reported statistics
    pub stats: LayerStats,
}

/// Result of `get_analytics`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analytics {
    pub generated_at: DateTime<Utc>,
    pub hit_rates: BTreeMap<LayerId, f64>,
    pub layers: BTreeMap<LayerId, LayerAnalytics>,
    pub overall_hit_rate: f64,
    pub compression_efficiency: f64,
    /// Conflicts detected per sync operation
    pub conflict_rate: f64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub conflicts_queued: usize,
    pub sync_operations: u64,
    pub history_len: usize,
    pub optimization_suggestions: Vec<String>,
}

/// Render analytics in the Prometheus text exposition format
pub fn render_prometheus(analytics: &Analytics) -> Result<String> {
    let registry = Registry::new_custom(Some("layercast".into()), None)?;

    let hit_rate = GaugeVec::new(Opts::new("layer_hit_rate", "Hit rate per layer"), &["layer"])?;
    let hits = IntGaugeVec::new(Opts::new("layer_hits", "Hits per layer"), &["layer"])?;
    let misses = IntGaugeVec::new(Opts::new("layer_misses", "Misses per layer"), &["layer"])?;
    let entries = IntGaugeVec::new(Opts::new("layer_entries", "Entries per layer"), &["layer"])?;
    let bytes = IntGaugeVec::new(Opts::new("layer_bytes", "Bytes per layer"), &["layer"])?;
    let read_latency = IntGaugeVec::new(
        Opts::new("layer_read_latency_us", "Read latency EMA per layer"),
        &["layer"],
    )?;
    registry.register(Box::new(hit_rate.clone()))?;
    registry.register(Box::new(hits.clone()))?;
    registry.register(Box::new(misses.clone()))?;
    registry.register(Box::new(entries.clone()))?;
    registry.register(Box::new(bytes.clone()))?;
    registry.register(Box::new(read_latency.clone()))?;

    for (id, layer) in &analytics.layers {
        let label = [id.name()];
        hit_rate.with_label_values(&label).set(layer.hit_rate);
        hits.with_label_values(&label).set(layer.hits as i64);
        misses.with_label_values(&label).set(layer.misses as i64);
        entries.with_label_values(&label).set(layer.stats.entries as i64);
        bytes.with_label_values(&label).set(layer.stats.size_bytes as i64);
        read_latency
            .with_label_values(&label)
            .set(layer.read_latency_us as i64);
    }

    let scalars = [
        ("overall_hit_rate", "Fraction of lookups served", analytics.overall_hit_rate),
        ("compression_efficiency", "Bytes saved by compression", analytics.compression_efficiency),
        ("conflict_rate", "Conflicts per sync operation", analytics.conflict_rate),
        ("conflicts_queued", "Conflicts awaiting resolution", analytics.conflicts_queued as f64),
    ];
    for (name, help, value) in scalars {
        let gauge = prometheus::Gauge::new(name, help)?;
        gauge.set(value);
        registry.register(Box::new(gauge))?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| crate::error::Error::Internal(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
