//! Layer Synchronization
//!
//! Keeps the copies of a key held by different layers consistent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SyncEngine                           │
//! │  ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐  │
//! │  │  SyncState   │  │   conflict    │  │     resolver     │  │
//! │  │ per-key FSM  │─▶│   detection   │─▶│ (total function) │  │
//! │  │  tombstones  │  │ + conflict Q  │  │                  │  │
//! │  └──────────────┘  └───────────────┘  └──────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ version-checked writes
//!                               ▼
//!                         LayerRegistry
//! ```
//!
//! Per-key lifecycle: `consistent → pending_sync → conflicted → resolving →
//! consistent`, with `resolving → conflicted` on failure (bounded retries).

pub mod conflict;
pub mod engine;
pub mod resolver;
pub mod state;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::entry::{Priority, AUTHORITATIVE_TAG};
use crate::cache::layer::LayerId;
use crate::config::duration_ms;
use crate::error::{Error, Result};

pub use conflict::{ConflictInfo, ConflictType, DetectionRules, Severity};
pub use engine::SyncEngine;
pub use resolver::{ConflictResolutionResult, ConflictResolver, Resolution, ResolutionStrategy, StrategyTable};
pub use state::{Invalidation, KeySyncState, LayerStatus, SyncOpStatus, SyncOperation, SyncState, Tombstone};

/// Synchronization engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Budget for a single adapter call
    #[serde(rename = "layer_timeout_ms", with = "duration_ms")]
    pub layer_timeout: Duration,
    /// Budget for one `synchronize` call
    #[serde(rename = "synchronize_timeout_ms", with = "duration_ms")]
    pub synchronize_timeout: Duration,
    /// Budget for one full sync
    #[serde(rename = "full_sync_timeout_ms", with = "duration_ms")]
    pub full_sync_timeout: Duration,
    /// Modification times further apart than this are a timestamp conflict
    pub timestamp_skew_ms: i64,
    /// Order in which conflict types are checked
    pub detection_order: Vec<ConflictType>,
    /// Default strategy per conflict type
    pub strategies: StrategyTable,
    /// Tag marking the authoritative copy for `server_wins`
    pub authoritative_tag: String,
    /// Resolution attempts before a queued conflict is abandoned
    pub max_resolution_attempts: u32,
    /// Interval of the background pending-sync pass
    #[serde(rename = "sync_interval_ms", with = "duration_ms")]
    pub sync_interval: Duration,
    /// Pending operations processed per pass
    pub pending_batch_size: usize,
    /// Resolved conflicts kept for inspection
    pub archive_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            layer_timeout: Duration::from_millis(500),
            synchronize_timeout: Duration::from_secs(5),
            full_sync_timeout: Duration::from_secs(120),
            timestamp_skew_ms: 1000,
            detection_order: vec![ConflictType::Version, ConflictType::Timestamp, ConflictType::Content],
            strategies: StrategyTable::default(),
            authoritative_tag: AUTHORITATIVE_TAG.to_string(),
            max_resolution_attempts: 3,
            sync_interval: Duration::from_secs(5),
            pending_batch_size: 256,
            archive_capacity: 1000,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.layer_timeout.is_zero() || self.synchronize_timeout.is_zero() || self.full_sync_timeout.is_zero() {
            return Err(Error::Config("sync timeouts must be non-zero".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::Config("sync interval must be non-zero".into()));
        }
        if self.detection_order.is_empty() {
            return Err(Error::Config("detection_order must name at least one conflict type".into()));
        }
        if self.max_resolution_attempts == 0 {
            return Err(Error::Config("max_resolution_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn detection_rules(&self) -> DetectionRules {
        DetectionRules {
            order: self.detection_order.clone(),
            timestamp_skew_ms: self.timestamp_skew_ms,
        }
    }
}

/// Options for `synchronize`
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub priority: Priority,
    /// Overrides the per-type default strategy
    pub strategy: Option<ResolutionStrategy>,
    /// Overrides the configured synchronize timeout
    pub timeout: Option<Duration>,
}

/// Options for `full_sync`
#[derive(Debug, Clone, Default)]
pub struct FullSyncOptions {
    /// Overrides the per-type default strategy
    pub strategy: Option<ResolutionStrategy>,
    /// Overrides the configured full-sync timeout
    pub timeout: Option<Duration>,
    /// Caller-side cancellation, in addition to the engine's own
    pub cancel: Option<CancellationToken>,
}

/// Outcome of `synchronize` or `full_sync`.
///
/// Partial success is explicit: `synced_layers` and `failed_layers` say
/// which layers ended up consistent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub synced_layers: Vec<LayerId>,
    pub failed_layers: Vec<LayerId>,
    pub conflicts: Vec<ConflictInfo>,
    pub keys_examined: usize,
    pub writes_applied: usize,
    pub failures: Vec<String>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl SyncResult {
    pub(crate) fn fail(&mut self, layer: Option<LayerId>, reason: impl Into<String>) {
        if let Some(layer) = layer {
            if !self.failed_layers.contains(&layer) {
                self.failed_layers.push(layer);
            }
            self.synced_layers.retain(|l| *l != layer);
        }
        self.failures.push(reason.into());
    }

    pub(crate) fn synced(&mut self, layer: LayerId) {
        if !self.synced_layers.contains(&layer) && !self.failed_layers.contains(&layer) {
            self.synced_layers.push(layer);
        }
    }

    pub(crate) fn finish(mut self, started: std::time::Instant) -> Self {
        self.synced_layers.sort();
        self.failed_layers.sort();
        self.success = !self.cancelled && self.failures.is_empty();
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
