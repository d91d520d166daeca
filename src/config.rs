//! Cache Configuration
//!
//! One serde tree for the whole cache, loadable from YAML or JSON. Every
//! section has defaults, so an empty file is a valid configuration.
//!
//! ```yaml
//! layers:
//!   volatile:
//!     capacity: 268435456
//!   structured:
//!     root_dir: /var/lib/layercast/structured
//!   blob:
//!     root_dir: /var/lib/layercast/blob
//! sync:
//!   timestamp_skew_ms: 1000
//!   detection_order: [version, timestamp, content]
//! optimizer:
//!   tick_interval_ms: 60000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::blob::BlobConfig;
use crate::cache::policy::RoutingPolicy;
use crate::cache::prediction::ModelParameters;
use crate::cache::structured::StructuredConfig;
use crate::cache::volatile::VolatileConfig;
use crate::error::{Error, Result};
use crate::sync::SyncConfig;

/// Default operation-history capacity
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// Serde helper storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Which layers to open.
///
/// Without a `layers` section all three are opened with defaults; inside one,
/// a missing layer is not used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayersConfig {
    #[serde(default)]
    pub volatile: Option<VolatileConfig>,
    #[serde(default)]
    pub structured: Option<StructuredConfig>,
    #[serde(default)]
    pub blob: Option<BlobConfig>,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            volatile: Some(VolatileConfig::default()),
            structured: Some(StructuredConfig::default()),
            blob: Some(BlobConfig::default()),
        }
    }
}

/// Optimization loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    #[serde(rename = "tick_interval_ms", with = "duration_ms")]
    pub tick_interval: Duration,
    /// New history records needed before parameters are refit
    pub min_retrain_samples: usize,
    /// Queued conflicts drained per tick
    pub conflict_drain_batch: usize,
    /// Entries moved between layers per tick
    pub max_rebalance_moves: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            min_retrain_samples: 100,
            conflict_drain_batch: 50,
            max_rebalance_moves: 64,
        }
    }
}

/// Complete cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub layers: LayersConfig,
    pub routing: RoutingPolicy,
    pub prediction: ModelParameters,
    pub sync: SyncConfig,
    pub optimizer: OptimizerConfig,
    pub history_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            layers: LayersConfig::default(),
            routing: RoutingPolicy::default(),
            prediction: ModelParameters::default(),
            sync: SyncConfig::default(),
            optimizer: OptimizerConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// In-memory configuration for all three layers
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from a YAML (`.yaml`/`.yml`) or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: CacheConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if let Some(v) = &self.layers.volatile {
            if v.capacity == 0 {
                return Err(Error::Config("volatile capacity must be non-zero".into()));
            }
            if !(0.0 < v.low_watermark && v.low_watermark < v.high_watermark && v.high_watermark <= 1.0) {
                return Err(Error::Config(format!(
                    "volatile watermarks must satisfy 0 < low < high <= 1 (low {}, high {})",
                    v.low_watermark, v.high_watermark
                )));
            }
        }
        if let Some(s) = &self.layers.structured {
            if s.capacity == 0 {
                return Err(Error::Config("structured capacity must be non-zero".into()));
            }
        }
        if self.layers.volatile.is_none() && self.layers.structured.is_none() && self.layers.blob.is_none() {
            return Err(Error::Config("no cache layers configured".into()));
        }
        if self.history_capacity == 0 {
            return Err(Error::Config("history_capacity must be non-zero".into()));
        }
        if self.optimizer.tick_interval.is_zero() {
            return Err(Error::Config("optimizer tick interval must be non-zero".into()));
        }
        self.sync.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::conflict::ConflictType;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.history_capacity, 10_000);
        assert_eq!(config.optimizer.tick_interval, Duration::from_secs(60));
        assert_eq!(config.sync.timestamp_skew_ms, 1000);
    }

    #[test]
    fn test_yaml_overrides_and_defaults() {
        let yaml = r#"
layers:
  volatile:
    capacity: 1048576
  blob: {}
sync:
  detection_order: [content, version]
  max_resolution_attempts: 5
optimizer:
  tick_interval_ms: 250
"#;
        let config: CacheConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.layers.volatile.as_ref().unwrap().capacity, 1_048_576);
        assert_eq!(config.layers.volatile.as_ref().unwrap().high_watermark, 0.90);
        // Explicit `layers` section without structured disables it
        assert!(config.layers.structured.is_none());
        assert!(config.layers.blob.is_some());
        assert_eq!(
            config.sync.detection_order,
            vec![ConflictType::Content, ConflictType::Version]
        );
        assert_eq!(config.sync.max_resolution_attempts, 5);
        assert_eq!(config.optimizer.tick_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let mut config = CacheConfig::default();
        if let Some(v) = config.layers.volatile.as_mut() {
            v.low_watermark = 0.95;
        }
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_no_layers() {
        let mut config = CacheConfig::default();
        config.optimizer.tick_interval = Duration::ZERO;
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig {
            layers: LayersConfig {
                volatile: None,
                structured: None,
                blob: None,
            },
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_from_file_json() {
        let path = std::env::temp_dir().join(format!("layercast-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"history_capacity": 42}"#).unwrap();
        let config = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config.history_capacity, 42);
        let _ = std::fs::remove_file(path);
    }
}
