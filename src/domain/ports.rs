//! Domain Ports (Port/Adapter Pattern)
//!
//! External collaborators the cache consumes as black boxes. Infrastructure
//! adapters (a CDN client, a platform network probe) implement these traits
//! and are injected at construction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Cache Manager                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │      AssetFetcher      │      NetworkSampler         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │        CDN / HTTP client      │     OS network probe         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::entry::Priority;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Kind of network link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Cellular,
    Offline,
    Unknown,
}

/// Sampled network conditions.
///
/// `Default` describes a healthy unknown link and is used whenever no
/// sampler is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConditions {
    pub bandwidth_kbps: u64,
    pub latency_ms: u64,
    pub connection_type: ConnectionType,
    /// Link stability (0.0 - 1.0)
    pub stability: f64,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            bandwidth_kbps: 10_000,
            latency_ms: 50,
            connection_type: ConnectionType::Unknown,
            stability: 1.0,
        }
    }
}

impl NetworkConditions {
    /// Link slow or unreliable enough that refetching is expensive
    pub fn is_constrained(&self) -> bool {
        self.connection_type == ConnectionType::Offline
            || self.bandwidth_kbps < 1_000
            || self.latency_ms > 300
            || self.stability < 0.5
    }

    /// Network quality (0.0 = unusable, 1.0 = excellent)
    pub fn quality(&self) -> f64 {
        if self.connection_type == ConnectionType::Offline {
            return 0.0;
        }
        let bandwidth = (self.bandwidth_kbps as f64 / 10_000.0).min(1.0);
        let latency = 1.0 - (self.latency_ms as f64 / 1_000.0).min(1.0);
        (bandwidth * 0.4 + latency * 0.3 + self.stability.clamp(0.0, 1.0) * 0.3).clamp(0.0, 1.0)
    }
}

/// Options for an asset fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOptions {
    pub priority: Priority,
    /// Serve from (and store into) the cache
    pub use_cache: bool,
    /// Preferred quality (0.0 - 1.0)
    pub quality_preference: f32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            use_cache: true,
            quality_preference: 1.0,
        }
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Network / CDN asset download.
///
/// Errors are surfaced to the caller as-is; retries are the caller's policy.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch_asset(&self, bucket: &str, path: &str, options: &FetchOptions) -> Result<Bytes>;
}

/// Periodic network-condition sampling
#[async_trait]
pub trait NetworkSampler: Send + Sync {
    async fn sample(&self) -> Result<NetworkConditions>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_conditions_not_constrained() {
        let conditions = NetworkConditions::default();
        assert!(!conditions.is_constrained());
        assert!(conditions.quality() > 0.9);
    }

    #[test]
    fn test_constrained_links() {
        let offline = NetworkConditions {
            connection_type: ConnectionType::Offline,
            ..Default::default()
        };
        assert!(offline.is_constrained());
        assert_eq!(offline.quality(), 0.0);

        let slow = NetworkConditions {
            bandwidth_kbps: 200,
            latency_ms: 600,
            connection_type: ConnectionType::Cellular,
            stability: 0.4,
        };
        assert!(slow.is_constrained());
        assert!(slow.quality() < 0.3);
    }

    #[test]
    fn test_fetch_options_defaults() {
        let options = FetchOptions::default();
        assert!(options.use_cache);
        assert_eq!(options.priority, Priority::Normal);
    }
}
