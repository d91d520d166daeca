//! Routing Policy
//!
//! Decides which layers a `set` writes to, given the predicted primary layer,
//! and where a read-triggered promotion goes.

use serde::{Deserialize, Serialize};

use super::entry::Priority;
use super::layer::LayerId;

/// Write routing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Name of the policy
    pub name: String,
    /// Entries at or above this priority are also written to every
    /// persistent layer that can hold them
    pub persist_priority: Priority,
    /// Entries at or above this priority are also kept in the volatile layer
    /// when they fit, whatever the predicted primary
    pub warm_priority: Priority,
    /// Write every entry to the persistent layers as well
    pub always_persist: bool,
    /// Allow compressing payloads
    pub compression_enabled: bool,
    /// Compress even when the primary layer is volatile
    pub compress_volatile: bool,
    /// Copy entries found in a slower layer into the predicted one
    pub promote_on_read: bool,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::balanced()
    }
}

impl RoutingPolicy {
    /// Balanced policy (default)
    pub fn balanced() -> Self {
        Self {
            name: "Balanced".to_string(),
            persist_priority: Priority::High,
            warm_priority: Priority::High,
            always_persist: false,
            compression_enabled: true,
            compress_volatile: false,
            promote_on_read: true,
        }
    }

    /// Durable policy
    ///
    /// Every write also lands in persistent storage.
    pub fn durable() -> Self {
        Self {
            name: "Durable".to_string(),
            always_persist: true,
            ..Self::balanced()
        }
    }

    /// Layers a write goes to, in fallback order.
    ///
    /// `layers` lists the registered layers with their maximum entry size.
    /// The primary is replaced by the next layer that can hold the entry when
    /// it cannot. Empty when no layer can hold it.
    pub fn targets(
        &self,
        primary: LayerId,
        priority: Priority,
        size: u64,
        layers: &[(LayerId, u64)],
    ) -> Vec<LayerId> {
        let fits = |id: LayerId| layers.iter().any(|(l, max)| *l == id && size <= *max);

        let primary = if fits(primary) {
            Some(primary)
        } else {
            layers
                .iter()
                .map(|(l, _)| *l)
                .filter(|l| *l > primary)
                .chain(layers.iter().map(|(l, _)| *l))
                .find(|l| fits(*l))
        };
        let Some(primary) = primary else {
            return Vec::new();
        };

        let persist = self.always_persist || priority >= self.persist_priority;
        let warm = priority >= self.warm_priority;
        let mut targets: Vec<LayerId> = layers
            .iter()
            .map(|(l, _)| *l)
            .filter(|l| {
                *l == primary
                    || (persist && l.is_persistent() && fits(*l))
                    || (warm && !l.is_persistent() && fits(*l))
            })
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Whether a payload bound for `primary` may be compressed
    pub fn may_compress(&self, primary: LayerId) -> bool {
        self.compression_enabled && (primary.is_persistent() || self.compress_volatile)
    }

    /// Layer to copy an entry into after it was found in `found`
    pub fn promotion_target(&self, recommended: LayerId, found: LayerId) -> Option<LayerId> {
        (self.promote_on_read && recommended != found).then_some(recommended)
    }
}

// =============================================================================
// Tests
// =============================================================================
