//! Prediction Models
//!
//! Three heuristic models scoring an entry's features:
//!
//! - access: how likely the key is to be read again soon
//! - layer: which layer should hold the primary copy
//! - compression: whether compressing the payload pays off
//!
//! Every model is a pure function of `(ModelParameters, AccessFeatures)`.
//! Features carry ages instead of timestamps so identical inputs always give
//! identical outputs. A `TrainedModel` may override the heuristic whenever it
//! reports a confidence above `ModelParameters::trained_confidence_threshold`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::compression::CompressionProfile;
use super::entry::Priority;
use super::history::{OperationKind, OperationRecord};
use super::layer::LayerId;
use crate::domain::ports::NetworkConditions;

// =============================================================================
// Inputs and Outputs
// =============================================================================

/// Features of one key at decision time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessFeatures {
    pub size: u64,
    pub content_type: String,
    pub access_count: u64,
    /// Milliseconds since the last access (`None` if never accessed)
    pub age_ms: Option<u64>,
    pub priority: Priority,
    pub network: NetworkConditions,
}

/// One contribution to a prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionFactor {
    pub name: String,
    pub weight: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPrediction {
    /// Probability of another access within `timeframe_ms` (0.0 - 1.0)
    pub probability: f64,
    pub confidence: f64,
    pub timeframe_ms: u64,
    pub factors: Vec<PredictionFactor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAlternative {
    pub layer: LayerId,
    pub score: f64,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerPrediction {
    pub recommended_layer: LayerId,
    pub confidence: f64,
    /// Every other candidate, best first
    pub alternatives: Vec<LayerAlternative>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionPrediction {
    pub beneficial: bool,
    /// Expected compressed / original
    pub expected_ratio: f64,
    pub confidence: f64,
    pub profile: CompressionProfile,
}

// =============================================================================
// Parameters
// =============================================================================

/// Tunable model parameters, refreshed by `retrain`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParameters {
    /// Entries up to this size are volatile candidates
    pub small_entry_bytes: u64,
    /// Entries above this size belong in the blob layer
    pub large_entry_bytes: u64,
    /// Recency score halves every this many milliseconds
    pub recency_half_life_ms: u64,
    /// Access count at which the frequency score saturates
    pub frequency_saturation: f64,
    pub recency_weight: f64,
    pub frequency_weight: f64,
    pub priority_weight: f64,
    /// Extra score per layer, learned from where reads were actually served
    pub layer_bias: BTreeMap<LayerId, f64>,
    /// Payloads below this size are never compressed
    pub min_compression_bytes: u64,
    /// Content-type prefixes that compress well
    pub compressible_types: Vec<String>,
    /// Content-type prefixes that are already compressed
    pub precompressed_types: Vec<String>,
    /// Trained models override heuristics above this confidence
    pub trained_confidence_threshold: f64,
    /// Number of history records the current parameters were fit on
    pub trained_on: u64,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            small_entry_bytes: 1024 * 1024,          // 1MB
            large_entry_bytes: 32 * 1024 * 1024,     // 32MB
            recency_half_life_ms: 5 * 60 * 1000,     // 5 minutes
            frequency_saturation: 10.0,
            recency_weight: 0.4,
            frequency_weight: 0.4,
            priority_weight: 0.2,
            layer_bias: BTreeMap::new(),
            min_compression_bytes: 4 * 1024, // 4KB
            compressible_types: vec![
                "audio/wav".into(),
                "audio/x-wav".into(),
                "audio/aiff".into(),
                "audio/midi".into(),
                "application/json".into(),
                "text/".into(),
            ],
            precompressed_types: vec![
                "audio/mpeg".into(),
                "audio/ogg".into(),
                "audio/opus".into(),
                "audio/aac".into(),
                "audio/flac".into(),
                "image/".into(),
            ],
            trained_confidence_threshold: 0.7,
            trained_on: 0,
        }
    }
}

// =============================================================================
// Heuristic Models
// =============================================================================

fn matches_any(content_type: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| content_type.starts_with(p.as_str()))
}

/// Access-probability heuristic
pub fn predict_access(params: &ModelParameters, features: &AccessFeatures) -> AccessPrediction {
    let recency = match features.age_ms {
        Some(age) => 0.5f64.powf(age as f64 / params.recency_half_life_ms.max(1) as f64),
        None => 0.0,
    };
    let saturation = params.frequency_saturation.max(1.0);
    let frequency = ((1.0 + features.access_count as f64).ln() / (1.0 + saturation).ln()).min(1.0);
    let priority = features.priority.weight();

    let total_weight = params.recency_weight + params.frequency_weight + params.priority_weight;
    let probability = if total_weight <= 0.0 {
        0.0
    } else {
        ((params.recency_weight * recency
            + params.frequency_weight * frequency
            + params.priority_weight * priority)
            / total_weight)
            .clamp(0.0, 1.0)
    };

    // More observed accesses, more trust in the estimate
    let confidence = 0.4 + 0.5 * (features.access_count as f64 / saturation).min(1.0);
    let timeframe_ms = (params.recency_half_life_ms as f64 * (2.0 - probability)) as u64;

    AccessPrediction {
        probability,
        confidence,
        timeframe_ms,
        factors: vec![
            PredictionFactor {
                name: "recency".into(),
                weight: params.recency_weight,
                value: recency,
            },
            PredictionFactor {
                name: "frequency".into(),
                weight: params.frequency_weight,
                value: frequency,
            },
            PredictionFactor {
                name: "priority".into(),
                weight: params.priority_weight,
                value: priority,
            },
        ],
    }
}

fn score_layer(
    params: &ModelParameters,
    features: &AccessFeatures,
    probability: f64,
    layer: LayerId,
) -> LayerAlternative {
    let mut pros = Vec::new();
    let mut cons = Vec::new();
    let size = features.size;
    let constrained = features.network.is_constrained();

    let mut score = match layer {
        LayerId::Volatile => {
            let mut s = 0.6 * probability;
            if size <= params.small_entry_bytes {
                s += 0.3;
                pros.push("small entry fits in memory".to_string());
            } else if size > params.large_entry_bytes {
                s -= 0.5;
                cons.push("too large for memory".to_string());
            }
            if probability >= 0.5 {
                pros.push("likely to be read again soon".to_string());
            }
            cons.push("lost on restart".to_string());
            s
        }
        LayerId::Structured => {
            let mut s = 0.3 + 0.2 * probability;
            if size <= params.large_entry_bytes {
                s += 0.1;
                pros.push("indexed persistent storage".to_string());
            } else {
                cons.push("large entries bloat the index".to_string());
            }
            if features.priority.is_high() {
                s += 0.15;
                pros.push("high priority survives restarts".to_string());
            }
            cons.push("slower than memory".to_string());
            s
        }
        LayerId::Blob => {
            let mut s = 0.4 * (1.0 - probability);
            if size > params.large_entry_bytes {
                s += 0.4;
                pros.push("built for large objects".to_string());
            }
            if constrained {
                s += 0.2;
                pros.push("keeps the asset offline on a constrained link".to_string());
            }
            cons.push("slowest layer".to_string());
            s
        }
    };
    score += params.layer_bias.get(&layer).copied().unwrap_or(0.0);

    LayerAlternative {
        layer,
        score,
        pros,
        cons,
    }
}

/// Layer recommendation among `available` layers.
///
/// Returns `None` only when `available` is empty.
pub fn predict_layer(
    params: &ModelParameters,
    features: &AccessFeatures,
    available: &[LayerId],
) -> Option<LayerPrediction> {
    let probability = predict_access(params, features).probability;
    let mut scored: Vec<LayerAlternative> = available
        .iter()
        .map(|layer| score_layer(params, features, probability, *layer))
        .collect();
    // Best score first; ties go to the faster layer
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.layer.cmp(&b.layer))
    });

    let mut scored = scored.into_iter();
    let best = scored.next()?;
    let alternatives: Vec<LayerAlternative> = scored.collect();

    let margin = match alternatives.first() {
        Some(second) if best.score > 0.0 => ((best.score - second.score) / best.score).clamp(0.0, 1.0),
        Some(_) => 0.0,
        None => 1.0,
    };

    Some(LayerPrediction {
        recommended_layer: best.layer,
        confidence: 0.5 + 0.5 * margin,
        alternatives,
    })
}

/// Compression-benefit heuristic
pub fn predict_compression(params: &ModelParameters, features: &AccessFeatures) -> CompressionPrediction {
    let profile = CompressionProfile::default();
    if features.size < params.min_compression_bytes {
        return CompressionPrediction {
            beneficial: false,
            expected_ratio: 1.0,
            confidence: 0.9,
            profile,
        };
    }
    if matches_any(&features.content_type, &params.precompressed_types) {
        return CompressionPrediction {
            beneficial: false,
            expected_ratio: 0.98,
            confidence: 0.8,
            profile,
        };
    }

    let (expected_ratio, confidence) = if matches_any(&features.content_type, &params.compressible_types) {
        (0.5, 0.75)
    } else {
        (0.85, 0.4)
    };
    // Storage saved matters more when refetching is expensive
    let threshold = if features.network.is_constrained() { 0.95 } else { 0.9 };

    CompressionPrediction {
        beneficial: expected_ratio < threshold,
        expected_ratio,
        confidence,
        profile,
    }
}

// =============================================================================
// Trained Model Extension Point
// =============================================================================

/// A learned model that can override the heuristics.
///
/// Returning `None`, or a prediction at or below the confidence threshold,
/// keeps the heuristic result.
pub trait TrainedModel: Send + Sync {
    fn predict_access(&self, _features: &AccessFeatures) -> Option<AccessPrediction> {
        None
    }

    fn predict_layer(&self, _features: &AccessFeatures, _available: &[LayerId]) -> Option<LayerPrediction> {
        None
    }
}

// =============================================================================
// Prediction Engine
// =============================================================================

/// Current parameters plus an optional trained model
pub struct PredictionEngine {
    params: RwLock<ModelParameters>,
    trained: Option<Arc<dyn TrainedModel>>,
}

impl PredictionEngine {
    pub fn new(params: ModelParameters) -> Self {
        Self {
            params: RwLock::new(params),
            trained: None,
        }
    }

    /// Install a trained model
    pub fn with_trained_model(mut self, model: Arc<dyn TrainedModel>) -> Self {
        self.trained = Some(model);
        self
    }

    /// Copy of the current parameters
    pub fn parameters(&self) -> ModelParameters {
        self.params.read().clone()
    }

    pub fn set_parameters(&self, params: ModelParameters) {
        *self.params.write() = params;
    }

    pub fn predict_access(&self, features: &AccessFeatures) -> AccessPrediction {
        let params = self.params.read();
        if let Some(p) = self.trained.as_ref().and_then(|m| m.predict_access(features)) {
            if p.confidence > params.trained_confidence_threshold {
                return p;
            }
        }
        predict_access(&params, features)
    }

    pub fn predict_layer(&self, features: &AccessFeatures, available: &[LayerId]) -> Option<LayerPrediction> {
        let params = self.params.read();
        if let Some(p) = self
            .trained
            .as_ref()
            .and_then(|m| m.predict_layer(features, available))
        {
            if p.confidence > params.trained_confidence_threshold && available.contains(&p.recommended_layer) {
                return Some(p);
            }
        }
        predict_layer(&params, features, available)
    }

    pub fn predict_compression(&self, features: &AccessFeatures) -> CompressionPrediction {
        predict_compression(&self.params.read(), features)
    }

    /// Refit parameters on an operation history snapshot.
    ///
    /// Returns the new parameters, or `None` if fewer than `min_samples`
    /// records are available.
    pub fn retrain(&self, history: &[OperationRecord], min_samples: usize) -> Option<ModelParameters> {
        if history.len() < min_samples.max(1) {
            return None;
        }
        let current = self.parameters();
        let refreshed = fit_parameters(&current, history);
        self.set_parameters(refreshed.clone());
        Some(refreshed)
    }
}

/// Deterministic refit of the recency and frequency scales and layer biases
fn fit_parameters(current: &ModelParameters, history: &[OperationRecord]) -> ModelParameters {
    let mut params = current.clone();

    // Per-key read counts and inter-read gaps
    let mut reads: HashMap<&str, Vec<i64>> = HashMap::new();
    for record in history.iter().filter(|r| r.kind == OperationKind::Get) {
        reads
            .entry(record.key.as_str())
            .or_default()
            .push(record.at.timestamp_millis());
    }

    let mut counts: Vec<u64> = reads.values().map(|v| v.len() as u64).collect();
    if !counts.is_empty() {
        counts.sort_unstable();
        let p90 = counts[(counts.len() - 1) * 9 / 10];
        params.frequency_saturation = (p90 as f64).max(2.0);
    }

    let mut gaps: Vec<i64> = reads
        .values_mut()
        .flat_map(|times| {
            times.sort_unstable();
            times.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>()
        })
        .filter(|gap| *gap > 0)
        .collect();
    if !gaps.is_empty() {
        gaps.sort_unstable();
        let median = gaps[gaps.len() / 2] as u64;
        params.recency_half_life_ms = median.clamp(1_000, 60 * 60 * 1000);
    }

    // Nudge predicted layers toward where hits were actually served
    let mut predicted_hits: BTreeMap<LayerId, (u64, u64)> = BTreeMap::new();
    for record in history
        .iter()
        .filter(|r| r.kind == OperationKind::Get && r.hit)
    {
        if let Some(predicted) = record.predicted {
            let slot = predicted_hits.entry(predicted).or_default();
            slot.1 += 1;
            if record.prediction_correct() {
                slot.0 += 1;
            }
        }
    }
    for (layer, (correct, total)) in predicted_hits {
        let accuracy = correct as f64 / total as f64;
        let bias = params.layer_bias.entry(layer).or_insert(0.0);
        *bias = (*bias + (accuracy - 0.5) * 0.1).clamp(-0.3, 0.3);
    }

    params.trained_on = history.len() as u64;
    params
}

// =============================================================================
// Tests
// =============================================================================
