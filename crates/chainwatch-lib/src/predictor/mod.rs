//! Predictive model serving
//!
//! Feature extraction, the predictor capability set, built-in and ONNX
//! predictors, the model registry and its periodic health check.

mod builtin;
mod features;
mod inference;
mod registry;
mod scheduler;
mod source;

pub use builtin::{LinearClassifier, ZScoreAnomalyModel, THREAT_LABELS};
pub(crate) use features::is_technique_id;
pub use features::{FeatureExtractor, FEATURE_SCHEMA, MISSING_FEATURE};
pub use inference::OnnxPredictor;
pub use registry::{
    HealthCheckReport, ModelMetrics, ModelRegistry, ModelSummary, PredictiveModel,
    RegistryConfig, DEFAULT_HEALTH_CHECK_INTERVAL,
};
pub use scheduler::HealthCheckWorker;
pub use source::{build_predictor, compute_checksum, ModelSource, ModelSpec};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Model families served by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Classification,
    AnomalyDetection,
    SequenceClassification,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Classification => write!(f, "classification"),
            ModelKind::AnomalyDetection => write!(f, "anomaly_detection"),
            ModelKind::SequenceClassification => write!(f, "sequence_classification"),
        }
    }
}

/// Lifecycle status of a registered model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Loading,
    Ready,
    Degraded,
    Error,
}

impl ModelStatus {
    /// Numeric code exported as a Prometheus gauge value
    pub fn code(&self) -> f64 {
        match self {
            ModelStatus::Loading => 0.0,
            ModelStatus::Ready => 1.0,
            ModelStatus::Degraded => 2.0,
            ModelStatus::Error => 3.0,
        }
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelStatus::Loading => write!(f, "loading"),
            ModelStatus::Ready => write!(f, "ready"),
            ModelStatus::Degraded => write!(f, "degraded"),
            ModelStatus::Error => write!(f, "error"),
        }
    }
}

/// Output of a single registry prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Winning label
    pub prediction: String,
    pub probabilities: Vec<f32>,
    /// Probability of the winning label, in [0, 1]
    pub confidence: f32,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

impl PredictionResult {
    /// Probability assigned to `label`, if the model knows it
    pub fn probability_of(&self, labels: &[String], label: &str) -> Option<f32> {
        labels
            .iter()
            .position(|l| l == label)
            .and_then(|idx| self.probabilities.get(idx).copied())
    }
}

/// Labelled example produced from analyst feedback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub features: Vec<f32>,
    pub label: String,
    pub weight: f32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Capability set shared by every model kind
pub trait Predictor: Send + Sync {
    /// Probability distribution over `labels()`
    fn predict_distribution(&self, features: &[f32]) -> Result<Vec<f32>>;

    /// Ordered names of the input dimensions this predictor expects
    fn feature_names(&self) -> &[String];

    /// Output labels, aligned with `predict_distribution`
    fn labels(&self) -> &[String];

    /// Fold labelled examples into the model
    ///
    /// Implementations validate the whole batch before mutating, so a
    /// rejected batch leaves the predictor unchanged.
    fn apply_update(&mut self, examples: &[TrainingExample]) -> Result<()>;

    /// Current version string
    fn version(&self) -> String;

    /// Winning label and its probability
    fn predict(&self, features: &[f32]) -> Result<(String, f32)> {
        let distribution = self.predict_distribution(features)?;
        let (idx, p) = argmax(&distribution)
            .ok_or_else(|| anyhow::anyhow!("Model produced an empty distribution"))?;
        let label = self
            .labels()
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", idx));
        Ok((label, p))
    }
}

/// Index and value of the largest finite entry
pub(crate) fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

/// Numerically stable softmax
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0 / logits.len().max(1) as f32; logits.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}
