//! Built-in predictors
//!
//! Small, dependency-free models that serve when no trained artifact is
//! configured. Both can be persisted as JSON and loaded back through
//! [`super::ModelSource::File`].

use super::features::FEATURE_SCHEMA;
use super::{softmax, Predictor, TrainingExample};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Threat categories produced by the built-in classifiers
pub const THREAT_LABELS: &[&str] = &[
    "benign",
    "reconnaissance",
    "credential_access",
    "execution",
    "lateral_movement",
    "exfiltration",
];

const ANOMALY_LABELS: &[&str] = &["normal", "anomalous"];

/// Multinomial logistic regression over the feature schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearClassifier {
    pub feature_names: Vec<String>,
    pub labels: Vec<String>,
    /// `weights[label][feature]`
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    pub base_version: String,
    #[serde(default)]
    pub updates: u64,
}

fn default_learning_rate() -> f32 {
    0.05
}

impl LinearClassifier {
    /// Zero-initialised classifier
    pub fn new(feature_names: Vec<String>, labels: Vec<String>, version: &str) -> Self {
        let width = feature_names.len();
        Self {
            weights: vec![vec![0.0; width]; labels.len()],
            bias: vec![0.0; labels.len()],
            feature_names,
            labels,
            learning_rate: default_learning_rate(),
            base_version: version.to_string(),
            updates: 0,
        }
    }

    /// Hand-tuned threat classifier over the default feature schema
    pub fn heuristic(version: &str) -> Self {
        let names = FEATURE_SCHEMA.iter().map(|s| s.to_string()).collect();
        let labels = THREAT_LABELS.iter().map(|s| s.to_string()).collect();
        let mut model = Self::new(names, labels, version);

        model.set("benign", None, 2.0);
        model.set("benign", Some("severity"), -2.0);
        model.set("benign", Some("technique_indicator_count"), -1.5);
        model.set("benign", Some("is_off_hours"), -0.5);
        model.set("benign", Some("tool_risk"), -2.0);

        model.set("reconnaissance", None, -1.0);
        model.set("reconnaissance", Some("distinct_ports"), 4.0);
        model.set("reconnaissance", Some("distinct_hosts"), 3.0);
        model.set("reconnaissance", Some("category_network"), 1.5);
        model.set("reconnaissance", Some("severity"), 0.5);

        model.set("credential_access", None, -1.0);
        model.set("credential_access", Some("failed_auth_count"), 5.0);
        model.set("credential_access", Some("category_auth"), 2.0);
        model.set("credential_access", Some("privileged"), 1.0);

        model.set("execution", None, -1.0);
        model.set("execution", Some("process_depth"), 3.0);
        model.set("execution", Some("privileged"), 1.5);
        model.set("execution", Some("category_process"), 2.0);
        model.set("execution", Some("tool_risk"), 2.0);
        model.set("execution", Some("payload_entropy"), 1.0);

        model.set("lateral_movement", None, -1.5);
        model.set("lateral_movement", Some("distinct_hosts"), 2.5);
        model.set("lateral_movement", Some("privileged"), 1.5);
        model.set("lateral_movement", Some("category_auth"), 0.5);
        model.set("lateral_movement", Some("technique_indicator_count"), 1.0);

        model.set("exfiltration", None, -1.5);
        model.set("exfiltration", Some("bytes_out"), 5.0);
        model.set("exfiltration", Some("external_destination"), 2.0);
        model.set("exfiltration", Some("category_file"), 1.0);
        model.set("exfiltration", Some("is_off_hours"), 1.0);

        model
    }

    /// Set a weight by name; `None` addresses the label's bias
    fn set(&mut self, label: &str, feature: Option<&str>, value: f32) {
        let Some(row) = self.labels.iter().position(|l| l == label) else {
            return;
        };
        match feature {
            None => self.bias[row] = value,
            Some(name) => {
                if let Some(col) = self.feature_names.iter().position(|f| f == name) {
                    self.weights[row][col] = value;
                }
            }
        }
    }

    fn logits(&self, features: &[f32]) -> Vec<f32> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| b + row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>())
            .collect()
    }
}

impl Predictor for LinearClassifier {
    fn predict_distribution(&self, features: &[f32]) -> Result<Vec<f32>> {
        if features.len() != self.feature_names.len() {
            bail!(
                "Expected {} features, got {}",
                self.feature_names.len(),
                features.len()
            );
        }
        Ok(softmax(&self.logits(features)))
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn apply_update(&mut self, examples: &[TrainingExample]) -> Result<()> {
        validate_batch(examples, self.feature_names.len())?;

        let mut applied = 0usize;
        for example in examples {
            let Some(target) = self.labels.iter().position(|l| *l == example.label) else {
                continue;
            };
            let p = softmax(&self.logits(&example.features));
            let step = self.learning_rate * example.weight;
            for (k, pk) in p.iter().enumerate() {
                let grad = pk - if k == target { 1.0 } else { 0.0 };
                for (w, x) in self.weights[k].iter_mut().zip(&example.features) {
                    *w -= step * grad * x;
                }
                self.bias[k] -= step * grad;
            }
            applied += 1;
        }

        if applied > 0 {
            self.updates += 1;
            debug!(applied, version = %self.version(), "Linear classifier updated");
        }
        Ok(())
    }

    fn version(&self) -> String {
        versioned(&self.base_version, self.updates)
    }
}

/// Diagonal-Gaussian anomaly model
///
/// Scores the RMS z-distance of a vector from the running benign baseline and
/// squashes it through a logistic around `threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZScoreAnomalyModel {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    /// Accumulated example weight behind the baseline
    pub weight_sum: f64,
    pub threshold: f64,
    pub steepness: f64,
    pub base_version: String,
    #[serde(default)]
    pub updates: u64,
    #[serde(skip, default = "anomaly_labels")]
    labels: Vec<String>,
}

fn anomaly_labels() -> Vec<String> {
    ANOMALY_LABELS.iter().map(|s| s.to_string()).collect()
}

const VARIANCE_FLOOR: f64 = 1e-4;

impl ZScoreAnomalyModel {
    /// Baseline seeded with priors for the default feature schema
    pub fn with_priors(version: &str) -> Self {
        let feature_names: Vec<String> = FEATURE_SCHEMA.iter().map(|s| s.to_string()).collect();
        let (mean, variance) = feature_names
            .iter()
            .map(|name| match name.as_str() {
                "hour_of_day" => (0.5, 0.08),
                n if n.starts_with("category_") => (0.2, 0.16),
                _ => (0.1, 0.05),
            })
            .unzip();
        Self {
            feature_names,
            mean,
            variance,
            weight_sum: 10.0,
            threshold: 2.0,
            steepness: 2.0,
            base_version: version.to_string(),
            updates: 0,
            labels: anomaly_labels(),
        }
    }

    /// RMS z-distance from the baseline
    pub fn distance(&self, features: &[f32]) -> f64 {
        let n = features.len().max(1) as f64;
        let sum: f64 = features
            .iter()
            .zip(self.mean.iter().zip(&self.variance))
            .map(|(x, (m, v))| {
                let d = *x as f64 - m;
                d * d / v.max(VARIANCE_FLOOR)
            })
            .sum();
        (sum / n).sqrt()
    }
}

impl Predictor for ZScoreAnomalyModel {
    fn predict_distribution(&self, features: &[f32]) -> Result<Vec<f32>> {
        if features.len() != self.feature_names.len() {
            bail!(
                "Expected {} features, got {}",
                self.feature_names.len(),
                features.len()
            );
        }
        let d = self.distance(features);
        let p = 1.0 / (1.0 + (-self.steepness * (d - self.threshold)).exp());
        Ok(vec![(1.0 - p) as f32, p as f32])
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Only examples labelled benign or normal move the baseline
    fn apply_update(&mut self, examples: &[TrainingExample]) -> Result<()> {
        validate_batch(examples, self.feature_names.len())?;

        let mut applied = 0usize;
        for example in examples
            .iter()
            .filter(|e| e.label == "benign" || e.label == "normal")
        {
            let w = example.weight as f64;
            if w == 0.0 {
                continue;
            }
            let total = self.weight_sum + w;
            for (i, x) in example.features.iter().enumerate() {
                let x = *x as f64;
                let delta = x - self.mean[i];
                let mean = self.mean[i] + (w / total) * delta;
                self.variance[i] =
                    ((self.weight_sum * self.variance[i] + w * delta * (x - mean)) / total)
                        .max(VARIANCE_FLOOR);
                self.mean[i] = mean;
            }
            self.weight_sum = total;
            applied += 1;
        }

        if applied > 0 {
            self.updates += 1;
            debug!(applied, version = %self.version(), "Anomaly baseline updated");
        }
        Ok(())
    }

    fn version(&self) -> String {
        versioned(&self.base_version, self.updates)
    }
}

fn versioned(base: &str, updates: u64) -> String {
    if updates == 0 {
        base.to_string()
    } else {
        format!("{}+u{}", base, updates)
    }
}

/// Reject the whole batch if any example is malformed
fn validate_batch(examples: &[TrainingExample], width: usize) -> Result<()> {
    for (i, example) in examples.iter().enumerate() {
        if example.features.len() != width {
            bail!(
                "Example {} has {} features, expected {}",
                i,
                example.features.len(),
                width
            );
        }
        if example.features.iter().any(|x| !x.is_finite()) {
            bail!("Example {} contains non-finite features", i);
        }
        if !example.weight.is_finite() || example.weight < 0.0 {
            bail!("Example {} has invalid weight {}", i, example.weight);
        }
    }
    Ok(())
}
