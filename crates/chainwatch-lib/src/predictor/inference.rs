//! ONNX inference using tract
//!
//! Wraps a trained classifier exported to ONNX. The graph takes a single
//! `[1, width]` f32 input and emits one score per label; scores that are not
//! already a probability distribution are passed through softmax.

use super::{softmax, Predictor, TrainingExample};
use anyhow::{bail, Context, Result};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, warn};

/// Latency above which a single inference is logged as slow
const SLOW_INFERENCE_MS: u128 = 20;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Predictor backed by an optimised tract plan
pub struct OnnxPredictor {
    model: TractModel,
    feature_names: Vec<String>,
    labels: Vec<String>,
    version: String,
}

impl std::fmt::Debug for OnnxPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxPredictor")
            .field("features", &self.feature_names.len())
            .field("labels", &self.labels)
            .field("version", &self.version)
            .finish()
    }
}

impl OnnxPredictor {
    /// Parse and optimise an ONNX graph for the given feature and label layout
    pub fn new(
        model_bytes: &[u8],
        feature_names: Vec<String>,
        labels: Vec<String>,
        version: String,
    ) -> Result<Self> {
        if labels.is_empty() {
            bail!("ONNX model requires at least one output label");
        }
        let model = Self::load_model(model_bytes, feature_names.len())?;
        Ok(Self {
            model,
            feature_names,
            labels,
            version,
        })
    }

    fn load_model(model_bytes: &[u8], width: usize) -> Result<TractModel> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, width]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(model)
    }
}

impl Predictor for OnnxPredictor {
    fn predict_distribution(&self, features: &[f32]) -> Result<Vec<f32>> {
        if features.len() != self.feature_names.len() {
            bail!(
                "Expected {} features, got {}",
                self.feature_names.len(),
                features.len()
            );
        }
        let start = Instant::now();

        let input: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, features.len()), features.to_vec())
                .context("Failed to shape input tensor")?
                .into();
        let result = self.model.run(tvec!(input.into()))?;
        let output = result.first().context("No output from model")?;
        let values: Vec<f32> = output.to_array_view::<f32>()?.iter().copied().collect();

        if values.len() < self.labels.len() {
            bail!(
                "Model output has {} values, expected {}",
                values.len(),
                self.labels.len()
            );
        }
        let scores = &values[..self.labels.len()];

        let elapsed = start.elapsed();
        if elapsed.as_millis() > SLOW_INFERENCE_MS {
            warn!(elapsed_ms = elapsed.as_millis(), "Inference exceeded {}ms", SLOW_INFERENCE_MS);
        } else {
            debug!(elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        if is_distribution(scores) {
            Ok(scores.to_vec())
        } else {
            Ok(softmax(scores))
        }
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    /// ONNX graphs are immutable here; update by replacing the model file and reloading
    fn apply_update(&mut self, _examples: &[TrainingExample]) -> Result<()> {
        bail!("ONNX model '{}' does not support online updates", self.version)
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

fn is_distribution(values: &[f32]) -> bool {
    values.iter().all(|v| (0.0..=1.0).contains(v))
        && (values.iter().sum::<f32>() - 1.0).abs() < 1e-3
}
