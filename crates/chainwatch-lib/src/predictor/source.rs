//! Model sources
//!
//! Where a registered model's predictor comes from: the built-in heuristics,
//! a JSON-serialised built-in model, or an ONNX graph on disk. File sources
//! may pin a SHA256 checksum which is verified before parsing.

use super::builtin::{LinearClassifier, ZScoreAnomalyModel, THREAT_LABELS};
use super::features::FEATURE_SCHEMA;
use super::inference::OnnxPredictor;
use super::{ModelKind, Predictor};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BUILTIN_VERSION: &str = "builtin-1.0";

/// Origin of a model's weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSource {
    Builtin,
    File {
        path: PathBuf,
        /// Expected SHA256 of the file contents, hex encoded
        #[serde(default)]
        checksum: Option<String>,
        /// Output labels for ONNX graphs; defaults to the threat labels
        #[serde(default)]
        labels: Vec<String>,
    },
}

/// Registration request for a single model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub kind: ModelKind,
    #[serde(default = "builtin_source")]
    pub source: ModelSource,
}

fn builtin_source() -> ModelSource {
    ModelSource::Builtin
}

impl ModelSpec {
    pub fn builtin(name: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            source: ModelSource::Builtin,
        }
    }
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Construct a predictor for `kind` from `source`
///
/// Blocking: file sources are read and parsed synchronously.
pub fn build_predictor(kind: ModelKind, source: &ModelSource) -> Result<Box<dyn Predictor>> {
    match source {
        ModelSource::Builtin => Ok(builtin_predictor(kind)),
        ModelSource::File {
            path,
            checksum,
            labels,
        } => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read model file {}", path.display()))?;

            let computed = compute_checksum(&bytes);
            if let Some(expected) = checksum {
                if !expected.eq_ignore_ascii_case(&computed) {
                    bail!(
                        "Checksum mismatch for {}: expected {}, got {}",
                        path.display(),
                        expected,
                        computed
                    );
                }
                debug!(path = %path.display(), checksum = %computed, "Model checksum validated");
            }

            let predictor = file_predictor(kind, path, &bytes, labels, &computed)?;
            info!(
                path = %path.display(),
                kind = %kind,
                version = %predictor.version(),
                "Model loaded from file"
            );
            Ok(predictor)
        }
    }
}

fn builtin_predictor(kind: ModelKind) -> Box<dyn Predictor> {
    match kind {
        ModelKind::Classification => Box::new(LinearClassifier::heuristic(BUILTIN_VERSION)),
        ModelKind::SequenceClassification => {
            let mut model = LinearClassifier::heuristic(&format!("{}-seq", BUILTIN_VERSION));
            model.learning_rate = 0.02;
            Box::new(model)
        }
        ModelKind::AnomalyDetection => Box::new(ZScoreAnomalyModel::with_priors(BUILTIN_VERSION)),
    }
}

fn file_predictor(
    kind: ModelKind,
    path: &Path,
    bytes: &[u8],
    labels: &[String],
    checksum: &str,
) -> Result<Box<dyn Predictor>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("onnx") => {
            let labels = if labels.is_empty() {
                THREAT_LABELS.iter().map(|s| s.to_string()).collect()
            } else {
                labels.to_vec()
            };
            let features = FEATURE_SCHEMA.iter().map(|s| s.to_string()).collect();
            let version = format!("onnx-{}", &checksum[..12.min(checksum.len())]);
            Ok(Box::new(OnnxPredictor::new(bytes, features, labels, version)?))
        }
        Some("json") => match kind {
            ModelKind::Classification | ModelKind::SequenceClassification => {
                let model: LinearClassifier =
                    serde_json::from_slice(bytes).context("Failed to parse linear classifier")?;
                validate_linear(&model)?;
                Ok(Box::new(model))
            }
            ModelKind::AnomalyDetection => {
                let model: ZScoreAnomalyModel =
                    serde_json::from_slice(bytes).context("Failed to parse anomaly model")?;
                if model.mean.len() != model.feature_names.len()
                    || model.variance.len() != model.feature_names.len()
                {
                    bail!("Anomaly model baseline does not match its feature names");
                }
                Ok(Box::new(model))
            }
        },
        other => bail!("Unsupported model format: {:?}", other),
    }
}

fn validate_linear(model: &LinearClassifier) -> Result<()> {
    if model.labels.is_empty() {
        bail!("Linear classifier has no labels");
    }
    if model.weights.len() != model.labels.len() || model.bias.len() != model.labels.len() {
        bail!("Linear classifier weight rows do not match its labels");
    }
    if model
        .weights
        .iter()
        .any(|row| row.len() != model.feature_names.len())
    {
        bail!("Linear classifier weight columns do not match its features");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn json_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_compute_checksum() {
        let checksum = compute_checksum(b"test data");
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, compute_checksum(b"test data"));
    }

    #[test]
    fn test_builtin_predictors_per_kind() {
        let classifier = build_predictor(ModelKind::Classification, &ModelSource::Builtin).unwrap();
        assert_eq!(classifier.labels().len(), THREAT_LABELS.len());

        let anomaly = build_predictor(ModelKind::AnomalyDetection, &ModelSource::Builtin).unwrap();
        assert_eq!(anomaly.labels(), ["normal", "anomalous"]);

        let sequence =
            build_predictor(ModelKind::SequenceClassification, &ModelSource::Builtin).unwrap();
        assert!(sequence.version().ends_with("-seq"));
    }

    #[test]
    fn test_json_source_loads_with_checksum() {
        let model = LinearClassifier::heuristic("trained-7");
        let contents = serde_json::to_string(&model).unwrap();
        let file = json_file(&contents);
        let source = ModelSource::File {
            path: file.path().to_path_buf(),
            checksum: Some(compute_checksum(contents.as_bytes())),
            labels: vec![],
        };
        let predictor = build_predictor(ModelKind::Classification, &source).unwrap();
        assert_eq!(predictor.version(), "trained-7");
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let contents = serde_json::to_string(&LinearClassifier::heuristic("x")).unwrap();
        let file = json_file(&contents);
        let source = ModelSource::File {
            path: file.path().to_path_buf(),
            checksum: Some("00".repeat(32)),
            labels: vec![],
        };
        let Err(err) = build_predictor(ModelKind::Classification, &source) else {
            panic!("checksum mismatch should be rejected");
        };
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_missing_file_fails() {
        let source = ModelSource::File {
            path: PathBuf::from("/nonexistent/model.json"),
            checksum: None,
            labels: vec![],
        };
        assert!(build_predictor(ModelKind::Classification, &source).is_err());
    }

    #[test]
    fn test_inconsistent_weights_rejected() {
        let mut model = LinearClassifier::heuristic("x");
        model.bias.pop();
        let file = json_file(&serde_json::to_string(&model).unwrap());
        let source = ModelSource::File {
            path: file.path().to_path_buf(),
            checksum: None,
            labels: vec![],
        };
        assert!(build_predictor(ModelKind::Classification, &source).is_err());
    }

    #[test]
    fn test_spec_deserializes_with_default_source() {
        let spec: ModelSpec =
            serde_json::from_str(r#"{"name":"threat-classifier","kind":"classification"}"#)
                .unwrap();
        assert_eq!(spec.source, ModelSource::Builtin);
    }
}
