//! Model registry
//!
//! Owns every named model and its lifecycle. The registry map and each model
//! entry sit behind their own readers-writer lock; no operation holds more
//! than one entry lock at a time, and predictor construction runs with no
//! lock held at all.

use super::source::{build_predictor, ModelSource, ModelSpec};
use super::{argmax, ModelKind, ModelStatus, PredictionResult, Predictor, TrainingExample};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default interval between synthetic health predictions
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Smoothing factor for the latency moving average
    pub latency_alpha: f64,
    /// Consecutive health-check failures before a model is degraded
    pub failure_threshold: u32,
    pub health_check_interval: Duration,
    /// Weight given to the newest batch in the accuracy estimate
    pub accuracy_alpha: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            latency_alpha: 0.1,
            failure_threshold: 3,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            accuracy_alpha: 0.2,
        }
    }
}

/// A registered model and its serving state
pub struct PredictiveModel {
    pub name: String,
    pub kind: ModelKind,
    pub version: String,
    pub status: ModelStatus,
    /// Prequential accuracy estimate from feedback, if any has been applied
    pub accuracy: Option<f64>,
    pub prediction_count: u64,
    pub last_prediction_at: Option<DateTime<Utc>>,
    pub avg_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub source: ModelSource,
    predictor: Option<Box<dyn Predictor>>,
}

impl PredictiveModel {
    fn loading(name: &str, kind: ModelKind, source: ModelSource) -> Self {
        Self {
            name: name.to_string(),
            kind,
            version: "unloaded".to_string(),
            status: ModelStatus::Loading,
            accuracy: None,
            prediction_count: 0,
            last_prediction_at: None,
            avg_latency_ms: None,
            consecutive_failures: 0,
            last_error: None,
            source,
            predictor: None,
        }
    }

    fn set_status(&mut self, status: ModelStatus) {
        if self.status != status {
            info!(
                event = "model_status_changed",
                model = %self.name,
                from = %self.status,
                to = %status,
                "Model status changed"
            );
            self.status = status;
        }
    }

    fn install(&mut self, predictor: Box<dyn Predictor>) {
        self.version = predictor.version();
        self.predictor = Some(predictor);
        self.consecutive_failures = 0;
        self.last_error = None;
        self.set_status(ModelStatus::Ready);
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name.clone(),
            kind: self.kind,
            version: self.version.clone(),
            status: self.status,
            accuracy: self.accuracy,
            prediction_count: self.prediction_count,
            last_prediction_at: self.last_prediction_at,
            last_error: self.last_error.clone(),
            labels: self
                .predictor
                .as_ref()
                .map(|p| p.labels().to_vec())
                .unwrap_or_default(),
            feature_count: self
                .predictor
                .as_ref()
                .map(|p| p.feature_names().len())
                .unwrap_or(0),
        }
    }
}

/// Serializable view of a registered model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub kind: ModelKind,
    pub version: String,
    pub status: ModelStatus,
    pub accuracy: Option<f64>,
    pub prediction_count: u64,
    pub last_prediction_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub labels: Vec<String>,
    pub feature_count: usize,
}

/// Serving metrics for a single model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub name: String,
    pub prediction_count: u64,
    pub avg_latency_ms: f64,
    pub accuracy: Option<f64>,
    pub status: ModelStatus,
}

/// Outcome of one health-check pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckReport {
    pub checked: usize,
    /// Models that failed this pass
    pub failing: Vec<String>,
    /// Models that crossed the failure threshold this pass
    pub degraded: Vec<String>,
    /// Models restored to ready this pass
    pub recovered: Vec<String>,
}

type ModelEntry = Arc<RwLock<PredictiveModel>>;

/// Registry of named predictive models
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelEntry>>,
    config: RegistryConfig,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ModelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn entry(&self, name: &str) -> CoreResult<ModelEntry> {
        read(&self.models)
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ModelNotFound(name.to_string()))
    }

    fn entries(&self) -> Vec<ModelEntry> {
        read(&self.models).values().cloned().collect()
    }

    /// Register (or re-register) a model and build its predictor
    ///
    /// The model is visible as `loading` while its source is read. A failed
    /// build leaves it in `error` with the cause recorded and is returned as
    /// [`CoreError::ModelLoad`]; other models are unaffected.
    pub async fn load(&self, spec: &ModelSpec) -> CoreResult<()> {
        let entry = {
            let mut models = write(&self.models);
            models
                .entry(spec.name.clone())
                .or_insert_with(|| {
                    Arc::new(RwLock::new(PredictiveModel::loading(
                        &spec.name,
                        spec.kind,
                        spec.source.clone(),
                    )))
                })
                .clone()
        };
        {
            let mut model = write(&entry);
            model.kind = spec.kind;
            model.source = spec.source.clone();
            model.set_status(ModelStatus::Loading);
        }

        let built = build_blocking(spec.kind, spec.source.clone()).await;

        let mut model = write(&entry);
        match built {
            Ok(predictor) => {
                model.install(predictor);
                info!(model = %spec.name, kind = %spec.kind, version = %model.version, "Model ready");
                Ok(())
            }
            Err(cause) => {
                warn!(model = %spec.name, error = %cause, "Model failed to load");
                model.predictor = None;
                model.last_error = Some(cause.clone());
                model.set_status(ModelStatus::Error);
                Err(CoreError::ModelLoad {
                    name: spec.name.clone(),
                    cause,
                })
            }
        }
    }

    /// Load every spec, collecting failures instead of stopping at the first
    pub async fn load_all(&self, specs: &[ModelSpec]) -> Vec<(String, CoreError)> {
        let mut failures = Vec::new();
        for spec in specs {
            if let Err(e) = self.load(spec).await {
                failures.push((spec.name.clone(), e));
            }
        }
        failures
    }

    /// Rebuild a model from `source` (or its recorded source), replacing it
    /// in place
    ///
    /// The current predictor keeps serving until the replacement is built.
    /// If the rebuild fails a previously working predictor is retained and
    /// only the error is recorded.
    pub async fn reload(&self, name: &str, source: Option<ModelSource>) -> CoreResult<()> {
        let entry = self.entry(name)?;
        let (kind, source) = {
            let model = read(&entry);
            (model.kind, source.unwrap_or_else(|| model.source.clone()))
        };

        let built = build_blocking(kind, source.clone()).await;

        let mut model = write(&entry);
        match built {
            Ok(predictor) => {
                let previous = model.version.clone();
                model.source = source;
                model.install(predictor);
                info!(model = %name, old_version = %previous, new_version = %model.version, "Model reloaded");
                Ok(())
            }
            Err(cause) => {
                warn!(model = %name, error = %cause, "Model reload failed");
                model.last_error = Some(cause.clone());
                if model.predictor.is_none() {
                    model.set_status(ModelStatus::Error);
                }
                Err(CoreError::ModelLoad {
                    name: name.to_string(),
                    cause,
                })
            }
        }
    }

    /// Register an already-constructed predictor as ready
    pub fn register_predictor(
        &self,
        name: &str,
        kind: ModelKind,
        source: ModelSource,
        predictor: Box<dyn Predictor>,
    ) {
        let mut model = PredictiveModel::loading(name, kind, source);
        model.install(predictor);
        write(&self.models).insert(name.to_string(), Arc::new(RwLock::new(model)));
    }

    /// Run a prediction against a ready model
    pub fn predict(&self, name: &str, features: &[f32]) -> CoreResult<PredictionResult> {
        let entry = self.entry(name)?;
        let start = Instant::now();

        let outcome = {
            let model = read(&entry);
            if model.status != ModelStatus::Ready {
                return Err(CoreError::ModelNotReady {
                    name: name.to_string(),
                    status: model.status.to_string(),
                });
            }
            let predictor = model
                .predictor
                .as_ref()
                .ok_or_else(|| CoreError::ModelNotReady {
                    name: name.to_string(),
                    status: model.status.to_string(),
                })?;
            let expected = predictor.feature_names().len();
            if expected != features.len() {
                return Err(CoreError::FeatureSchemaMismatch {
                    model: name.to_string(),
                    expected,
                    actual: features.len(),
                });
            }
            predictor
                .predict_distribution(features)
                .map_err(|e| e.to_string())
                .and_then(|distribution| {
                    let (idx, p) = argmax(&distribution)
                        .filter(|_| distribution.iter().all(|v| v.is_finite()))
                        .ok_or_else(|| "model produced a non-finite distribution".to_string())?;
                    let label = predictor
                        .labels()
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| format!("class_{}", idx));
                    Ok((label, p, distribution))
                })
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mut model = write(&entry);
        match outcome {
            Ok((prediction, p, probabilities)) => {
                let now = Utc::now();
                model.prediction_count += 1;
                model.last_prediction_at = Some(now);
                model.avg_latency_ms = Some(match model.avg_latency_ms {
                    None => elapsed_ms,
                    Some(avg) => {
                        self.config.latency_alpha * elapsed_ms
                            + (1.0 - self.config.latency_alpha) * avg
                    }
                });
                Ok(PredictionResult {
                    prediction,
                    probabilities,
                    confidence: p.clamp(0.0, 1.0),
                    model: name.to_string(),
                    timestamp: now,
                })
            }
            Err(cause) => {
                debug!(model = %name, error = %cause, "Prediction failed");
                model.last_error = Some(cause.clone());
                Err(CoreError::Inference {
                    name: name.to_string(),
                    cause,
                })
            }
        }
    }

    /// Output labels of a model, in distribution order
    pub fn labels(&self, name: &str) -> CoreResult<Vec<String>> {
        let entry = self.entry(name)?;
        let model = read(&entry);
        Ok(model
            .predictor
            .as_ref()
            .map(|p| p.labels().to_vec())
            .unwrap_or_default())
    }

    /// Run a synthetic prediction against every loaded model
    ///
    /// Failures accumulate per model; reaching the threshold flips a ready
    /// model to `degraded` and the next success restores `ready`. Synthetic
    /// predictions do not count toward serving metrics.
    pub fn health_check(&self) -> HealthCheckReport {
        let mut report = HealthCheckReport::default();

        for entry in self.entries() {
            let (name, result) = {
                let model = read(&entry);
                let Some(predictor) = model.predictor.as_ref() else {
                    continue;
                };
                if matches!(model.status, ModelStatus::Loading | ModelStatus::Error) {
                    continue;
                }
                let probe = vec![0.0; predictor.feature_names().len()];
                let result = predictor.predict_distribution(&probe).and_then(|d| {
                    if !d.is_empty() && d.iter().all(|v| v.is_finite()) {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("non-finite health probe output"))
                    }
                });
                (model.name.clone(), result)
            };

            report.checked += 1;
            let mut model = write(&entry);
            match result {
                Ok(()) => {
                    model.consecutive_failures = 0;
                    if model.status == ModelStatus::Degraded {
                        model.set_status(ModelStatus::Ready);
                        report.recovered.push(name);
                    }
                }
                Err(e) => {
                    model.consecutive_failures += 1;
                    model.last_error = Some(e.to_string());
                    warn!(
                        model = %name,
                        failures = model.consecutive_failures,
                        error = %e,
                        "Model health probe failed"
                    );
                    if model.consecutive_failures >= self.config.failure_threshold
                        && model.status == ModelStatus::Ready
                    {
                        model.set_status(ModelStatus::Degraded);
                        report.degraded.push(name.clone());
                    }
                    report.failing.push(name);
                }
            }
        }

        report
    }

    /// Fold labelled examples into one model
    ///
    /// The accuracy estimate is updated prequentially: the current model is
    /// scored on the batch before it learns from it. A rejected batch leaves
    /// the model's status untouched.
    pub fn apply_update(&self, name: &str, examples: &[TrainingExample]) -> CoreResult<()> {
        let entry = self.entry(name)?;
        let mut model = write(&entry);
        let status = model.status;

        let Some(predictor) = model.predictor.as_mut() else {
            return Err(CoreError::ModelNotReady {
                name: name.to_string(),
                status: status.to_string(),
            });
        };

        let (hits, total) = prequential_score(predictor.as_ref(), examples);
        let result = predictor.apply_update(examples);
        let version = predictor.version();

        match result {
            Ok(()) => {
                if total > 0.0 {
                    let batch = hits / total;
                    let alpha = self.config.accuracy_alpha;
                    model.accuracy = Some(match model.accuracy {
                        None => batch,
                        Some(prev) => (1.0 - alpha) * prev + alpha * batch,
                    });
                }
                if model.version != version {
                    info!(
                        event = "model_updated",
                        model = %name,
                        old_version = %model.version,
                        new_version = %version,
                        examples = examples.len(),
                        "Model updated from feedback"
                    );
                    model.version = version;
                }
                Ok(())
            }
            Err(e) => {
                warn!(model = %name, error = %e, "Model rejected update");
                model.last_error = Some(e.to_string());
                Err(CoreError::ModelUpdate {
                    name: name.to_string(),
                    cause: e.to_string(),
                })
            }
        }
    }

    /// Apply the same batch to every loaded model independently
    pub fn apply_update_all(&self, examples: &[TrainingExample]) -> Vec<(String, CoreResult<()>)> {
        let mut names = self.names();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let result = self.apply_update(&name, examples);
                (name, result)
            })
            .collect()
    }

    pub fn status(&self, name: &str) -> CoreResult<ModelStatus> {
        let entry = self.entry(name)?;
        let status = read(&entry).status;
        Ok(status)
    }

    pub fn names(&self) -> Vec<String> {
        read(&self.models).keys().cloned().collect()
    }

    /// Summaries of every registered model, sorted by name
    pub fn list(&self) -> Vec<ModelSummary> {
        let mut summaries: Vec<_> = self.entries().iter().map(|e| read(e).summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn metrics(&self, name: &str) -> CoreResult<ModelMetrics> {
        let entry = self.entry(name)?;
        let model = read(&entry);
        Ok(ModelMetrics {
            name: model.name.clone(),
            prediction_count: model.prediction_count,
            avg_latency_ms: model.avg_latency_ms.unwrap_or(0.0),
            accuracy: model.accuracy,
            status: model.status,
        })
    }

    pub fn len(&self) -> usize {
        read(&self.models).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn build_blocking(kind: ModelKind, source: ModelSource) -> Result<Box<dyn Predictor>, String> {
    tokio::task::spawn_blocking(move || build_predictor(kind, &source))
        .await
        .map_err(|e| format!("model build task failed: {}", e))?
        .map_err(|e| format!("{:#}", e))
}

/// Weighted hits and total weight of `examples` the model already gets right
fn prequential_score(predictor: &dyn Predictor, examples: &[TrainingExample]) -> (f64, f64) {
    let labels = predictor.labels();
    let width = predictor.feature_names().len();
    let mut hits = 0.0;
    let mut total = 0.0;

    for example in examples {
        if example.features.len() != width {
            continue;
        }
        let Some(target) = target_label(labels, &example.label) else {
            continue;
        };
        if let Ok((predicted, _)) = predictor.predict(&example.features) {
            let w = example.weight as f64;
            total += w;
            if predicted == target {
                hits += w;
            }
        }
    }
    (hits, total)
}

/// Map a threat label onto a model's label set
///
/// Anomaly models label normal/anomalous, so any non-benign threat counts
/// as anomalous.
fn target_label<'a>(labels: &'a [String], label: &str) -> Option<&'a str> {
    if let Some(l) = labels.iter().find(|l| *l == label) {
        return Some(l.as_str());
    }
    let wanted = if label == "benign" { "normal" } else { "anomalous" };
    if labels.iter().any(|l| l == "normal") {
        labels.iter().find(|l| *l == wanted).map(|l| l.as_str())
    } else {
        None
    }
}
