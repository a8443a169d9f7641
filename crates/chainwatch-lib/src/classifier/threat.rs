//! Threat classifier
//!
//! Orchestrates feature extraction, the registry's classification and
//! anomaly models, the behavior profiler and similarity search into one
//! verdict per event. Every source is bounded by a timeout and a failing
//! source degrades the verdict instead of failing the call.

use super::feedback::FeedbackQueue;
use super::signals::{
    blend, AnomalySignal, BlendPolicy, ClassificationSignal, Signals, BENIGN_CATEGORY,
};
use super::similarity::{Embedder, SimilarityMatch, SimilaritySearch};
use crate::error::{CoreError, CoreResult};
use crate::health::{components, HealthRegistry};
use crate::models::{SecurityEvent, ThreatVerdict};
use crate::observability::EngineMetrics;
use crate::predictor::{FeatureExtractor, ModelRegistry, PredictionResult, TrainingExample};
use crate::profiler::BehaviorProfiler;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for the threat classifier
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Classification models in priority order; the first that answers wins
    pub classification_models: Vec<String>,
    pub anomaly_model: String,
    pub blend: BlendPolicy,
    /// Nearest prior threats to request
    pub similarity_k: usize,
    /// Minimum similarity for a prior threat to count
    pub similarity_floor: f32,
    pub inference_timeout: Duration,
    pub similarity_timeout: Duration,
    /// Classified events remembered for feedback and resubmission
    pub recent_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            classification_models: vec![
                "threat-classifier".to_string(),
                "sequence-classifier".to_string(),
            ],
            anomaly_model: "behavior-anomaly".to_string(),
            blend: BlendPolicy::default(),
            similarity_k: 5,
            similarity_floor: 0.75,
            inference_timeout: Duration::from_millis(100),
            similarity_timeout: Duration::from_millis(250),
            recent_capacity: 10_000,
        }
    }
}

/// A verdict together with the features it was computed from
#[derive(Debug, Clone)]
pub struct Classification {
    pub verdict: ThreatVerdict,
    pub features: Vec<f32>,
    /// Answered from the resubmission cache
    pub cached: bool,
}

/// Acknowledgement of an analyst correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackAck {
    pub event_id: String,
    pub label: String,
    /// A pending correction for the same event was replaced
    pub replaced: bool,
    pub pending: usize,
}

#[derive(Debug, Clone)]
struct RecentVerdict {
    fingerprint: String,
    features: Vec<f32>,
    verdict: ThreatVerdict,
}

pub struct ThreatClassifier {
    registry: Arc<ModelRegistry>,
    profiler: Arc<BehaviorProfiler>,
    similarity: Arc<dyn SimilaritySearch>,
    embedder: Arc<dyn Embedder>,
    extractor: FeatureExtractor,
    feedback: Arc<FeedbackQueue>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    config: ClassifierConfig,
    recent: DashMap<String, RecentVerdict>,
    recent_order: Mutex<VecDeque<String>>,
}

impl ThreatClassifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ModelRegistry>,
        profiler: Arc<BehaviorProfiler>,
        similarity: Arc<dyn SimilaritySearch>,
        embedder: Arc<dyn Embedder>,
        feedback: Arc<FeedbackQueue>,
        health: HealthRegistry,
        metrics: EngineMetrics,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            registry,
            profiler,
            similarity,
            embedder,
            extractor: FeatureExtractor::new(),
            feedback,
            health,
            metrics,
            config,
            recent: DashMap::new(),
            recent_order: Mutex::new(VecDeque::new()),
        }
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify one event
    ///
    /// Resubmitting an event with the same id and content returns the
    /// original verdict without touching models or profiles again.
    pub async fn classify(&self, event: &SecurityEvent) -> CoreResult<Classification> {
        let start = Instant::now();
        let fingerprint = event.fingerprint();

        if let Some(recent) = self.recent.get(&event.id) {
            if recent.fingerprint == fingerprint {
                self.metrics.inc_cached_verdicts();
                return Ok(Classification {
                    verdict: recent.verdict.clone(),
                    features: recent.features.clone(),
                    cached: true,
                });
            }
        }

        let features = self.extractor.extract(event, None);
        let signals = self.gather(event, &features).await;

        // Score against the baseline as it stood before this event
        self.profiler
            .observe(&event.actor_id, &features, event.timestamp);
        self.metrics.set_tracked_actors(self.profiler.len() as i64);

        let verdict = match blend(&event.id, &signals, &self.config.blend) {
            Some(verdict) => verdict,
            None => {
                self.metrics.inc_insufficient_signal();
                return Err(CoreError::InsufficientSignal {
                    event_id: event.id.clone(),
                });
            }
        };

        self.metrics.inc_classified(verdict.reduced_confidence);
        self.metrics
            .observe_classification_latency(start.elapsed().as_secs_f64());
        self.remember(&event.id, fingerprint, &features, &verdict);

        Ok(Classification {
            verdict,
            features,
            cached: false,
        })
    }

    async fn gather(&self, event: &SecurityEvent, features: &[f32]) -> Signals {
        let classification = self.classify_with_fallback(features).await;

        let anomaly_model = match self.predict(&self.config.anomaly_model, features).await {
            Ok(result) => {
                let labels = self.registry.labels(&self.config.anomaly_model).unwrap_or_default();
                let probability = result
                    .probability_of(&labels, "anomalous")
                    .unwrap_or_else(|| {
                        if result.prediction == "anomalous" {
                            result.confidence
                        } else {
                            1.0 - result.confidence
                        }
                    });
                Some(AnomalySignal {
                    model: result.model,
                    probability,
                })
            }
            Err(e) => {
                debug!(model = %self.config.anomaly_model, error = %e, "Anomaly model unavailable");
                None
            }
        };

        let profile_deviation = self
            .profiler
            .score(&event.actor_id, features)
            .normalized(self.profiler.config().deviation_scale)
            .map(|d| d as f32);

        let similarity = self.search_similar(event, features).await;

        Signals {
            classification,
            anomaly_model,
            profile_deviation,
            similarity,
        }
    }

    async fn classify_with_fallback(&self, features: &[f32]) -> Option<ClassificationSignal> {
        for name in &self.config.classification_models {
            match self.predict(name, features).await {
                Ok(result) => {
                    let labels = self.registry.labels(name).unwrap_or_default();
                    let benign_probability = result
                        .probability_of(&labels, BENIGN_CATEGORY)
                        .unwrap_or(if result.prediction == BENIGN_CATEGORY {
                            result.confidence
                        } else {
                            0.0
                        });
                    return Some(ClassificationSignal {
                        model: result.model,
                        label: result.prediction,
                        confidence: result.confidence,
                        benign_probability,
                    });
                }
                Err(e) => {
                    debug!(model = %name, error = %e, "Classification model unavailable, trying next");
                }
            }
        }
        None
    }

    /// Registry prediction bounded by the inference timeout
    async fn predict(&self, name: &str, features: &[f32]) -> CoreResult<PredictionResult> {
        let registry = self.registry.clone();
        let model = name.to_string();
        let input = features.to_vec();
        let start = Instant::now();

        let task = tokio::task::spawn_blocking(move || registry.predict(&model, &input));
        let result = match tokio::time::timeout(self.config.inference_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CoreError::Inference {
                name: name.to_string(),
                cause: e.to_string(),
            }),
            Err(_) => Err(CoreError::InferenceTimeout {
                name: name.to_string(),
                timeout_ms: self.config.inference_timeout.as_millis() as u64,
            }),
        };

        if !matches!(result, Err(CoreError::ModelNotFound(_))) {
            self.metrics
                .observe_inference(name, start.elapsed().as_secs_f64(), result.is_ok());
        }
        if let Err(e @ CoreError::FeatureSchemaMismatch { .. }) = &result {
            warn!(model = %name, error = %e, "Feature schema mismatch, skipping model");
        }
        result
    }

    async fn search_similar(
        &self,
        event: &SecurityEvent,
        features: &[f32],
    ) -> Option<Vec<SimilarityMatch>> {
        let embedding = self.embedder.embed(event, features);
        let search = self.similarity.search(
            &embedding,
            self.config.similarity_k,
            self.config.similarity_floor,
        );
        match tokio::time::timeout(self.config.similarity_timeout, search).await {
            Ok(Ok(mut matches)) => {
                matches.retain(|m| m.score >= self.config.similarity_floor);
                matches.truncate(self.config.similarity_k);
                self.health.set_healthy(components::SIMILARITY).await;
                Some(matches)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Similarity search failed, continuing without it");
                self.health
                    .set_degraded(components::SIMILARITY, e.to_string())
                    .await;
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.similarity_timeout.as_millis() as u64,
                    "Similarity search timed out, continuing without it"
                );
                self.health
                    .set_degraded(components::SIMILARITY, "search timed out")
                    .await;
                None
            }
        }
    }

    fn remember(&self, event_id: &str, fingerprint: String, features: &[f32], verdict: &ThreatVerdict) {
        let previous = self.recent.insert(
            event_id.to_string(),
            RecentVerdict {
                fingerprint,
                features: features.to_vec(),
                verdict: verdict.clone(),
            },
        );
        if previous.is_some() {
            return;
        }

        let mut order = self
            .recent_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        order.push_back(event_id.to_string());
        while order.len() > self.config.recent_capacity {
            if let Some(oldest) = order.pop_front() {
                self.recent.remove(&oldest);
            }
        }
    }

    /// Verdict previously produced for `event_id`, if still remembered
    pub fn recent_verdict(&self, event_id: &str) -> Option<ThreatVerdict> {
        self.recent.get(event_id).map(|r| r.verdict.clone())
    }

    /// Queue an analyst correction as a training example
    ///
    /// Never blocks on model updates. A second correction for the same event
    /// replaces the pending one.
    pub fn ingest_feedback(&self, event_id: &str, label: &str) -> CoreResult<FeedbackAck> {
        let recent = self
            .recent
            .get(event_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CoreError::UnknownEvent(event_id.to_string()))?;

        let mut metadata = HashMap::new();
        metadata.insert("event_id".to_string(), event_id.to_string());
        metadata.insert(
            "predicted_category".to_string(),
            recent.verdict.threat_category.clone(),
        );
        metadata.insert(
            "predicted_risk".to_string(),
            format!("{:.2}", recent.verdict.risk_score),
        );

        let example = TrainingExample {
            features: recent.features,
            label: label.to_string(),
            weight: 1.0,
            metadata,
        };
        let replaced = self.feedback.enqueue(event_id, example);
        let pending = self.feedback.len();

        self.metrics.inc_feedback();
        self.metrics.set_pending_feedback(pending as i64);

        Ok(FeedbackAck {
            event_id: event_id.to_string(),
            label: label.to_string(),
            replaced,
            pending,
        })
    }
}
