//! Agent configuration
//!
//! Layered from defaults, an optional TOML file named by `CHAINWATCH_CONFIG`
//! and `CHAINWATCH__*` environment variables, e.g.
//! `CHAINWATCH__CORRELATION__ESCALATION_THRESHOLD=0.9`.

use anyhow::{Context, Result};
use chainwatch_lib::classifier::{BlendPolicy, ClassifierConfig, SignalWeights, UpdateConfig};
use chainwatch_lib::correlation::CorrelationConfig;
use chainwatch_lib::predictor::{ModelKind, ModelSpec, RegistryConfig};
use chainwatch_lib::profiler::ProfilerConfig;
use chainwatch_lib::ServiceConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for events, queries, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON list of correlation rules; the built-in set when absent
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// JSON-lines event store; records are kept in memory when absent
    #[serde(default)]
    pub event_store_path: Option<PathBuf>,

    #[serde(default = "default_models")]
    pub models: Vec<ModelSpec>,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub profiler: ProfilerSection,

    #[serde(default)]
    pub classifier: ClassifierSection,

    #[serde(default)]
    pub correlation: CorrelationSection,

    #[serde(default)]
    pub workers: WorkerSection,

    #[serde(default)]
    pub store: StoreSection,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "chainwatch".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::builtin("threat-classifier", ModelKind::Classification),
        ModelSpec::builtin("sequence-classifier", ModelKind::SequenceClassification),
        ModelSpec::builtin("behavior-anomaly", ModelKind::AnomalyDetection),
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub health_check_interval_secs: u64,
    pub failure_threshold: u32,
    pub latency_alpha: f64,
    pub accuracy_alpha: f64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            health_check_interval_secs: defaults.health_check_interval.as_secs(),
            failure_threshold: defaults.failure_threshold,
            latency_alpha: defaults.latency_alpha,
            accuracy_alpha: defaults.accuracy_alpha,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfilerSection {
    pub half_life_secs: u64,
    pub min_alpha: f64,
    pub min_observations: u64,
    pub idle_eviction_secs: u64,
    pub variance_floor: f64,
    pub deviation_scale: f64,
}

impl Default for ProfilerSection {
    fn default() -> Self {
        let defaults = ProfilerConfig::default();
        Self {
            half_life_secs: defaults.half_life.as_secs(),
            min_alpha: defaults.min_alpha,
            min_observations: defaults.min_observations,
            idle_eviction_secs: defaults.idle_eviction.as_secs(),
            variance_floor: defaults.variance_floor,
            deviation_scale: defaults.deviation_scale,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub classification_models: Vec<String>,
    pub anomaly_model: String,
    pub weights: SignalWeights,
    pub profile_weight: f32,
    pub min_quorum: usize,
    pub similarity_k: usize,
    pub similarity_floor: f32,
    pub similarity_capacity: usize,
    /// Verdicts at or above this risk are indexed as prior threats
    pub index_risk_floor: f32,
    pub inference_timeout_ms: u64,
    pub similarity_timeout_ms: u64,
    pub recent_capacity: usize,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        let defaults = ClassifierConfig::default();
        let service = ServiceConfig::default();
        Self {
            classification_models: defaults.classification_models,
            anomaly_model: defaults.anomaly_model,
            weights: defaults.blend.weights,
            profile_weight: defaults.blend.profile_weight,
            min_quorum: defaults.blend.min_quorum,
            similarity_k: defaults.similarity_k,
            similarity_floor: defaults.similarity_floor,
            similarity_capacity: service.similarity_capacity,
            index_risk_floor: service.index_risk_floor,
            inference_timeout_ms: defaults.inference_timeout.as_millis() as u64,
            similarity_timeout_ms: defaults.similarity_timeout.as_millis() as u64,
            recent_capacity: defaults.recent_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationSection {
    pub escalation_threshold: f64,
    pub weak_link_floor: f32,
    pub min_stage_risk: f32,
    pub lock_timeout_ms: u64,
    pub max_weak_links: usize,
    pub closed_retention: usize,
    pub shards: usize,
    pub shard_capacity: usize,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        let defaults = CorrelationConfig::default();
        Self {
            escalation_threshold: defaults.escalation_threshold,
            weak_link_floor: defaults.weak_link_floor,
            min_stage_risk: defaults.min_stage_risk,
            lock_timeout_ms: defaults.lock_timeout.as_millis() as u64,
            max_weak_links: defaults.max_weak_links,
            closed_retention: defaults.closed_retention,
            shards: defaults.shards,
            shard_capacity: defaults.shard_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Feedback batch interval
    pub update_interval_secs: u64,
    pub max_update_batch: usize,
    /// Stale-chain sweep and outbox retry interval
    pub sweep_interval_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let updates = UpdateConfig::default();
        Self {
            update_interval_secs: updates.batch_interval.as_secs(),
            max_update_batch: updates.max_batch,
            sweep_interval_secs: CorrelationConfig::default().sweep_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Bound on one event store append
    pub timeout_ms: u64,
    pub max_outbox: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        let defaults = ServiceConfig::default();
        Self {
            timeout_ms: defaults.store_timeout.as_millis() as u64,
            max_outbox: defaults.max_outbox,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CHAINWATCH_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("CHAINWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Map the flat sections onto the engine's component configs
    pub fn service_config(&self) -> ServiceConfig {
        let classifier = &self.classifier;
        let correlation = &self.correlation;
        ServiceConfig {
            registry: RegistryConfig {
                latency_alpha: self.registry.latency_alpha,
                failure_threshold: self.registry.failure_threshold,
                health_check_interval: Duration::from_secs(self.registry.health_check_interval_secs),
                accuracy_alpha: self.registry.accuracy_alpha,
            },
            profiler: ProfilerConfig {
                half_life: Duration::from_secs(self.profiler.half_life_secs),
                min_alpha: self.profiler.min_alpha,
                min_observations: self.profiler.min_observations,
                idle_eviction: Duration::from_secs(self.profiler.idle_eviction_secs),
                variance_floor: self.profiler.variance_floor,
                deviation_scale: self.profiler.deviation_scale,
            },
            classifier: ClassifierConfig {
                classification_models: classifier.classification_models.clone(),
                anomaly_model: classifier.anomaly_model.clone(),
                blend: BlendPolicy {
                    weights: classifier.weights,
                    profile_weight: classifier.profile_weight,
                    min_quorum: classifier.min_quorum,
                },
                similarity_k: classifier.similarity_k,
                similarity_floor: classifier.similarity_floor,
                inference_timeout: Duration::from_millis(classifier.inference_timeout_ms),
                similarity_timeout: Duration::from_millis(classifier.similarity_timeout_ms),
                recent_capacity: classifier.recent_capacity,
            },
            correlation: CorrelationConfig {
                escalation_threshold: correlation.escalation_threshold,
                weak_link_floor: correlation.weak_link_floor,
                min_stage_risk: correlation.min_stage_risk,
                lock_timeout: Duration::from_millis(correlation.lock_timeout_ms),
                max_weak_links: correlation.max_weak_links,
                closed_retention: correlation.closed_retention,
                shards: correlation.shards.max(1),
                shard_capacity: correlation.shard_capacity.max(1),
                sweep_interval: Duration::from_secs(self.workers.sweep_interval_secs.max(1)),
            },
            updates: UpdateConfig {
                batch_interval: Duration::from_secs(self.workers.update_interval_secs.max(1)),
                max_batch: self.workers.max_update_batch,
            },
            index_risk_floor: classifier.index_risk_floor,
            similarity_capacity: classifier.similarity_capacity,
            store_timeout: Duration::from_millis(self.store.timeout_ms.max(1)),
            max_outbox: self.store.max_outbox.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn from_toml(contents: &str) -> AgentConfig {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        config::Config::builder()
            .add_source(config::File::from(file.path()))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = from_toml("");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.models.len(), 3);
        assert!(config.rules_path.is_none());

        let service = config.service_config();
        assert_eq!(service.correlation.escalation_threshold, 0.8);
        assert_eq!(service.correlation.lock_timeout, Duration::from_millis(50));
        assert_eq!(service.classifier.blend.min_quorum, 1);
        assert_eq!(service.profiler.half_life, Duration::from_secs(3600));
        assert_eq!(service.store_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = from_toml(
            r#"
api_port = 9000

[correlation]
escalation_threshold = 0.9
shards = 0

[store]
timeout_ms = 250

[classifier.weights]
classification = 0.6
anomaly = 0.2
similarity = 0.2

[[models]]
name = "threat-classifier"
kind = "classification"
"#,
        );
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.models.len(), 1);

        let service = config.service_config();
        assert_eq!(service.correlation.escalation_threshold, 0.9);
        assert_eq!(service.correlation.shards, 1);
        assert_eq!(service.classifier.blend.weights.classification, 0.6);
        assert_eq!(service.correlation.weak_link_floor, 4.0);
        assert_eq!(service.store_timeout, Duration::from_millis(250));
    }
}
