//! Threat service facade
//!
//! Wires the registry, profiler, classifier, correlation engine and event
//! store together behind the operations the agent exposes, and owns the
//! long-lived background workers.

use crate::classifier::{
    ClassifierConfig, Embedder, FeatureEmbedder, FeedbackAck, FeedbackQueue,
    InMemorySimilarityIndex, SimilaritySearch, ThreatClassifier, UpdateConfig, UpdateWorker,
};
use crate::correlation::{
    AlertDispatcher, AttackChain, CorrelationConfig, CorrelationEngine, CorrelationOutcome,
    CorrelationReport, LogAlertDispatcher, MaintenanceWorker, RuleSet, ShardedCorrelator,
};
use crate::error::{CoreError, CoreResult};
use crate::health::{components, HealthRegistry};
use crate::models::{ContextMap, SecurityEvent, ThreatVerdict};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::predictor::{
    HealthCheckWorker, ModelMetrics, ModelRegistry, ModelSource, ModelSpec, ModelSummary,
    RegistryConfig,
};
use crate::profiler::{BehaviorProfiler, ProfilerConfig};
use crate::store::{
    EventStore, MemoryEventStore, StoreRecord, StoreWriter, DEFAULT_MAX_OUTBOX,
    DEFAULT_STORE_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for every engine component
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub registry: RegistryConfig,
    pub profiler: ProfilerConfig,
    pub classifier: ClassifierConfig,
    pub correlation: CorrelationConfig,
    pub updates: UpdateConfig,
    /// Non-benign verdicts at or above this risk are indexed as prior threats
    pub index_risk_floor: f32,
    /// Capacity of the built-in similarity index
    pub similarity_capacity: usize,
    /// Bound on one event store append
    pub store_timeout: Duration,
    pub max_outbox: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            profiler: ProfilerConfig::default(),
            classifier: ClassifierConfig::default(),
            correlation: CorrelationConfig::default(),
            updates: UpdateConfig::default(),
            index_risk_floor: 7.0,
            similarity_capacity: 10_000,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            max_outbox: DEFAULT_MAX_OUTBOX,
        }
    }
}

/// Outcome of submitting one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub verdict: ThreatVerdict,
    /// Answered from the resubmission cache; nothing else was touched
    pub cached: bool,
    pub chain_id: Option<String>,
    pub correlation: Option<CorrelationOutcome>,
}

pub struct ThreatServiceBuilder {
    config: ServiceConfig,
    node_name: String,
    rules: RuleSet,
    similarity: Option<Arc<dyn SimilaritySearch>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn EventStore>>,
    alerts: Option<Arc<dyn AlertDispatcher>>,
    health: Option<HealthRegistry>,
}

impl ThreatServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            node_name: "chainwatch".to_string(),
            rules: RuleSet::default(),
            similarity: None,
            embedder: None,
            store: None,
            alerts: None,
            health: None,
        }
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn similarity(mut self, similarity: Arc<dyn SimilaritySearch>) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertDispatcher>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Assemble the service; models are loaded separately
    pub async fn build(self) -> ThreatService {
        let config = self.config;
        let health = self.health.unwrap_or_default();
        let metrics = EngineMetrics::new();
        let logger = StructuredLogger::new(self.node_name);

        for component in [
            components::MODEL_REGISTRY,
            components::CORRELATION,
            components::SIMILARITY,
            components::EVENT_STORE,
            components::FEEDBACK,
        ] {
            health.register(component).await;
        }

        let registry = Arc::new(ModelRegistry::new(config.registry.clone()));
        let profiler = Arc::new(BehaviorProfiler::new(config.profiler.clone()));
        let similarity = self.similarity.unwrap_or_else(|| {
            Arc::new(InMemorySimilarityIndex::new(config.similarity_capacity))
        });
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(FeatureEmbedder));
        let feedback = Arc::new(FeedbackQueue::new(config.updates.max_batch));

        let classifier = ThreatClassifier::new(
            registry.clone(),
            profiler.clone(),
            similarity.clone(),
            embedder.clone(),
            feedback.clone(),
            health.clone(),
            metrics.clone(),
            config.classifier.clone(),
        );

        let engine = Arc::new(CorrelationEngine::new(
            self.rules,
            config.correlation.clone(),
            self.alerts.unwrap_or_else(|| Arc::new(LogAlertDispatcher)),
            logger.clone(),
            metrics.clone(),
        ));

        let store = Arc::new(
            StoreWriter::new(
                self.store.unwrap_or_else(|| Arc::new(MemoryEventStore::new())),
                health.clone(),
                metrics.clone(),
            )
            .with_timeout(config.store_timeout)
            .with_max_outbox(config.max_outbox),
        );

        ThreatService {
            registry,
            profiler,
            classifier,
            feedback,
            similarity,
            embedder,
            engine,
            store,
            health,
            metrics,
            logger,
            config,
            correlator: OnceLock::new(),
        }
    }
}

pub struct ThreatService {
    registry: Arc<ModelRegistry>,
    profiler: Arc<BehaviorProfiler>,
    classifier: ThreatClassifier,
    feedback: Arc<FeedbackQueue>,
    similarity: Arc<dyn SimilaritySearch>,
    embedder: Arc<dyn Embedder>,
    engine: Arc<CorrelationEngine>,
    store: Arc<StoreWriter>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    logger: StructuredLogger,
    config: ServiceConfig,
    /// Set once the shard workers are running; correlation is inline before
    correlator: OnceLock<ShardedCorrelator>,
}

impl ThreatService {
    pub fn builder(config: ServiceConfig) -> ThreatServiceBuilder {
        ThreatServiceBuilder::new(config)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<CorrelationEngine> {
        &self.engine
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Load model specs, reporting failures without stopping
    pub async fn load_models(&self, specs: &[ModelSpec]) -> Vec<(String, CoreError)> {
        let failures = self.registry.load_all(specs).await;
        HealthCheckWorker::new(self.registry.clone(), self.health.clone(), self.metrics.clone())
            .publish()
            .await;
        failures
    }

    /// Classify an event, persist the verdict and correlate it
    ///
    /// An event no signal source could classify is still recorded as
    /// unclassified before [`CoreError::InsufficientSignal`] is returned.
    pub async fn submit_event(&self, event: SecurityEvent) -> CoreResult<SubmissionResult> {
        let classification = match self.classifier.classify(&event).await {
            Ok(classification) => classification,
            Err(e @ CoreError::InsufficientSignal { .. }) => {
                let reason = e.to_string();
                self.logger.log_unclassified(&event.id, &reason);
                self.persist(StoreRecord::Unclassified { event, reason }).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let verdict = classification.verdict;
        if classification.cached {
            debug!(event_id = %event.id, "Resubmitted event answered from cache");
            return Ok(SubmissionResult {
                verdict,
                cached: true,
                chain_id: None,
                correlation: None,
            });
        }

        self.logger.log_verdict(
            &event.id,
            &event.actor_id,
            &event.asset_id,
            &verdict.threat_category,
            verdict.risk_score,
            verdict.confidence,
            verdict.reduced_confidence,
        );
        self.persist(StoreRecord::Verdict {
            event: event.clone(),
            verdict: verdict.clone(),
        })
        .await;
        self.index_threat(&event, &verdict, &classification.features)
            .await;

        let report = self.correlate(&verdict, event).await;
        for transition in &report.transitions {
            self.persist(StoreRecord::ChainTransition(transition.clone()))
                .await;
        }

        Ok(SubmissionResult {
            verdict,
            cached: false,
            chain_id: report.chain_id,
            correlation: Some(report.outcome),
        })
    }

    async fn correlate(&self, verdict: &ThreatVerdict, event: SecurityEvent) -> CorrelationReport {
        let Some(correlator) = self.correlator.get() else {
            return self.engine.correlate(verdict, &event).await;
        };
        match correlator.submit(verdict.clone(), event.clone()).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, event_id = %event.id, "Correlation shard unavailable, correlating inline");
                self.engine.correlate(verdict, &event).await
            }
        }
    }

    /// Record a high-risk verdict so later events can match it
    async fn index_threat(&self, event: &SecurityEvent, verdict: &ThreatVerdict, features: &[f32]) {
        if verdict.is_benign() || verdict.risk_score < self.config.index_risk_floor {
            return;
        }
        let embedding = self.embedder.embed(event, features);
        let mut metadata = ContextMap::new();
        metadata.insert("risk_score".to_string(), json!(verdict.risk_score));
        metadata.insert("category".to_string(), json!(verdict.threat_category));
        metadata.insert("actor_id".to_string(), json!(event.actor_id));
        metadata.insert("asset_id".to_string(), json!(event.asset_id));

        let upsert = self.similarity.upsert(&event.id, embedding, metadata);
        match tokio::time::timeout(self.config.classifier.similarity_timeout, upsert).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, event_id = %event.id, "Failed to index prior threat"),
            Err(_) => warn!(event_id = %event.id, "Indexing prior threat timed out"),
        }
    }

    /// Hand a record to the outbox; failures are retried by the maintenance worker
    async fn persist(&self, record: StoreRecord) {
        if let Err(e) = self.store.write(record).await {
            debug!(error = %e, "Record retained in outbox");
        }
    }

    pub fn submit_feedback(&self, event_id: &str, label: &str) -> CoreResult<FeedbackAck> {
        let ack = self.classifier.ingest_feedback(event_id, label)?;
        self.logger.log_feedback(event_id, label, ack.replaced);
        Ok(ack)
    }

    pub fn get_open_chains(&self, actor_id: Option<&str>, asset_id: Option<&str>) -> Vec<AttackChain> {
        self.engine.get_open_chains(actor_id, asset_id)
    }

    pub fn get_chain(&self, chain_id: &str) -> CoreResult<AttackChain> {
        self.engine
            .get_chain(chain_id)
            .ok_or_else(|| CoreError::ChainNotFound(chain_id.to_string()))
    }

    pub async fn resolve_chain(&self, chain_id: &str, false_positive: bool) -> CoreResult<AttackChain> {
        let (chain, transition) = self.engine.resolve_chain(chain_id, false_positive).await?;
        if let Some(transition) = transition {
            self.persist(StoreRecord::ChainTransition(transition)).await;
        }
        Ok(chain)
    }

    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.registry.list()
    }

    pub fn model_metrics(&self, name: &str) -> CoreResult<ModelMetrics> {
        self.registry.metrics(name)
    }

    pub async fn reload_model(&self, name: &str, source: Option<ModelSource>) -> CoreResult<()> {
        let result = self.registry.reload(name, source).await;
        HealthCheckWorker::new(self.registry.clone(), self.health.clone(), self.metrics.clone())
            .publish()
            .await;
        result
    }

    pub fn pending_feedback(&self) -> usize {
        self.feedback.len()
    }

    /// Records waiting in the event store outbox
    pub fn pending_records(&self) -> usize {
        self.store.pending()
    }

    /// Start the health-check, feedback, maintenance and correlation workers
    ///
    /// Every worker exits after draining its in-flight work once `shutdown`
    /// fires.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let health_check = Arc::new(HealthCheckWorker::new(
            self.registry.clone(),
            self.health.clone(),
            self.metrics.clone(),
        ));
        handles.push(tokio::spawn(health_check.run(shutdown.subscribe())));

        let updates = Arc::new(UpdateWorker::new(
            self.feedback.clone(),
            self.registry.clone(),
            self.health.clone(),
            self.metrics.clone(),
            self.logger.clone(),
            self.config.updates.clone(),
        ));
        handles.push(tokio::spawn(updates.run(shutdown.subscribe())));

        let maintenance = Arc::new(MaintenanceWorker::new(
            self.engine.clone(),
            self.profiler.clone(),
            self.store.clone(),
            self.health.clone(),
        ));
        handles.push(tokio::spawn(maintenance.run(shutdown.subscribe())));

        if self.correlator.get().is_none() {
            let (correlator, shard_handles) = ShardedCorrelator::spawn(self.engine.clone(), shutdown);
            if self.correlator.set(correlator).is_ok() {
                handles.extend(shard_handles);
            } else {
                shard_handles.iter().for_each(JoinHandle::abort);
            }
        }

        info!(workers = handles.len(), "Background workers started");
        handles
    }
}
