//! Observability infrastructure for the threat engine
//!
//! Provides:
//! - Prometheus metrics (classification and inference latency, chain transitions, model status)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, GaugeVec, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    classification_latency_seconds: Histogram,
    inference_latency_seconds: HistogramVec,
    events_classified: IntCounter,
    degraded_verdicts: IntCounter,
    insufficient_signal: IntCounter,
    cached_verdicts: IntCounter,
    model_predictions: IntCounterVec,
    model_status: GaugeVec,
    chain_transitions: IntCounterVec,
    chain_lock_timeouts: IntCounter,
    active_chains: IntGauge,
    tracked_actors: IntGauge,
    feedback_ingested: IntCounter,
    pending_feedback: IntGauge,
    store_failures: IntCounter,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            classification_latency_seconds: register_histogram!(
                "chainwatch_classification_latency_seconds",
                "End-to-end time to produce a threat verdict",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register classification_latency_seconds"),

            inference_latency_seconds: register_histogram_vec!(
                "chainwatch_inference_latency_seconds",
                "Time spent in a single model inference",
                &["model"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register inference_latency_seconds"),

            events_classified: register_int_counter!(
                "chainwatch_events_classified_total",
                "Total number of events that produced a verdict"
            )
            .expect("Failed to register events_classified"),

            degraded_verdicts: register_int_counter!(
                "chainwatch_degraded_verdicts_total",
                "Verdicts produced with at least one signal source unavailable"
            )
            .expect("Failed to register degraded_verdicts"),

            insufficient_signal: register_int_counter!(
                "chainwatch_insufficient_signal_total",
                "Events recorded as unclassified because no signal source answered"
            )
            .expect("Failed to register insufficient_signal"),

            cached_verdicts: register_int_counter!(
                "chainwatch_cached_verdicts_total",
                "Resubmitted events answered from the verdict cache"
            )
            .expect("Failed to register cached_verdicts"),

            model_predictions: register_int_counter_vec!(
                "chainwatch_model_predictions_total",
                "Predictions served per model and outcome",
                &["model", "outcome"]
            )
            .expect("Failed to register model_predictions"),

            model_status: register_gauge_vec!(
                "chainwatch_model_status",
                "Model status code (0=loading, 1=ready, 2=degraded, 3=error)",
                &["model"]
            )
            .expect("Failed to register model_status"),

            chain_transitions: register_int_counter_vec!(
                "chainwatch_chain_transitions_total",
                "Attack chain state transitions",
                &["transition"]
            )
            .expect("Failed to register chain_transitions"),

            chain_lock_timeouts: register_int_counter!(
                "chainwatch_chain_lock_timeouts_total",
                "Chain lock acquisitions that timed out"
            )
            .expect("Failed to register chain_lock_timeouts"),

            active_chains: register_int_gauge!(
                "chainwatch_active_chains",
                "Attack chains currently open or escalated"
            )
            .expect("Failed to register active_chains"),

            tracked_actors: register_int_gauge!(
                "chainwatch_tracked_actors",
                "Actors with a live behavior profile"
            )
            .expect("Failed to register tracked_actors"),

            feedback_ingested: register_int_counter!(
                "chainwatch_feedback_ingested_total",
                "Analyst corrections accepted"
            )
            .expect("Failed to register feedback_ingested"),

            pending_feedback: register_int_gauge!(
                "chainwatch_pending_feedback",
                "Training examples waiting for the next update cycle"
            )
            .expect("Failed to register pending_feedback"),

            store_failures: register_int_counter!(
                "chainwatch_store_failures_total",
                "Failed writes to the event store"
            )
            .expect("Failed to register store_failures"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying collectors.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn observe_classification_latency(&self, duration_secs: f64) {
        self.inner()
            .classification_latency_seconds
            .observe(duration_secs);
    }

    pub fn observe_inference(&self, model: &str, duration_secs: f64, success: bool) {
        let inner = self.inner();
        inner
            .inference_latency_seconds
            .with_label_values(&[model])
            .observe(duration_secs);
        inner
            .model_predictions
            .with_label_values(&[model, if success { "success" } else { "failure" }])
            .inc();
    }

    /// Record a produced verdict
    pub fn inc_classified(&self, degraded: bool) {
        self.inner().events_classified.inc();
        if degraded {
            self.inner().degraded_verdicts.inc();
        }
    }

    pub fn inc_insufficient_signal(&self) {
        self.inner().insufficient_signal.inc();
    }

    pub fn inc_cached_verdicts(&self) {
        self.inner().cached_verdicts.inc();
    }

    pub fn set_model_status(&self, model: &str, code: f64) {
        self.inner().model_status.with_label_values(&[model]).set(code);
    }

    pub fn inc_chain_transition(&self, transition: &str) {
        self.inner()
            .chain_transitions
            .with_label_values(&[transition])
            .inc();
    }

    pub fn inc_lock_timeouts(&self) {
        self.inner().chain_lock_timeouts.inc();
    }

    pub fn set_active_chains(&self, count: i64) {
        self.inner().active_chains.set(count);
    }

    pub fn set_tracked_actors(&self, count: i64) {
        self.inner().tracked_actors.set(count);
    }

    pub fn inc_feedback(&self) {
        self.inner().feedback_ingested.inc();
    }

    pub fn set_pending_feedback(&self, count: i64) {
        self.inner().pending_feedback.set(count);
    }

    pub fn inc_store_failures(&self) {
        self.inner().store_failures.inc();
    }
}

/// Structured logger for engine events
///
/// Consistent JSON-formatted records for verdicts, chain transitions and
/// model lifecycle changes.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_verdict(
        &self,
        event_id: &str,
        actor_id: &str,
        asset_id: &str,
        category: &str,
        risk_score: f32,
        confidence: f32,
        reduced_confidence: bool,
    ) {
        info!(
            event = "verdict_produced",
            node = %self.node_name,
            event_id = %event_id,
            actor_id = %actor_id,
            asset_id = %asset_id,
            category = %category,
            risk_score = risk_score,
            confidence = confidence,
            reduced_confidence = reduced_confidence,
            "Threat verdict produced"
        );
    }

    pub fn log_unclassified(&self, event_id: &str, reason: &str) {
        warn!(
            event = "event_unclassified",
            node = %self.node_name,
            event_id = %event_id,
            reason = %reason,
            "Event recorded as unclassified"
        );
    }

    /// Log an attack chain state transition
    pub fn log_chain_transition(
        &self,
        transition: &str,
        chain_id: &str,
        rule_id: &str,
        actor_id: &str,
        asset_id: &str,
        stage_count: usize,
        confidence: f64,
        reason: Option<&str>,
    ) {
        match transition {
            "chain_escalated" => {
                warn!(
                    event = %transition,
                    node = %self.node_name,
                    chain_id = %chain_id,
                    rule_id = %rule_id,
                    actor_id = %actor_id,
                    asset_id = %asset_id,
                    stages = stage_count,
                    confidence = confidence,
                    "Attack chain escalated"
                );
            }
            _ => {
                info!(
                    event = %transition,
                    node = %self.node_name,
                    chain_id = %chain_id,
                    rule_id = %rule_id,
                    actor_id = %actor_id,
                    asset_id = %asset_id,
                    stages = stage_count,
                    confidence = confidence,
                    reason = ?reason,
                    "Attack chain updated"
                );
            }
        }
    }

    pub fn log_weak_link(&self, chain_id: Option<&str>, event_id: &str, risk_score: f32) {
        info!(
            event = "weak_link_recorded",
            node = %self.node_name,
            chain_id = ?chain_id,
            event_id = %event_id,
            risk_score = risk_score,
            "Event retained as weak link"
        );
    }

    pub fn log_feedback(&self, event_id: &str, label: &str, replaced: bool) {
        info!(
            event = "feedback_ingested",
            node = %self.node_name,
            event_id = %event_id,
            label = %label,
            replaced = replaced,
            "Analyst feedback queued"
        );
    }

    pub fn log_update_cycle(&self, examples: usize, succeeded: usize, failed: usize) {
        if failed == 0 {
            info!(
                event = "update_cycle",
                node = %self.node_name,
                examples = examples,
                models_updated = succeeded,
                "Applied feedback to models"
            );
        } else {
            warn!(
                event = "update_cycle",
                node = %self.node_name,
                examples = examples,
                models_updated = succeeded,
                models_failed = failed,
                "Some models rejected the feedback batch"
            );
        }
    }

    pub fn log_startup(&self, version: &str, models: usize, rules: usize) {
        info!(
            event = "engine_started",
            node = %self.node_name,
            engine_version = %version,
            models = models,
            rules = rules,
            "Threat engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Threat engine shutting down"
        );
    }
}
