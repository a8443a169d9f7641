//! Feedback queue and continuous-learning worker
//!
//! Analyst corrections become [`TrainingExample`]s keyed by event id. A
//! second correction for the same event replaces the pending example in
//! place. The update worker drains the queue on a fixed interval, or early
//! once a full batch is waiting.

use crate::health::{components, HealthRegistry};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::predictor::{ModelRegistry, TrainingExample};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Pending {
    order: VecDeque<String>,
    examples: HashMap<String, TrainingExample>,
}

/// Pending training examples, at most one per event id
pub struct FeedbackQueue {
    pending: Mutex<Pending>,
    notify: Notify,
    batch_hint: usize,
}

impl Default for FeedbackQueue {
    fn default() -> Self {
        Self::new(UpdateConfig::default().max_batch)
    }
}

impl FeedbackQueue {
    /// Queue that wakes its consumer once `batch_hint` examples are waiting
    pub fn new(batch_hint: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            notify: Notify::new(),
            batch_hint: batch_hint.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue or replace the example for `event_id`; returns true on replace
    pub fn enqueue(&self, event_id: &str, example: TrainingExample) -> bool {
        let (replaced, len) = {
            let mut pending = self.lock();
            let replaced = pending
                .examples
                .insert(event_id.to_string(), example)
                .is_some();
            if !replaced {
                pending.order.push_back(event_id.to_string());
            }
            (replaced, pending.examples.len())
        };
        if len >= self.batch_hint {
            self.notify.notify_one();
        }
        replaced
    }

    /// Remove and return up to `max` examples in arrival order
    pub fn drain(&self, max: usize) -> Vec<(String, TrainingExample)> {
        let mut pending = self.lock();
        let mut batch = Vec::with_capacity(max.min(pending.order.len()));
        while batch.len() < max {
            let Some(event_id) = pending.order.pop_front() else {
                break;
            };
            if let Some(example) = pending.examples.remove(&event_id) {
                batch.push((event_id, example));
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.lock().examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn full_batch(&self) {
        self.notify.notified().await
    }
}

/// Configuration for the update worker
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub batch_interval: Duration,
    pub max_batch: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_secs(60),
            max_batch: 256,
        }
    }
}

/// Outcome of one update cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateCycle {
    pub examples: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct UpdateWorker {
    queue: Arc<FeedbackQueue>,
    registry: Arc<ModelRegistry>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    logger: StructuredLogger,
    config: UpdateConfig,
}

impl UpdateWorker {
    pub fn new(
        queue: Arc<FeedbackQueue>,
        registry: Arc<ModelRegistry>,
        health: HealthRegistry,
        metrics: EngineMetrics,
        logger: StructuredLogger,
        config: UpdateConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            health,
            metrics,
            logger,
            config,
        }
    }

    /// Run until shutdown, then apply everything still queued
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.batch_interval.as_secs(),
            max_batch = self.config.max_batch,
            "Starting feedback update worker"
        );

        let mut ticker = interval(self.config.batch_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = self.queue.full_batch() => {
                    debug!("Feedback batch full, updating early");
                    self.flush_once().await;
                }
                _ = shutdown.recv() => {
                    let remaining = self.queue.len();
                    info!(remaining, "Draining feedback queue before shutdown");
                    while !self.queue.is_empty() {
                        self.flush_once().await;
                    }
                    break;
                }
            }
        }
    }

    /// Apply one batch to every model
    pub async fn flush_once(&self) -> UpdateCycle {
        let batch = self.queue.drain(self.config.max_batch);
        self.metrics.set_pending_feedback(self.queue.len() as i64);
        if batch.is_empty() {
            return UpdateCycle::default();
        }

        let examples: Vec<TrainingExample> = batch.into_iter().map(|(_, e)| e).collect();
        let count = examples.len();
        let registry = self.registry.clone();
        let results =
            match tokio::task::spawn_blocking(move || registry.apply_update_all(&examples)).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(error = %e, "Update task failed");
                    self.health
                        .set_unhealthy(components::FEEDBACK, format!("update task failed: {}", e))
                        .await;
                    return UpdateCycle {
                        examples: count,
                        ..UpdateCycle::default()
                    };
                }
            };

        let mut cycle = UpdateCycle {
            examples: count,
            ..UpdateCycle::default()
        };
        for (name, result) in results {
            match result {
                Ok(()) => cycle.succeeded.push(name),
                Err(e) => cycle.failed.push((name, e.to_string())),
            }
        }

        self.logger
            .log_update_cycle(count, cycle.succeeded.len(), cycle.failed.len());
        if cycle.failed.is_empty() {
            self.health.set_healthy(components::FEEDBACK).await;
        } else {
            let names: Vec<_> = cycle.failed.iter().map(|(n, _)| n.as_str()).collect();
            self.health
                .set_degraded(
                    components::FEEDBACK,
                    format!("update rejected by: {}", names.join(", ")),
                )
                .await;
        }
        cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::predictor::{ModelKind, ModelSpec, FEATURE_SCHEMA};

    fn example(label: &str) -> TrainingExample {
        TrainingExample {
            features: vec![0.1; FEATURE_SCHEMA.len()],
            label: label.to_string(),
            weight: 1.0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_enqueue_replaces_per_event() {
        let queue = FeedbackQueue::new(10);
        assert!(!queue.enqueue("e1", example("benign")));
        assert!(!queue.enqueue("e2", example("execution")));
        assert!(queue.enqueue("e1", example("exfiltration")));
        assert_eq!(queue.len(), 2);

        let batch = queue.drain(10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0, "e1");
        assert_eq!(batch[0].1.label, "exfiltration");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_respects_max() {
        let queue = FeedbackQueue::new(10);
        for i in 0..5 {
            queue.enqueue(&format!("e{}", i), example("benign"));
        }
        assert_eq!(queue.drain(3).len(), 3);
        assert_eq!(queue.len(), 2);
    }

    async fn worker(queue: Arc<FeedbackQueue>, health: HealthRegistry) -> UpdateWorker {
        let registry = Arc::new(ModelRegistry::default());
        registry
            .load(&ModelSpec::builtin("threat-classifier", ModelKind::Classification))
            .await
            .unwrap();
        UpdateWorker::new(
            queue,
            registry,
            health,
            EngineMetrics::new(),
            StructuredLogger::new("test"),
            UpdateConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_flush_applies_and_consumes_examples() {
        let queue = Arc::new(FeedbackQueue::new(10));
        let health = HealthRegistry::new();
        let worker = worker(queue.clone(), health.clone()).await;

        queue.enqueue("e1", example("execution"));
        let cycle = worker.flush_once().await;
        assert_eq!(cycle.examples, 1);
        assert_eq!(cycle.succeeded, vec!["threat-classifier".to_string()]);
        assert!(queue.is_empty());
        assert_eq!(
            health.component(components::FEEDBACK).await.unwrap().status,
            ComponentStatus::Healthy
        );

        assert_eq!(worker.flush_once().await, UpdateCycle::default());
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_feedback() {
        let queue = Arc::new(FeedbackQueue::new(1000));
        let worker = Arc::new(worker(queue.clone(), HealthRegistry::new()).await);
        for i in 0..600 {
            queue.enqueue(&format!("e{}", i), example("benign"));
        }

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(worker.run(rx));
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(queue.is_empty());
    }
}
