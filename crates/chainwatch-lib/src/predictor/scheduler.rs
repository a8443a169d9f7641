//! Periodic model health checks
//!
//! Runs the registry's synthetic prediction pass on a fixed interval and
//! mirrors the result into component health and the model status gauges.

use super::{ModelRegistry, ModelStatus};
use crate::health::{components, HealthRegistry};
use crate::observability::EngineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

pub struct HealthCheckWorker {
    registry: Arc<ModelRegistry>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    interval: Duration,
}

impl HealthCheckWorker {
    pub fn new(registry: Arc<ModelRegistry>, health: HealthRegistry, metrics: EngineMetrics) -> Self {
        let interval = registry.config().health_check_interval;
        Self {
            registry,
            health,
            metrics,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting model health check worker"
        );

        let mut ticker = interval(self.interval);
        // The first tick fires immediately; models were just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down model health check worker");
                    break;
                }
            }
        }
    }

    /// Run one health-check pass and publish the outcome
    pub async fn check_once(&self) {
        let registry = self.registry.clone();
        let report = match tokio::task::spawn_blocking(move || registry.health_check()).await {
            Ok(report) => report,
            Err(e) => {
                self.health
                    .set_unhealthy(components::MODEL_REGISTRY, format!("health check panicked: {}", e))
                    .await;
                return;
            }
        };

        debug!(
            checked = report.checked,
            failing = report.failing.len(),
            degraded = report.degraded.len(),
            recovered = report.recovered.len(),
            "Model health check completed"
        );

        self.publish().await;
    }

    /// Mirror current model statuses into metrics and component health
    pub async fn publish(&self) {
        let models = self.registry.list();
        for model in &models {
            self.metrics.set_model_status(&model.name, model.status.code());
        }

        let ready = models
            .iter()
            .filter(|m| m.status == ModelStatus::Ready)
            .count();
        let not_ready: Vec<_> = models
            .iter()
            .filter(|m| m.status != ModelStatus::Ready)
            .map(|m| format!("{}={}", m.name, m.status))
            .collect();

        if models.is_empty() || ready == 0 {
            self.health
                .set_unhealthy(components::MODEL_REGISTRY, "no model is ready")
                .await;
        } else if !not_ready.is_empty() {
            self.health
                .set_degraded(components::MODEL_REGISTRY, not_ready.join(", "))
                .await;
        } else {
            self.health.set_healthy(components::MODEL_REGISTRY).await;
        }
    }
}
