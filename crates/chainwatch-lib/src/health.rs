//! Component health tracking
//!
//! Backs the liveness and readiness endpoints. Background workers report
//! into the registry after each cycle; a component's `since` timestamp only
//! moves when its status changes, so flapping is visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Serving with reduced capability
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
    /// When the component entered its current status
    pub since: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(status: ComponentStatus, message: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            status,
            message,
            last_check: now,
            since: now,
        }
    }
}

/// Body of `/healthz`; components are listed by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Engine components that report health
pub mod components {
    pub const MODEL_REGISTRY: &str = "model_registry";
    pub const CORRELATION: &str = "correlation";
    pub const SIMILARITY: &str = "similarity";
    pub const EVENT_STORE: &str = "event_store";
    pub const FEEDBACK: &str = "feedback";
}

#[derive(Debug, Default)]
struct State {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

impl State {
    /// Worst status reported; no components means healthy
    fn overall(&self) -> ComponentStatus {
        self.components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }

    fn failing(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Shared, cloneable view of every component's health and the ready flag
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `name` as healthy unless it already reported
    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::new(ComponentStatus::Healthy, None));
    }

    async fn record(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut health = ComponentHealth::new(status, message);
        let mut state = self.state.write().await;
        if let Some(previous) = state.components.get(name) {
            if previous.status == status {
                health.since = previous.since;
            }
        }
        state.components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.record(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.state.read().await.components.get(name).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: state.overall(),
            components: state.components.clone(),
        }
    }

    /// Ready once startup finished and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        let reason = if !state.ready {
            Some("Engine not yet initialized".to_string())
        } else {
            let failing = state.failing();
            (!failing.is_empty()).then(|| format!("Unhealthy components: {}", failing.join(", ")))
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overall_status_is_worst_component() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);

        for name in [components::MODEL_REGISTRY, components::SIMILARITY, components::EVENT_STORE] {
            registry.register(name).await;
        }
        registry
            .set_degraded(components::SIMILARITY, "search timed out")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::MODEL_REGISTRY, "no model ready")
            .await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        let names: Vec<&str> = health.components.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["event_store", "model_registry", "similarity"]);
    }

    #[tokio::test]
    async fn test_since_moves_only_on_status_change() {
        let registry = HealthRegistry::new();
        registry.set_degraded(components::EVENT_STORE, "first").await;
        let first = registry.component(components::EVENT_STORE).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.set_degraded(components::EVENT_STORE, "second").await;
        let second = registry.component(components::EVENT_STORE).await.unwrap();
        assert_eq!(first.since, second.since);
        assert!(second.last_check >= first.last_check);
        assert_eq!(second.message.as_deref(), Some("second"));

        registry.set_healthy(components::EVENT_STORE).await;
        let third = registry.component(components::EVENT_STORE).await.unwrap();
        assert!(third.since > first.since);
        assert!(third.message.is_none());
    }

    #[tokio::test]
    async fn test_register_does_not_reset_existing_status() {
        let registry = HealthRegistry::new();
        registry.set_unhealthy(components::CORRELATION, "stalled").await;
        registry.register(components::CORRELATION).await;
        assert_eq!(
            registry.component(components::CORRELATION).await.unwrap().status,
            ComponentStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_readiness_follows_startup_and_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register(components::FEEDBACK).await;
        let before = registry.readiness().await;
        assert!(!before.ready);
        assert!(before.reason.unwrap().contains("not yet initialized"));

        registry.set_ready(true).await;
        registry.set_degraded(components::EVENT_STORE, "outbox backlog").await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::FEEDBACK, "queue stuck").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains(components::FEEDBACK));
    }
}
