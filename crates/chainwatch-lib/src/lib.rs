//! Threat detection and attack-chain correlation engine
//!
//! This crate provides the core functionality for:
//! - Predictive model serving and continuous learning
//! - Per-actor behavior baselines
//! - Blended per-event threat classification
//! - ATT&CK attack-chain correlation
//! - Health checks and observability

pub mod classifier;
pub mod correlation;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod profiler;
pub mod service;
pub mod store;

pub use error::{CoreError, CoreResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use service::{ServiceConfig, SubmissionResult, ThreatService, ThreatServiceBuilder};
