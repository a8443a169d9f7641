//! Error taxonomy for the threat engine
//!
//! Every failure mode of the core resolves to a [`CoreError`]; nothing in
//! this crate is process-fatal.

use thiserror::Error;

/// Errors surfaced by the registry, classifier and correlation engine
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("model '{0}' is not registered")]
    ModelNotFound(String),

    #[error("model '{name}' is not ready (status: {status})")]
    ModelNotReady { name: String, status: String },

    #[error("no signal source available to classify event '{event_id}'")]
    InsufficientSignal { event_id: String },

    #[error("feature schema mismatch for model '{model}': expected {expected} features, got {actual}")]
    FeatureSchemaMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("timed out acquiring chain lock for actor '{actor_id}' on asset '{asset_id}'")]
    ChainLockTimeout { actor_id: String, asset_id: String },

    #[error("upstream '{service}' unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    #[error("failed to load model '{name}': {cause}")]
    ModelLoad { name: String, cause: String },

    #[error("update rejected by model '{name}': {cause}")]
    ModelUpdate { name: String, cause: String },

    #[error("inference failed on model '{name}': {cause}")]
    Inference { name: String, cause: String },

    #[error("inference on model '{name}' exceeded {timeout_ms}ms")]
    InferenceTimeout { name: String, timeout_ms: u64 },

    #[error("no classified event with id '{0}'")]
    UnknownEvent(String),

    #[error("attack chain '{0}' not found")]
    ChainNotFound(String),
}

impl CoreError {
    pub fn upstream(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller may retry or fall back instead of giving up
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_)
                | Self::ModelNotReady { .. }
                | Self::InferenceTimeout { .. }
                | Self::ChainLockTimeout { .. }
                | Self::UpstreamUnavailable { .. }
        )
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
