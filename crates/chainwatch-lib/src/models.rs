//! Core data models shared across the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Free-form key/value context attached to events
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

/// Event severity as reported by the emitting sensor
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity mapped onto [0, 1]
    pub fn weight(&self) -> f32 {
        match self {
            Severity::Info => 0.0,
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        }
    }
}

/// A raw security event or tool-invocation action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub actor_id: String,
    pub asset_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub context: ContextMap,
}

impl SecurityEvent {
    /// Content fingerprint used to recognise resubmissions of the same event
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Independent inputs the classifier blends into a verdict, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Classification,
    AnomalyModel,
    BehaviorProfile,
    Similarity,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSource::Classification => write!(f, "classification"),
            SignalSource::AnomalyModel => write!(f, "anomaly_model"),
            SignalSource::BehaviorProfile => write!(f, "behavior_profile"),
            SignalSource::Similarity => write!(f, "similarity"),
        }
    }
}

/// A prior threat found by similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarThreat {
    pub id: String,
    pub similarity: f32,
}

/// Per-event classification output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatVerdict {
    pub event_id: String,
    pub threat_category: String,
    /// Blended risk in [0, 10]
    pub risk_score: f32,
    /// Calibrated confidence in [0, 1]
    pub confidence: f32,
    pub contributing_models: Vec<String>,
    /// Combined anomaly score in [0, 1]
    pub anomaly_score: f32,
    pub similar_threats: Vec<SimilarThreat>,
    /// Set when fewer than the full set of signal sources answered
    pub reduced_confidence: bool,
    #[serde(default)]
    pub unavailable_signals: Vec<SignalSource>,
    pub classified_at: DateTime<Utc>,
}

impl ThreatVerdict {
    pub fn is_benign(&self) -> bool {
        self.threat_category == "benign"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> SecurityEvent {
        SecurityEvent {
            id: "evt-1".to_string(),
            event_type: "port_scan".to_string(),
            source: "ids".to_string(),
            actor_id: "actor-a".to_string(),
            asset_id: "asset-x".to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            severity: Severity::Medium,
            indicators: vec!["T1595".to_string()],
            context: ContextMap::new(),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let event = sample_event();
        assert_eq!(event.fingerprint(), event.clone().fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let event = sample_event();
        let mut changed = event.clone();
        changed.severity = Severity::Critical;
        assert_ne!(event.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_event_json_uses_type_field() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["type"], "port_scan");
        assert_eq!(json["severity"], "medium");
    }

    #[test]
    fn test_severity_weights_are_ordered() {
        assert!(Severity::Low.weight() < Severity::High.weight());
        assert_eq!(Severity::Critical.weight(), 1.0);
    }
}
