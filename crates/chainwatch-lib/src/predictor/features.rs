//! Feature extraction for model inference
//!
//! Converts a security event plus optional caller context into a fixed-length
//! vector. Every dimension is normalised to [0, 1]; context fields that are
//! absent map to [`MISSING_FEATURE`] so partially-populated events stay
//! classifiable.

use crate::models::{ContextMap, SecurityEvent};
use chrono::Timelike;

/// Value used for any dimension whose input is missing
pub const MISSING_FEATURE: f32 = 0.0;

/// Ordered feature schema shared by the extractor and the built-in models
pub const FEATURE_SCHEMA: &[&str] = &[
    "severity",
    "hour_of_day",
    "is_off_hours",
    "indicator_count",
    "technique_indicator_count",
    "failed_auth_count",
    "bytes_out",
    "bytes_in",
    "distinct_ports",
    "distinct_hosts",
    "process_depth",
    "privileged",
    "external_destination",
    "tool_risk",
    "payload_entropy",
    "category_auth",
    "category_process",
    "category_network",
    "category_file",
    "category_tool",
];

/// Stateless event feature extractor
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    schema: Vec<String>,
    off_hours_start: u32,
    off_hours_end: u32,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            schema: FEATURE_SCHEMA.iter().map(|s| s.to_string()).collect(),
            off_hours_start: 20,
            off_hours_end: 6,
        }
    }

    /// Override the off-hours window (hours in UTC, may span midnight)
    pub fn with_off_hours(mut self, start: u32, end: u32) -> Self {
        self.off_hours_start = start % 24;
        self.off_hours_end = end % 24;
        self
    }

    /// Ordered feature names
    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    /// Extract a vector of exactly `schema().len()` values
    ///
    /// Keys in `context` take precedence over the event's own context.
    pub fn extract(&self, event: &SecurityEvent, context: Option<&ContextMap>) -> Vec<f32> {
        let lookup = |key: &str| -> Option<&serde_json::Value> {
            context
                .and_then(|c| c.get(key))
                .or_else(|| event.context.get(key))
        };
        let number = |key: &str| lookup(key).and_then(json_number);
        let flag = |key: &str| {
            lookup(key)
                .map(|v| if json_truthy(v) { 1.0 } else { 0.0 })
                .unwrap_or(MISSING_FEATURE)
        };

        let hour = event.timestamp.hour();
        let category = EventCategory::from_event_type(&event.event_type);
        let technique_indicators = event
            .indicators
            .iter()
            .filter(|i| is_technique_id(i))
            .count();

        let features = vec![
            event.severity.weight(),
            hour as f32 / 24.0,
            if self.is_off_hours(hour) { 1.0 } else { 0.0 },
            saturate(event.indicators.len() as f64, 5.0),
            saturate(technique_indicators as f64, 2.0),
            number("failed_auth_count").map_or(MISSING_FEATURE, |v| saturate(v, 5.0)),
            number("bytes_out").map_or(MISSING_FEATURE, log_bytes),
            number("bytes_in").map_or(MISSING_FEATURE, log_bytes),
            number("distinct_ports").map_or(MISSING_FEATURE, |v| saturate(v, 20.0)),
            number("distinct_hosts").map_or(MISSING_FEATURE, |v| saturate(v, 10.0)),
            number("process_depth").map_or(MISSING_FEATURE, |v| saturate(v, 4.0)),
            flag("privileged"),
            flag("external_destination"),
            number("tool_risk").map_or(MISSING_FEATURE, |v| v.clamp(0.0, 1.0) as f32),
            number("payload_entropy").map_or(MISSING_FEATURE, |v| (v / 8.0).clamp(0.0, 1.0) as f32),
            category.indicator(EventCategory::Auth),
            category.indicator(EventCategory::Process),
            category.indicator(EventCategory::Network),
            category.indicator(EventCategory::File),
            category.indicator(EventCategory::Tool),
        ];

        debug_assert_eq!(features.len(), self.schema.len());
        features
    }

    fn is_off_hours(&self, hour: u32) -> bool {
        if self.off_hours_start <= self.off_hours_end {
            hour >= self.off_hours_start && hour < self.off_hours_end
        } else {
            // Window spans midnight
            hour >= self.off_hours_start || hour < self.off_hours_end
        }
    }
}

/// Coarse event family derived from the event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventCategory {
    Auth,
    Process,
    Network,
    File,
    Tool,
    Other,
}

impl EventCategory {
    fn from_event_type(event_type: &str) -> Self {
        let t = event_type.to_ascii_lowercase();
        if t.contains("auth") || t.contains("login") || t.contains("credential") {
            EventCategory::Auth
        } else if t.contains("tool") || t.contains("command") {
            EventCategory::Tool
        } else if t.contains("process") || t.contains("exec") || t.contains("exploit") {
            EventCategory::Process
        } else if t.contains("network")
            || t.contains("dns")
            || t.contains("connection")
            || t.contains("scan")
            || t.contains("recon")
        {
            EventCategory::Network
        } else if t.contains("file") {
            EventCategory::File
        } else {
            EventCategory::Other
        }
    }

    fn indicator(&self, other: EventCategory) -> f32 {
        if *self == other {
            1.0
        } else {
            0.0
        }
    }
}

/// Whether an indicator looks like an ATT&CK technique id (`T1046`, `T1059.001`)
pub(crate) fn is_technique_id(indicator: &str) -> bool {
    let Some(rest) = indicator.strip_prefix('T') else {
        return false;
    };
    let (base, sub) = match rest.split_once('.') {
        Some((base, sub)) => (base, Some(sub)),
        None => (rest, None),
    };
    base.len() == 4
        && base.chars().all(|c| c.is_ascii_digit())
        && sub.map_or(true, |s| s.len() == 3 && s.chars().all(|c| c.is_ascii_digit()))
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn json_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
        serde_json::Value::String(s) => matches!(s.as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

/// Map a non-negative count onto [0, 1) with `scale` as the half-saturation point
fn saturate(value: f64, scale: f64) -> f32 {
    let v = value.max(0.0);
    (v / (v + scale)) as f32
}

/// log10 byte volume scaled so that 10 GB maps to 1.0
fn log_bytes(bytes: f64) -> f32 {
    ((1.0 + bytes.max(0.0)).log10() / 10.0).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn event(event_type: &str, hour: i64, context: serde_json::Value) -> SecurityEvent {
        SecurityEvent {
            id: "evt".to_string(),
            event_type: event_type.to_string(),
            source: "sensor".to_string(),
            actor_id: "alice".to_string(),
            asset_id: "db-01".to_string(),
            timestamp: DateTime::<Utc>::from_timestamp(hour * 3600, 0).unwrap(),
            severity: Severity::High,
            indicators: vec!["T1046".to_string(), "10.0.0.8".to_string()],
            context: context.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_vector_matches_schema_length() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&event("port_scan", 10, json!({})), None);
        assert_eq!(features.len(), extractor.schema().len());
        assert_eq!(extractor.schema().len(), FEATURE_SCHEMA.len());
    }

    #[test]
    fn test_missing_context_maps_to_sentinel() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&event("port_scan", 10, json!({})), None);
        let idx = FEATURE_SCHEMA.iter().position(|n| *n == "bytes_out").unwrap();
        assert_eq!(features[idx], MISSING_FEATURE);
    }

    #[test]
    fn test_all_features_normalised() {
        let extractor = FeatureExtractor::new();
        let ctx = json!({
            "failed_auth_count": 50,
            "bytes_out": 5_000_000_000u64,
            "distinct_ports": 1000,
            "privileged": true,
            "tool_risk": 7.0,
            "payload_entropy": "7.9"
        });
        let features = extractor.extract(&event("process_exec", 23, ctx), None);
        for (name, v) in FEATURE_SCHEMA.iter().zip(&features) {
            assert!((0.0..=1.0).contains(v), "{} out of range: {}", name, v);
        }
    }

    #[test]
    fn test_caller_context_overrides_event_context() {
        let extractor = FeatureExtractor::new();
        let ev = event("login_failure", 10, json!({"failed_auth_count": 1}));
        let mut extra = ContextMap::new();
        extra.insert("failed_auth_count".to_string(), json!(100));
        let idx = FEATURE_SCHEMA
            .iter()
            .position(|n| *n == "failed_auth_count")
            .unwrap();
        let base = extractor.extract(&ev, None)[idx];
        let overridden = extractor.extract(&ev, Some(&extra))[idx];
        assert!(overridden > base);
    }

    #[test]
    fn test_off_hours_window_spans_midnight() {
        let extractor = FeatureExtractor::new();
        let idx = FEATURE_SCHEMA.iter().position(|n| *n == "is_off_hours").unwrap();
        assert_eq!(extractor.extract(&event("x", 23, json!({})), None)[idx], 1.0);
        assert_eq!(extractor.extract(&event("x", 3, json!({})), None)[idx], 1.0);
        assert_eq!(extractor.extract(&event("x", 12, json!({})), None)[idx], 0.0);
    }

    #[test]
    fn test_category_one_hot() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&event("tool_invocation", 10, json!({})), None);
        let categories: f32 = features[15..].iter().sum();
        assert_eq!(categories, 1.0);
    }

    #[test]
    fn test_technique_id_detection() {
        assert!(is_technique_id("T1046"));
        assert!(is_technique_id("T1059.001"));
        assert!(!is_technique_id("T10"));
        assert!(!is_technique_id("T1059.1"));
        assert!(!is_technique_id("10.0.0.8"));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = FeatureExtractor::new();
        let ev = event("port_scan", 4, json!({"distinct_ports": 12}));
        assert_eq!(extractor.extract(&ev, None), extractor.extract(&ev, None));
    }
}
