//! Signal blending
//!
//! Turns the answers (or non-answers) of each signal source into a single
//! verdict. Sources are listed in priority order; a source that failed is
//! recorded as unavailable, while a source that answered with nothing to say
//! (no similar threats, too little profile history) is neutral.

use super::similarity::SimilarityMatch;
use crate::models::{SignalSource, SimilarThreat, ThreatVerdict};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Label the classification models use for non-threats
pub const BENIGN_CATEGORY: &str = "benign";
/// Category assigned when only the anomaly signal fires
pub const ANOMALOUS_CATEGORY: &str = "anomalous_behavior";
/// Category assigned when no source names one
pub const UNCLASSIFIED_CATEGORY: &str = "unclassified";

/// Relative weight of each signal group in the blended risk
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalWeights {
    pub classification: f32,
    pub anomaly: f32,
    pub similarity: f32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            classification: 0.5,
            anomaly: 0.3,
            similarity: 0.2,
        }
    }
}

impl SignalWeights {
    fn total(&self) -> f32 {
        self.classification + self.anomaly + self.similarity
    }
}

/// Answer from the first classification model that responded
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationSignal {
    pub model: String,
    pub label: String,
    /// Probability of the winning label
    pub confidence: f32,
    /// Probability mass on the benign label
    pub benign_probability: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalySignal {
    pub model: String,
    /// Probability the event is anomalous
    pub probability: f32,
}

/// Everything gathered for one event
#[derive(Debug, Clone, Default)]
pub struct Signals {
    /// `None` when every classification model failed
    pub classification: Option<ClassificationSignal>,
    /// `None` when the anomaly model failed
    pub anomaly_model: Option<AnomalySignal>,
    /// Normalised profile deviation; `None` while the profile is immature
    pub profile_deviation: Option<f32>,
    /// `None` when the search failed; empty when nothing was close enough
    pub similarity: Option<Vec<SimilarityMatch>>,
}

/// Blending parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendPolicy {
    pub weights: SignalWeights,
    /// Share of the anomaly score taken from the behavior profile
    pub profile_weight: f32,
    /// Minimum number of signal groups that must carry a value
    pub min_quorum: usize,
}

impl Default for BlendPolicy {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            profile_weight: 0.5,
            min_quorum: 1,
        }
    }
}

/// Risk given when a similar prior threat carried no recorded risk
const DEFAULT_PRIOR_RISK: f32 = 5.0;

/// Blend `signals` into a verdict, or `None` if the quorum is not met
pub fn blend(event_id: &str, signals: &Signals, policy: &BlendPolicy) -> Option<ThreatVerdict> {
    let weights = policy.weights;
    let mut weighted_risk = 0.0f32;
    let mut valued_weight = 0.0f32;
    let mut weighted_confidence = 0.0f32;
    let mut quorum = 0usize;
    let mut contributing = Vec::new();
    let mut unavailable = Vec::new();

    match &signals.classification {
        Some(c) => {
            let risk = 10.0 * (1.0 - c.benign_probability).clamp(0.0, 1.0) * c.confidence;
            weighted_risk += weights.classification * risk;
            valued_weight += weights.classification;
            weighted_confidence += weights.classification * c.confidence;
            quorum += 1;
            contributing.push(c.model.clone());
        }
        None => unavailable.push(SignalSource::Classification),
    }

    let anomaly_score = anomaly_score(signals, policy.profile_weight);
    if signals.anomaly_model.is_none() {
        unavailable.push(SignalSource::AnomalyModel);
    }
    if let Some(model) = &signals.anomaly_model {
        contributing.push(model.model.clone());
    }
    if signals.profile_deviation.is_some() {
        contributing.push(SignalSource::BehaviorProfile.to_string());
    }
    if let Some(a) = anomaly_score {
        weighted_risk += weights.anomaly * 10.0 * a;
        valued_weight += weights.anomaly;
        // Scores near either end are decisive, 0.5 is a coin toss
        weighted_confidence += weights.anomaly * (0.5 + (a - 0.5).abs());
        quorum += 1;
    }

    let mut similar_threats = Vec::new();
    match &signals.similarity {
        Some(matches) if !matches.is_empty() => {
            let (risk, confidence) = similarity_risk(matches);
            weighted_risk += weights.similarity * risk;
            valued_weight += weights.similarity;
            weighted_confidence += weights.similarity * confidence;
            quorum += 1;
            contributing.push(SignalSource::Similarity.to_string());
            similar_threats = matches
                .iter()
                .map(|m| SimilarThreat {
                    id: m.id.clone(),
                    similarity: m.score,
                })
                .collect();
        }
        Some(_) => {}
        None => unavailable.push(SignalSource::Similarity),
    }

    if quorum < policy.min_quorum.max(1) || valued_weight <= 0.0 {
        return None;
    }

    let risk_score = (weighted_risk / valued_weight).clamp(0.0, 10.0);
    let confidence = (weighted_confidence / weights.total().max(f32::EPSILON)).clamp(0.0, 1.0);

    let threat_category = signals
        .classification
        .as_ref()
        .map(|c| c.label.clone())
        .or_else(|| {
            signals
                .similarity
                .as_ref()
                .and_then(|m| m.first())
                .and_then(|m| m.category().map(str::to_string))
        })
        .unwrap_or_else(|| match anomaly_score {
            Some(a) if a >= 0.5 => ANOMALOUS_CATEGORY.to_string(),
            Some(_) => BENIGN_CATEGORY.to_string(),
            None => UNCLASSIFIED_CATEGORY.to_string(),
        });

    Some(ThreatVerdict {
        event_id: event_id.to_string(),
        threat_category,
        risk_score,
        confidence,
        contributing_models: contributing,
        anomaly_score: anomaly_score.unwrap_or(0.0),
        similar_threats,
        reduced_confidence: !unavailable.is_empty(),
        unavailable_signals: unavailable,
        classified_at: Utc::now(),
    })
}

/// Anomaly model probability mixed with profile deviation
fn anomaly_score(signals: &Signals, profile_weight: f32) -> Option<f32> {
    let model = signals.anomaly_model.as_ref().map(|m| m.probability);
    let profile = signals.profile_deviation;
    let w = profile_weight.clamp(0.0, 1.0);
    match (model, profile) {
        (Some(m), Some(p)) => Some((1.0 - w) * m + w * p),
        (Some(m), None) => Some(m),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    }
    .map(|a| a.clamp(0.0, 1.0))
}

/// Similarity-weighted prior risk, scaled by the best match
fn similarity_risk(matches: &[SimilarityMatch]) -> (f32, f32) {
    let total: f32 = matches.iter().map(|m| m.score.max(0.0)).sum();
    let best = matches.iter().map(|m| m.score).fold(0.0f32, f32::max);
    if total <= 0.0 {
        return (0.0, 0.0);
    }
    let mean_risk = matches
        .iter()
        .map(|m| m.score.max(0.0) * m.risk_score().unwrap_or(DEFAULT_PRIOR_RISK))
        .sum::<f32>()
        / total;
    (mean_risk * best, best.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classification(label: &str, confidence: f32, benign: f32) -> Option<ClassificationSignal> {
        Some(ClassificationSignal {
            model: "threat-classifier".to_string(),
            label: label.to_string(),
            confidence,
            benign_probability: benign,
        })
    }

    fn anomaly(p: f32) -> Option<AnomalySignal> {
        Some(AnomalySignal {
            model: "behavior-anomaly".to_string(),
            probability: p,
        })
    }

    fn prior(id: &str, score: f32, risk: f64, category: &str) -> SimilarityMatch {
        SimilarityMatch {
            id: id.to_string(),
            score,
            metadata: json!({"risk_score": risk, "category": category})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    #[test]
    fn test_full_signal_blend() {
        let signals = Signals {
            classification: classification("execution", 0.8, 0.1),
            anomaly_model: anomaly(0.6),
            profile_deviation: None,
            similarity: Some(vec![prior("t1", 0.9, 8.0, "execution")]),
        };
        let verdict = blend("e1", &signals, &BlendPolicy::default()).unwrap();

        // 0.5 * 7.2 + 0.3 * 6.0 + 0.2 * 7.2 = 6.84
        assert!((verdict.risk_score - 6.84).abs() < 1e-4);
        assert_eq!(verdict.threat_category, "execution");
        assert!(!verdict.reduced_confidence);
        assert_eq!(verdict.similar_threats.len(), 1);
        assert!((0.0..=1.0).contains(&verdict.confidence));
    }

    #[test]
    fn test_missing_classifier_degrades_not_fails() {
        let signals = Signals {
            classification: None,
            anomaly_model: anomaly(0.9),
            profile_deviation: None,
            similarity: Some(vec![]),
        };
        let verdict = blend("e1", &signals, &BlendPolicy::default()).unwrap();
        assert!(verdict.reduced_confidence);
        assert_eq!(verdict.unavailable_signals, vec![SignalSource::Classification]);
        assert_eq!(verdict.threat_category, ANOMALOUS_CATEGORY);
        assert!((verdict.risk_score - 9.0).abs() < 1e-4);
    }

    #[test]
    fn test_degraded_confidence_is_lower() {
        let full = Signals {
            classification: classification("execution", 0.9, 0.05),
            anomaly_model: anomaly(0.9),
            profile_deviation: None,
            similarity: Some(vec![prior("t1", 0.9, 8.0, "execution")]),
        };
        let partial = Signals {
            classification: None,
            ..full.clone()
        };
        let policy = BlendPolicy::default();
        assert!(
            blend("e", &partial, &policy).unwrap().confidence
                < blend("e", &full, &policy).unwrap().confidence
        );
    }

    #[test]
    fn test_no_valued_source_is_insufficient() {
        let signals = Signals {
            classification: None,
            anomaly_model: None,
            profile_deviation: None,
            similarity: None,
        };
        assert!(blend("e1", &signals, &BlendPolicy::default()).is_none());

        let empty_search = Signals {
            similarity: Some(vec![]),
            ..signals
        };
        assert!(blend("e1", &empty_search, &BlendPolicy::default()).is_none());
    }

    #[test]
    fn test_profile_alone_carries_anomaly() {
        let signals = Signals {
            classification: None,
            anomaly_model: None,
            profile_deviation: Some(0.2),
            similarity: None,
        };
        let verdict = blend("e1", &signals, &BlendPolicy::default()).unwrap();
        assert_eq!(verdict.threat_category, "benign");
        assert!((verdict.anomaly_score - 0.2).abs() < 1e-6);
        assert_eq!(verdict.unavailable_signals.len(), 3);
    }

    #[test]
    fn test_category_falls_back_to_similar_threat() {
        let signals = Signals {
            classification: None,
            anomaly_model: anomaly(0.1),
            profile_deviation: None,
            similarity: Some(vec![prior("t9", 0.95, 9.0, "lateral_movement")]),
        };
        let verdict = blend("e1", &signals, &BlendPolicy::default()).unwrap();
        assert_eq!(verdict.threat_category, "lateral_movement");
    }

    #[test]
    fn test_quorum_is_configurable() {
        let signals = Signals {
            classification: classification("benign", 0.9, 0.9),
            anomaly_model: None,
            profile_deviation: None,
            similarity: Some(vec![]),
        };
        let strict = BlendPolicy {
            min_quorum: 2,
            ..BlendPolicy::default()
        };
        assert!(blend("e1", &signals, &strict).is_none());
        assert!(blend("e1", &signals, &BlendPolicy::default()).is_some());
    }

    #[test]
    fn test_benign_classification_is_low_risk() {
        let signals = Signals {
            classification: classification("benign", 0.95, 0.95),
            anomaly_model: anomaly(0.05),
            profile_deviation: Some(0.05),
            similarity: Some(vec![]),
        };
        let verdict = blend("e1", &signals, &BlendPolicy::default()).unwrap();
        assert!(verdict.risk_score < 1.0);
        assert!(verdict.is_benign());
    }
}
