//! Decayed rolling statistics for a single actor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rolling baseline for one actor
///
/// Mean and variance are tracked per feature dimension with exponential
/// decay, so recent behavior dominates without keeping a sample window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorProfile {
    pub actor_id: String,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    pub observations: u64,
    pub last_seen: DateTime<Utc>,
}

impl ActorProfile {
    /// Profile seeded from a first observation
    pub fn new(actor_id: &str, features: &[f32], timestamp: DateTime<Utc>) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            mean: features.iter().map(|x| *x as f64).collect(),
            variance: vec![0.0; features.len()],
            observations: 1,
            last_seen: timestamp,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.mean.len()
    }

    /// Fold one observation in with smoothing factor `alpha`
    pub fn update(&mut self, features: &[f32], alpha: f64, timestamp: DateTime<Utc>) {
        for (i, x) in features.iter().enumerate() {
            let x = *x as f64;
            let mean = self.mean[i];
            let next = mean + alpha * (x - mean);
            self.variance[i] = (1.0 - alpha) * self.variance[i] + alpha * (x - mean) * (x - next);
            self.mean[i] = next;
        }
        self.observations += 1;
        if timestamp > self.last_seen {
            self.last_seen = timestamp;
        }
    }

    /// Variance-normalised RMS distance of `features` from the mean
    pub fn distance(&self, features: &[f32], variance_floor: f64) -> f64 {
        let n = self.dimensions().max(1) as f64;
        let sum: f64 = features
            .iter()
            .zip(self.mean.iter().zip(&self.variance))
            .map(|(x, (m, v))| {
                let d = *x as f64 - m;
                d * d / v.max(variance_floor)
            })
            .sum();
        (sum / n).sqrt()
    }
}

/// Smoothing factor for an observation `elapsed` after the previous one
///
/// Half of the old baseline's weight decays away every `half_life`; the
/// factor never drops below `min_alpha` so bursts still move the baseline.
pub fn decay_alpha(elapsed: Duration, half_life: Duration, min_alpha: f64) -> f64 {
    if half_life.is_zero() {
        return 1.0;
    }
    let ratio = elapsed.as_secs_f64() / half_life.as_secs_f64();
    (1.0 - 0.5f64.powf(ratio)).clamp(min_alpha, 1.0)
}

/// Result of scoring a feature vector against an actor baseline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviationScore {
    /// Not enough history to judge; callers treat this as neutral
    InsufficientData { observations: u64 },
    /// Non-negative distance from the baseline
    Score { distance: f64 },
}

impl DeviationScore {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, DeviationScore::InsufficientData { .. })
    }

    pub fn distance(&self) -> Option<f64> {
        match self {
            DeviationScore::Score { distance } => Some(*distance),
            DeviationScore::InsufficientData { .. } => None,
        }
    }

    /// Distance squashed onto [0, 1); `scale` is the distance mapped to ~0.63
    pub fn normalized(&self, scale: f64) -> Option<f64> {
        self.distance()
            .map(|d| 1.0 - (-d / scale.max(f64::EPSILON)).exp())
    }
}
