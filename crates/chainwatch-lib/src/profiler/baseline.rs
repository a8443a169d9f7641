//! Behavior profiler
//!
//! Concurrent map of actor baselines. Each actor's profile is only touched
//! under its own shard lock, so unrelated actors never contend.

use super::stats::{decay_alpha, ActorProfile, DeviationScore};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Configuration for behavior profiling
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Time for an old observation's weight to halve
    pub half_life: Duration,
    /// Lower bound on the smoothing factor
    pub min_alpha: f64,
    /// Observations required before scoring
    pub min_observations: u64,
    /// Actors unseen for this long are evicted
    pub idle_eviction: Duration,
    pub variance_floor: f64,
    /// Distance mapped to ~0.63 when normalising
    pub deviation_scale: f64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            half_life: Duration::from_secs(60 * 60),
            min_alpha: 0.02,
            min_observations: 10,
            idle_eviction: Duration::from_secs(24 * 60 * 60),
            variance_floor: 1e-3,
            deviation_scale: 3.0,
        }
    }
}

pub struct BehaviorProfiler {
    profiles: DashMap<String, ActorProfile>,
    config: ProfilerConfig,
}

impl Default for BehaviorProfiler {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}

impl BehaviorProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            profiles: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Update (or create) an actor's baseline
    ///
    /// A vector whose width differs from the stored baseline restarts the
    /// profile; the old dimensions no longer describe the same features.
    pub fn observe(&self, actor_id: &str, features: &[f32], timestamp: DateTime<Utc>) {
        let mut entry = match self.profiles.entry(actor_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(ActorProfile::new(actor_id, features, timestamp));
                return;
            }
            Entry::Occupied(occupied) => occupied,
        };

        let profile = entry.get_mut();
        if profile.dimensions() != features.len() {
            debug!(
                actor_id = %actor_id,
                old = profile.dimensions(),
                new = features.len(),
                "Feature width changed, restarting profile"
            );
            *profile = ActorProfile::new(actor_id, features, timestamp);
            return;
        }

        let elapsed = (timestamp - profile.last_seen)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let alpha = decay_alpha(elapsed, self.config.half_life, self.config.min_alpha);
        profile.update(features, alpha, timestamp);
    }

    /// Deviation of `features` from the actor's baseline
    pub fn score(&self, actor_id: &str, features: &[f32]) -> DeviationScore {
        let Some(profile) = self.profiles.get(actor_id) else {
            return DeviationScore::InsufficientData { observations: 0 };
        };
        if profile.observations < self.config.min_observations
            || profile.dimensions() != features.len()
        {
            return DeviationScore::InsufficientData {
                observations: profile.observations,
            };
        }
        DeviationScore::Score {
            distance: profile.distance(features, self.config.variance_floor),
        }
    }

    /// Remove actors idle longer than the eviction window; returns how many
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let Ok(window) = chrono::Duration::from_std(self.config.idle_eviction) else {
            return 0;
        };
        let cutoff = now - window;
        let before = self.profiles.len();
        self.profiles.retain(|_, profile| profile.last_seen >= cutoff);
        let evicted = before.saturating_sub(self.profiles.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.profiles.len(), "Evicted idle actor profiles");
        }
        evicted
    }

    pub fn profile(&self, actor_id: &str) -> Option<ActorProfile> {
        self.profiles.get(actor_id).map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn trained(observations: i64) -> BehaviorProfiler {
        let profiler = BehaviorProfiler::default();
        for i in 0..observations {
            let jitter = if i % 2 == 0 { 0.05 } else { -0.05 };
            profiler.observe("alice", &[0.5 + jitter, 0.2 - jitter], at(i * 60));
        }
        profiler
    }

    #[test]
    fn test_first_observation_creates_profile() {
        let profiler = BehaviorProfiler::default();
        profiler.observe("alice", &[0.3, 0.7], at(0));
        let profile = profiler.profile("alice").unwrap();
        assert_eq!(profile.observations, 1);
        assert_eq!(profile.mean, vec![0.3f32 as f64, 0.7f32 as f64]);
    }

    #[test]
    fn test_insufficient_data_below_minimum() {
        let profiler = trained(5);
        assert_eq!(
            profiler.score("alice", &[0.5, 0.2]),
            DeviationScore::InsufficientData { observations: 5 }
        );
        assert!(profiler.score("nobody", &[0.5, 0.2]).is_insufficient());
    }

    #[test]
    fn test_score_non_negative_and_monotonic_in_distance() {
        let profiler = trained(30);
        let near = profiler.score("alice", &[0.55, 0.2]).distance().unwrap();
        let mid = profiler.score("alice", &[0.8, 0.2]).distance().unwrap();
        let far = profiler.score("alice", &[1.0, 0.9]).distance().unwrap();
        assert!(near >= 0.0);
        assert!(near < mid && mid < far);
    }

    #[test]
    fn test_width_change_restarts_profile() {
        let profiler = trained(20);
        profiler.observe("alice", &[0.1, 0.2, 0.3], at(5000));
        let profile = profiler.profile("alice").unwrap();
        assert_eq!(profile.observations, 1);
        assert_eq!(profile.dimensions(), 3);
    }

    #[test]
    fn test_recent_behavior_dominates_after_long_gap() {
        let profiler = trained(20);
        // Ten half-lives later the baseline all but forgets the old mean
        profiler.observe("alice", &[1.0, 1.0], at(20 * 60 + 36_000));
        let profile = profiler.profile("alice").unwrap();
        assert!(profile.mean[0] > 0.99);
    }

    #[test]
    fn test_evict_idle() {
        let profiler = BehaviorProfiler::default();
        profiler.observe("old", &[0.1], at(0));
        profiler.observe("fresh", &[0.1], at(90_000));

        let evicted = profiler.evict_idle(at(90_000));
        assert_eq!(evicted, 1);
        assert!(profiler.profile("old").is_none());
        assert!(profiler.profile("fresh").is_some());
    }

    #[test]
    fn test_distinct_actors_are_independent() {
        let profiler = std::sync::Arc::new(BehaviorProfiler::default());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let profiler = profiler.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        profiler.observe(&format!("actor-{}", t), &[t as f32], at(i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(profiler.len(), 4);
        assert_eq!(profiler.profile("actor-2").unwrap().observations, 100);
    }
}
