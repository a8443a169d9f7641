//! Per-actor behavioral baselines
//!
//! This module provides:
//! - Exponentially decayed mean/variance per feature dimension
//! - Deviation scoring against an actor's own history
//! - Idle-actor eviction to bound memory

mod baseline;
mod stats;

pub use baseline::{BehaviorProfiler, ProfilerConfig};
pub use stats::{ActorProfile, DeviationScore};
