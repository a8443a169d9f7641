//! Threat classification
//!
//! This module provides:
//! - The per-event classifier blending models, profiles and similarity search
//! - The similarity-search boundary and an in-process index
//! - Feedback ingestion and the continuous-learning worker

mod feedback;
mod signals;
mod similarity;
mod threat;


pub use feedback::{FeedbackQueue, UpdateConfig, UpdateCycle, UpdateWorker};
pub use signals::{
    blend, AnomalySignal, BlendPolicy, ClassificationSignal, SignalWeights, Signals,
    ANOMALOUS_CATEGORY, BENIGN_CATEGORY, UNCLASSIFIED_CATEGORY,
};
pub use similarity::{
    Embedder, FeatureEmbedder, InMemorySimilarityIndex, SimilarityMatch, SimilaritySearch,
};
pub use threat::{Classification, ClassifierConfig, FeedbackAck, ThreatClassifier};
