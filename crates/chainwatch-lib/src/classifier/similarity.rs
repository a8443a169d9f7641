//! Similarity search over prior threats
//!
//! The classifier only depends on [`SimilaritySearch`]; a vector database
//! adapter plugs in behind it. [`InMemorySimilarityIndex`] is a bounded
//! brute-force cosine index for single-node deployments and tests.

use crate::error::CoreResult;
use crate::models::{ContextMap, SecurityEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// A prior threat returned by a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub id: String,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
    #[serde(default)]
    pub metadata: ContextMap,
}

impl SimilarityMatch {
    /// Risk recorded for the prior threat, if it carried one
    pub fn risk_score(&self) -> Option<f32> {
        self.metadata
            .get("risk_score")
            .and_then(|v| v.as_f64())
            .map(|v| (v as f32).clamp(0.0, 10.0))
    }

    pub fn category(&self) -> Option<&str> {
        self.metadata.get("category").and_then(|v| v.as_str())
    }
}

/// Nearest-neighbour search capability
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Up to `k` entries scoring at least `min_score`, best first
    async fn search(
        &self,
        embedding: &[f32],
        k: usize,
        min_score: f32,
    ) -> CoreResult<Vec<SimilarityMatch>>;

    /// Index a confirmed threat for future searches
    async fn upsert(&self, _id: &str, _embedding: Vec<f32>, _metadata: ContextMap) -> CoreResult<()> {
        Ok(())
    }
}

/// Maps an event to the vector space searched for prior threats
pub trait Embedder: Send + Sync {
    fn embed(&self, event: &SecurityEvent, features: &[f32]) -> Vec<f32>;
}

/// Uses the L2-normalised feature vector as the embedding
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEmbedder;

impl Embedder for FeatureEmbedder {
    fn embed(&self, _event: &SecurityEvent, features: &[f32]) -> Vec<f32> {
        normalize(features)
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    (dot / (na * nb)).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone)]
struct IndexedThreat {
    id: String,
    embedding: Vec<f32>,
    metadata: ContextMap,
}

/// Bounded in-process cosine index; the oldest entry is dropped when full
pub struct InMemorySimilarityIndex {
    entries: RwLock<VecDeque<IndexedThreat>>,
    capacity: usize,
}

impl InMemorySimilarityIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemorySimilarityIndex {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl SimilaritySearch for InMemorySimilarityIndex {
    async fn search(
        &self,
        embedding: &[f32],
        k: usize,
        min_score: f32,
    ) -> CoreResult<Vec<SimilarityMatch>> {
        let entries = self.entries.read().await;
        let mut matches: Vec<SimilarityMatch> = entries
            .iter()
            .filter_map(|entry| {
                let score = cosine(embedding, &entry.embedding);
                (score >= min_score).then(|| SimilarityMatch {
                    id: entry.id.clone(),
                    score,
                    metadata: entry.metadata.clone(),
                })
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(k);
        Ok(matches)
    }

    async fn upsert(&self, id: &str, embedding: Vec<f32>, metadata: ContextMap) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.iter_mut().find(|e| e.id == id) {
            existing.embedding = embedding;
            existing.metadata = metadata;
            return Ok(());
        }
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(IndexedThreat {
            id: id.to_string(),
            embedding,
            metadata,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(risk: f64, category: &str) -> ContextMap {
        json!({"risk_score": risk, "category": category})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_search_orders_and_filters() {
        let index = InMemorySimilarityIndex::new(10);
        index.upsert("a", vec![1.0, 0.0], meta(8.0, "execution")).await.unwrap();
        index.upsert("b", vec![0.8, 0.6], meta(6.0, "execution")).await.unwrap();
        index.upsert("c", vec![0.0, 1.0], meta(9.0, "exfiltration")).await.unwrap();

        let matches = index.search(&[1.0, 0.0], 5, 0.75).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "a");
        assert_eq!(matches[1].id, "b");
        assert_eq!(matches[0].risk_score(), Some(8.0));
        assert_eq!(matches[0].category(), Some("execution"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_evicts_oldest() {
        let index = InMemorySimilarityIndex::new(2);
        index.upsert("a", vec![1.0, 0.0], ContextMap::new()).await.unwrap();
        index.upsert("a", vec![0.0, 1.0], ContextMap::new()).await.unwrap();
        assert_eq!(index.len().await, 1);

        index.upsert("b", vec![1.0, 1.0], ContextMap::new()).await.unwrap();
        index.upsert("c", vec![1.0, 0.0], ContextMap::new()).await.unwrap();
        assert_eq!(index.len().await, 2);
        let ids: Vec<_> = index
            .search(&[1.0, 1.0], 10, -1.0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert!(!ids.contains(&"a".to_string()));
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_feature_embedder_normalises() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
