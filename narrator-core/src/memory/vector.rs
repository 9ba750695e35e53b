//! Embedding storage and nearest-neighbour search.

use super::MemoryError;
use crate::id::EntityId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A vector index world memory can consult when a query carries an
/// embedding. Search errors make search fall back to the structured path;
/// upsert errors fail the store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, id: EntityId, embedding: &[f32]) -> Result<(), MemoryError>;

    async fn remove(&self, id: EntityId) -> Result<(), MemoryError>;

    /// Up to `limit` ids, most similar first, with similarity in [0, 1].
    async fn nearest(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(EntityId, f32)>, MemoryError>;
}

/// Brute-force cosine index held in memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    embeddings: RwLock<HashMap<EntityId, Vec<f32>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.embeddings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.read().is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: EntityId, embedding: &[f32]) -> Result<(), MemoryError> {
        if embedding.is_empty() {
            return Err(MemoryError::Vector("empty embedding".to_string()));
        }
        self.embeddings.write().insert(id, embedding.to_vec());
        Ok(())
    }

    async fn remove(&self, id: EntityId) -> Result<(), MemoryError> {
        self.embeddings.write().remove(&id);
        Ok(())
    }

    async fn nearest(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(EntityId, f32)>, MemoryError> {
        if embedding.is_empty() {
            return Err(MemoryError::Vector("empty query embedding".to_string()));
        }

        let embeddings = self.embeddings.read();
        let mut scored = Vec::with_capacity(embeddings.len());
        for (id, stored) in embeddings.iter() {
            if stored.len() != embedding.len() {
                return Err(MemoryError::Vector(format!(
                    "dimension mismatch: query has {}, entity {id} has {}",
                    embedding.len(),
                    stored.len()
                )));
            }
            scored.push((*id, cosine_similarity(embedding, stored)));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Cosine similarity normalized from [-1, 1] to [0, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a * norm_b);
    (similarity + 1.0) / 2.0
}
