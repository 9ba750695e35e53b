//! World memory: structured facts about the story, their relationships, and
//! retrieval over both.
//!
//! - [`WorldMemory`]: the store the pipeline reads before a turn and updates
//!   after one
//! - [`VectorIndex`]: optional similarity search over entity embeddings
//! - [`Summarizer`]: digest or LLM prose for a set of entities

mod entity;
mod relationship;
mod store;
mod summarize;
mod vector;

pub use entity::{EntityKind, MemoryEntity};
pub use relationship::{MemoryRelation, TurnRange};
pub use store::WorldMemory;
pub use summarize::{DigestSummarizer, LlmSummarizer, Summarizer};
pub use vector::{cosine_similarity, InMemoryVectorIndex, VectorIndex};

use crate::error::ErrorKind;
use crate::id::{EntityId, SessionId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("entity not found: {0}")]
    NotFound(EntityId),

    #[error("invalid memory data: {0}")]
    Invalid(String),

    #[error("vector index error: {0}")]
    Vector(String),

    #[error("summarization failed: {0}")]
    Summarize(String),
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Memory
    }
}

/// What to look for.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    /// Matched against entity names and attributes. Empty matches everything.
    pub text: String,
    /// Used for nearest-neighbour search when a vector index is configured.
    pub embedding: Option<Vec<f32>>,
}

impl MemoryQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Restricts which entities a search may return.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub session: Option<SessionId>,
    /// Empty allows every kind.
    pub kinds: Vec<EntityKind>,
    pub min_importance: Option<f32>,
}

impl MemoryFilter {
    pub fn session(session: SessionId) -> Self {
        Self {
            session: Some(session),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn with_min_importance(mut self, importance: f32) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn matches(&self, entity: &MemoryEntity) -> bool {
        self.session.map_or(true, |s| entity.session_id == s)
            && (self.kinds.is_empty() || self.kinds.contains(&entity.kind))
            && self.min_importance.map_or(true, |min| entity.importance >= min)
    }
}
