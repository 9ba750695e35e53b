//! The world memory store.

use super::summarize::{DigestSummarizer, Summarizer};
use super::{MemoryEntity, MemoryError, MemoryFilter, MemoryQuery, MemoryRelation, VectorIndex};
use crate::cache::TtlCache;
use crate::config::MemoryConfig;
use crate::id::{EntityId, SessionId};
use crate::text::{contains_word, terms};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Structured facts and relationships for every session.
///
/// Reads take a shared lock and writes an exclusive one; no lock is held
/// across an await.
pub struct WorldMemory {
    entities: RwLock<HashMap<EntityId, MemoryEntity>>,
    relations: RwLock<Vec<MemoryRelation>>,
    vectors: Option<Arc<dyn VectorIndex>>,
    summarizer: Arc<dyn Summarizer>,
    summaries: Mutex<TtlCache<u64, String>>,
}

impl WorldMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            relations: RwLock::new(Vec::new()),
            vectors: None,
            summarizer: Arc::new(DigestSummarizer),
            summaries: Mutex::new(TtlCache::new(
                config.summary_cache_capacity,
                config.summary_cache_ttl(),
            )),
        }
    }

    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vectors = Some(index);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Insert or update an entity by id.
    ///
    /// An update keeps the original `created_at`; every store bumps
    /// `version`. An embedding is indexed first; if the vector index
    /// rejects it the store fails and nothing is written.
    pub async fn store(&self, mut entity: MemoryEntity) -> Result<EntityId, MemoryError> {
        if entity.name.trim().is_empty() {
            return Err(MemoryError::Invalid("entity name is empty".to_string()));
        }
        entity.importance = entity.importance.clamp(0.0, 1.0);

        let id = entity.id;
        if let (Some(index), Some(embedding)) = (&self.vectors, &entity.embedding) {
            if let Err(e) = index.upsert(id, embedding).await {
                warn!(entity = %id, error = %e, "Failed to index embedding");
                return Err(e);
            }
        }

        {
            let mut entities = self.entities.write();
            let now = Utc::now();
            match entities.get(&id) {
                Some(existing) => {
                    entity.created_at = existing.created_at;
                    entity.version = existing.version + 1;
                }
                None => {
                    entity.version = 1;
                }
            }
            entity.updated_at = now;
            debug!(entity = %id, kind = %entity.kind, version = entity.version, "Storing memory entity");
            entities.insert(id, entity);
        }

        Ok(id)
    }

    pub fn get(&self, id: EntityId) -> Option<MemoryEntity> {
        self.entities.read().get(&id).cloned()
    }

    /// Remove an entity and every relation touching it.
    pub async fn remove(&self, id: EntityId) -> Option<MemoryEntity> {
        let removed = self.entities.write().remove(&id)?;
        self.relations.write().retain(|r| !r.involves(id));

        if let Some(index) = &self.vectors {
            if let Err(e) = index.remove(id).await {
                warn!(entity = %id, error = %e, "Failed to remove embedding");
            }
        }

        Some(removed)
    }

    /// Every entity of a session, most important first.
    pub fn entities_for(&self, session: SessionId) -> Vec<MemoryEntity> {
        let mut found: Vec<MemoryEntity> = self
            .entities
            .read()
            .values()
            .filter(|e| e.session_id == session)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| a.name.cmp(&b.name))
        });
        found
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Ranked entities matching `query` within `filter`.
    ///
    /// With an embedding and a vector index, results come from
    /// nearest-neighbour search. If that fails or finds nothing the search
    /// falls back to matching the query text against names and attributes.
    pub async fn search(
        &self,
        query: &MemoryQuery,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Vec<MemoryEntity> {
        if limit == 0 {
            return Vec::new();
        }

        if let (Some(index), Some(embedding)) = (&self.vectors, &query.embedding) {
            // Over-fetch since the filter is applied afterwards.
            match index.nearest(embedding, limit.saturating_mul(4)).await {
                Ok(hits) => {
                    let entities = self.entities.read();
                    let found: Vec<MemoryEntity> = hits
                        .into_iter()
                        .filter_map(|(id, _)| entities.get(&id))
                        .filter(|e| filter.matches(e))
                        .take(limit)
                        .cloned()
                        .collect();
                    if !found.is_empty() {
                        return found;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Vector search failed, using text search");
                }
            }
        }

        self.search_text(&query.text, filter, limit)
    }

    fn search_text(&self, text: &str, filter: &MemoryFilter, limit: usize) -> Vec<MemoryEntity> {
        let query_terms = terms(text);
        let entities = self.entities.read();

        let mut scored: Vec<(usize, &MemoryEntity)> = entities
            .values()
            .filter(|e| filter.matches(e))
            .filter_map(|entity| {
                if query_terms.is_empty() {
                    return Some((0, entity));
                }
                let haystack = entity.haystack();
                let mut score = query_terms
                    .iter()
                    .filter(|t| haystack.contains(t.as_str()))
                    .count();
                // Naming the entity outright counts for more than any one term.
                if contains_word(text, &entity.name) {
                    score += 2;
                }
                (score > 0).then_some((score, entity))
            })
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .cmp(score_a)
                .then_with(|| b.importance.total_cmp(&a.importance))
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Add a relation, replacing any with the same endpoints and type.
    pub fn link(&self, mut relation: MemoryRelation) -> Result<(), MemoryError> {
        {
            let entities = self.entities.read();
            for id in [relation.source, relation.target] {
                if !entities.contains_key(&id) {
                    return Err(MemoryError::NotFound(id));
                }
            }
        }
        if relation.relation_type.trim().is_empty() {
            return Err(MemoryError::Invalid("relation type is empty".to_string()));
        }
        relation.confidence = relation.confidence.clamp(0.0, 1.0);

        let mut relations = self.relations.write();
        relations.retain(|r| !r.same_edge(&relation));
        relations.push(relation);
        Ok(())
    }

    /// Entities related to `id` in either direction, optionally only through
    /// one relation type.
    pub fn related(&self, id: EntityId, relation_type: Option<&str>) -> Vec<MemoryEntity> {
        self.related_where(id, relation_type, |_| true)
    }

    /// Like [`related`](Self::related), but only relations valid at `turn`.
    pub fn related_at(
        &self,
        id: EntityId,
        relation_type: Option<&str>,
        turn: u64,
    ) -> Vec<MemoryEntity> {
        self.related_where(id, relation_type, |r| r.valid_at(turn))
    }

    fn related_where(
        &self,
        id: EntityId,
        relation_type: Option<&str>,
        keep: impl Fn(&MemoryRelation) -> bool,
    ) -> Vec<MemoryEntity> {
        let others: Vec<EntityId> = self
            .relations
            .read()
            .iter()
            .filter(|r| r.involves(id))
            .filter(|r| relation_type.map_or(true, |t| r.relation_type == t))
            .filter(|r| keep(r))
            .map(|r| r.other(id))
            .collect();

        let entities = self.entities.read();
        let mut seen = Vec::with_capacity(others.len());
        for other in others {
            if let Some(entity) = entities.get(&other) {
                if !seen.iter().any(|e: &MemoryEntity| e.id == other) {
                    seen.push(entity.clone());
                }
            }
        }
        seen
    }

    /// Relations touching an entity.
    pub fn relations_of(&self, id: EntityId) -> Vec<MemoryRelation> {
        self.relations
            .read()
            .iter()
            .filter(|r| r.involves(id))
            .cloned()
            .collect()
    }

    /// Summarize a set of entities.
    ///
    /// Cached by the ids and versions of the input, so the same facts are
    /// only summarized once while they stay unchanged.
    pub async fn summarize(&self, entities: &[MemoryEntity]) -> Result<String, MemoryError> {
        let key = summary_key(entities);
        if let Some(cached) = self.summaries.lock().get(&key) {
            return Ok(cached);
        }

        let summary = self.summarizer.summarize(entities).await?;
        self.summaries.lock().insert(key, summary.clone());
        Ok(summary)
    }
}

fn summary_key(entities: &[MemoryEntity]) -> u64 {
    let mut keys: Vec<(EntityId, u64)> = entities.iter().map(|e| (e.id, e.version)).collect();
    keys.sort();
    let mut hasher = DefaultHasher::new();
    for (id, version) in keys {
        id.as_uuid().hash(&mut hasher);
        version.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EntityKind, InMemoryVectorIndex, TurnRange};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory() -> WorldMemory {
        WorldMemory::new(&MemoryConfig::default())
    }

    struct CountingSummarizer(AtomicUsize);

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, entities: &[MemoryEntity]) -> Result<String, MemoryError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} entities", entities.len()))
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl VectorIndex for BrokenIndex {
        async fn upsert(&self, _: EntityId, _: &[f32]) -> Result<(), MemoryError> {
            Err(MemoryError::Vector("offline".into()))
        }
        async fn remove(&self, _: EntityId) -> Result<(), MemoryError> {
            Err(MemoryError::Vector("offline".into()))
        }
        async fn nearest(&self, _: &[f32], _: usize) -> Result<Vec<(EntityId, f32)>, MemoryError> {
            Err(MemoryError::Vector("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_store_then_get() {
        let memory = memory();
        let session = SessionId::new();
        let entity = MemoryEntity::new(session, EntityKind::Character, "Mira")
            .with_attr("role", "smuggler");

        let id = memory.store(entity).await.unwrap();
        let stored = memory.get(id).unwrap();
        assert_eq!(stored.attr_str("role"), Some("smuggler"));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at_and_bumps_version() {
        let memory = memory();
        let session = SessionId::new();
        let id = memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira"))
            .await
            .unwrap();
        let first = memory.get(id).unwrap();

        let update = MemoryEntity::new(session, EntityKind::Character, "Mira")
            .with_attr("status", "wounded");
        assert_eq!(memory.store(update).await.unwrap(), id);

        let second = memory.get(id).unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.version, 2);
        assert_eq!(second.attr_str("status"), Some("wounded"));
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let result = memory()
            .store(MemoryEntity::new(SessionId::new(), EntityKind::Fact, "  "))
            .await;
        assert!(matches!(result, Err(MemoryError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_text_search_ranks_matches() {
        let memory = memory();
        let session = SessionId::new();
        memory
            .store(
                MemoryEntity::new(session, EntityKind::Location, "Old Tower")
                    .with_attr("description", "a crumbling tower by the sea"),
            )
            .await
            .unwrap();
        memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira").with_importance(0.9))
            .await
            .unwrap();
        memory
            .store(MemoryEntity::new(SessionId::new(), EntityKind::Location, "Tower of Elsewhere"))
            .await
            .unwrap();

        let found = memory
            .search(
                &MemoryQuery::text("I climb the old tower"),
                &MemoryFilter::session(session),
                10,
            )
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Old Tower");

        let everything = memory
            .search(&MemoryQuery::default(), &MemoryFilter::session(session), 10)
            .await;
        assert_eq!(everything.len(), 2);
        assert_eq!(everything[0].name, "Mira");
    }

    #[tokio::test]
    async fn test_filter_by_kind_and_importance() {
        let memory = memory();
        let session = SessionId::new();
        memory
            .store(MemoryEntity::new(session, EntityKind::Fact, "The bridge fell").with_importance(0.2))
            .await
            .unwrap();
        memory
            .store(MemoryEntity::new(session, EntityKind::Fact, "The king lives").with_importance(0.8))
            .await
            .unwrap();

        let filter = MemoryFilter::session(session)
            .with_kind(EntityKind::Fact)
            .with_min_importance(0.5);
        let found = memory.search(&MemoryQuery::default(), &filter, 10).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "The king lives");
    }

    #[tokio::test]
    async fn test_vector_search_and_fallback() {
        let session = SessionId::new();
        let memory = memory().with_vector_index(Arc::new(InMemoryVectorIndex::new()));
        memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira").with_embedding(vec![1.0, 0.0]))
            .await
            .unwrap();
        memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Aldric").with_embedding(vec![0.0, 1.0]))
            .await
            .unwrap();

        let query = MemoryQuery::text("nothing matches this").with_embedding(vec![0.1, 0.9]);
        let found = memory.search(&query, &MemoryFilter::session(session), 1).await;
        assert_eq!(found[0].name, "Aldric");

        let broken = WorldMemory::new(&MemoryConfig::default()).with_vector_index(Arc::new(BrokenIndex));
        broken
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira").with_embedding(vec![1.0]))
            .await
            .unwrap();
        let query = MemoryQuery::text("where is Mira").with_embedding(vec![1.0]);
        let found = broken.search(&query, &MemoryFilter::session(session), 5).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Mira");
    }

    #[tokio::test]
    async fn test_link_and_related() {
        let memory = memory();
        let session = SessionId::new();
        let mira = memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira"))
            .await
            .unwrap();
        let tower = memory
            .store(MemoryEntity::new(session, EntityKind::Location, "Tower"))
            .await
            .unwrap();
        let aldric = memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Aldric"))
            .await
            .unwrap();

        memory
            .link(MemoryRelation::new(mira, tower, "located_in").with_validity(TurnRange::between(1, 3)))
            .unwrap();
        memory.link(MemoryRelation::new(aldric, mira, "ally_of")).unwrap();

        assert_eq!(memory.related(mira, None).len(), 2);
        let allies = memory.related(mira, Some("ally_of"));
        assert_eq!(allies.len(), 1);
        assert_eq!(allies[0].name, "Aldric");

        assert_eq!(memory.related_at(mira, Some("located_in"), 2).len(), 1);
        assert!(memory.related_at(mira, Some("located_in"), 4).is_empty());

        // Same edge replaces rather than duplicates
        memory
            .link(MemoryRelation::new(mira, tower, "located_in").with_confidence(0.4))
            .unwrap();
        assert_eq!(memory.relations_of(tower).len(), 1);
        assert_eq!(memory.relations_of(tower)[0].confidence, 0.4);
    }

    #[tokio::test]
    async fn test_link_requires_both_endpoints() {
        let memory = memory();
        let session = SessionId::new();
        let mira = memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira"))
            .await
            .unwrap();
        let ghost = EntityId::new();
        let result = memory.link(MemoryRelation::new(mira, ghost, "haunts"));
        assert!(matches!(result, Err(MemoryError::NotFound(id)) if id == ghost));
    }

    #[tokio::test]
    async fn test_remove_drops_relations() {
        let memory = memory();
        let session = SessionId::new();
        let a = memory
            .store(MemoryEntity::new(session, EntityKind::Character, "A"))
            .await
            .unwrap();
        let b = memory
            .store(MemoryEntity::new(session, EntityKind::Character, "B"))
            .await
            .unwrap();
        memory.link(MemoryRelation::new(a, b, "knows")).unwrap();

        assert!(memory.remove(a).await.is_some());
        assert!(memory.get(a).is_none());
        assert!(memory.relations_of(b).is_empty());
        assert!(memory.remove(a).await.is_none());
    }

    #[tokio::test]
    async fn test_summaries_are_cached_by_version() {
        let summarizer = Arc::new(CountingSummarizer(AtomicUsize::new(0)));
        let memory = memory().with_summarizer(summarizer.clone());
        let session = SessionId::new();
        let id = memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira"))
            .await
            .unwrap();

        let entities = memory.entities_for(session);
        memory.summarize(&entities).await.unwrap();
        memory.summarize(&entities).await.unwrap();
        assert_eq!(summarizer.0.load(Ordering::SeqCst), 1);

        memory
            .store(MemoryEntity::new(session, EntityKind::Character, "Mira").with_attr("mood", "wary"))
            .await
            .unwrap();
        let entities = memory.entities_for(session);
        memory.summarize(&entities).await.unwrap();
        assert_eq!(summarizer.0.load(Ordering::SeqCst), 2);

        // Summarizing never changes what is stored
        assert_eq!(memory.get(id).unwrap().attr_str("mood"), Some("wary"));
    }
}
