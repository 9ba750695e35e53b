//! Memory updates carried by a narrative reply.
//!
//! The narrator may end its reply with a fenced block of facts it
//! established:
//!
//! ````text
//! ```memory
//! {"entities": [{"kind": "character", "name": "Mira", "content": {"status": "wounded"}}],
//!  "relations": [{"source": "Mira", "target": "Harbor", "type": "located_in"}]}
//! ```
//! ````
//!
//! The block is stripped from the narrative the player sees.

use crate::id::SessionId;
use crate::memory::{EntityKind, MemoryEntity, MemoryError, MemoryRelation, TurnRange};
use crate::text::contains_word;
use serde::Deserialize;
use std::collections::BTreeMap;

const FENCE_OPEN: &str = "```memory";
const FENCE_CLOSE: &str = "```";

/// Added to an existing entity's importance each time the narrative names it.
pub const MENTION_BUMP: f32 = 0.05;

/// Appended to the narrator's system prompt so replies carry their facts.
pub const MEMORY_BLOCK_INSTRUCTIONS: &str = "After the narrative, if the story established \
new facts, add a fenced block tagged `memory` holding JSON of the form \
{\"entities\": [{\"kind\": \"character|location|fact|plotline|style\", \"name\": \"...\", \
\"content\": {}, \"importance\": 0.5}], \"relations\": [{\"source\": \"name\", \
\"target\": \"name\", \"type\": \"...\", \"confidence\": 1.0}]}. Omit the block if nothing changed.";

/// Split a reply into its narrative and the contents of a trailing
/// `memory` block, if it has one.
pub fn split_memory_block(reply: &str) -> (String, Option<&str>) {
    let Some(start) = reply.rfind(FENCE_OPEN) else {
        return (reply.trim().to_string(), None);
    };
    let body_start = start + FENCE_OPEN.len();
    let Some(len) = reply[body_start..].find(FENCE_CLOSE) else {
        return (reply.trim().to_string(), None);
    };
    let body = reply[body_start..body_start + len].trim();
    let rest = &reply[body_start + len + FENCE_CLOSE.len()..];

    let mut narrative = reply[..start].trim_end().to_string();
    let rest = rest.trim();
    if !rest.is_empty() {
        narrative.push_str("\n\n");
        narrative.push_str(rest);
    }
    (narrative.trim().to_string(), Some(body))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemoryDelta {
    #[serde(default)]
    pub entities: Vec<EntityUpdate>,
    #[serde(default)]
    pub relations: Vec<RelationUpdate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityUpdate {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub content: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub importance: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelationUpdate {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Entities to store and relations to link, ready for world memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDelta {
    pub entities: Vec<MemoryEntity>,
    pub relations: Vec<MemoryRelation>,
}

impl ResolvedDelta {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

impl MemoryDelta {
    pub fn parse(json: &str) -> Result<Self, MemoryError> {
        serde_json::from_str(json).map_err(|e| MemoryError::Invalid(format!("memory block: {e}")))
    }

    /// Turn the raw updates into entities and relations for `session`.
    ///
    /// Updates to entities already in `existing` merge into them. Existing
    /// entities named in `narrative` gain [`MENTION_BUMP`] importance.
    /// Relations name their endpoints; those naming unknown entities are
    /// skipped. New relations hold from turn `sequence` on.
    pub fn resolve(
        &self,
        session: SessionId,
        existing: &[MemoryEntity],
        narrative: &str,
        sequence: u64,
    ) -> Result<ResolvedDelta, MemoryError> {
        let mut entities: Vec<MemoryEntity> = Vec::new();

        for update in &self.entities {
            let kind = EntityKind::parse(&update.kind)
                .ok_or_else(|| MemoryError::Invalid(format!("unknown entity kind '{}'", update.kind)))?;
            if update.name.trim().is_empty() {
                return Err(MemoryError::Invalid("entity without a name".to_string()));
            }

            let fresh = MemoryEntity::new(session, kind, update.name.trim());
            let mut entity = existing
                .iter()
                .find(|e| e.id == fresh.id)
                .cloned()
                .unwrap_or(fresh);
            entity
                .content
                .extend(update.content.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(importance) = update.importance {
                entity.importance = importance.clamp(0.0, 1.0);
            }
            push_or_replace(&mut entities, entity);
        }

        for known in existing {
            if known.session_id != session || !contains_word(narrative, &known.name) {
                continue;
            }
            match entities.iter_mut().find(|e| e.id == known.id) {
                Some(updated) => {
                    updated.importance = (updated.importance + MENTION_BUMP).min(1.0);
                }
                None => {
                    let mut bumped = known.clone();
                    bumped.importance = (bumped.importance + MENTION_BUMP).min(1.0);
                    entities.push(bumped);
                }
            }
        }

        let find = |name: &str| {
            let name = name.trim();
            entities
                .iter()
                .chain(existing.iter().filter(|e| e.session_id == session))
                .find(|e| e.name.eq_ignore_ascii_case(name))
                .map(|e| e.id)
        };
        let relations = self
            .relations
            .iter()
            .filter_map(|update| {
                let source = find(update.source.as_str())?;
                let target = find(update.target.as_str())?;
                let mut relation = MemoryRelation::new(source, target, update.relation_type.trim())
                    .with_validity(TurnRange::since(sequence));
                if let Some(confidence) = update.confidence {
                    relation = relation.with_confidence(confidence);
                }
                Some(relation)
            })
            .collect();

        Ok(ResolvedDelta {
            entities,
            relations,
        })
    }
}

fn push_or_replace(entities: &mut Vec<MemoryEntity>, entity: MemoryEntity) {
    match entities.iter_mut().find(|e| e.id == entity.id) {
        Some(slot) => {
            slot.content.extend(entity.content);
            slot.importance = entity.importance;
        }
        None => entities.push(entity),
    }
}
