//! Relationships between entities.

use crate::id::EntityId;
use serde::{Deserialize, Serialize};

/// Inclusive range of turn sequence numbers. An open end means "still true".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRange {
    pub from: u64,
    pub until: Option<u64>,
}

impl TurnRange {
    pub fn since(from: u64) -> Self {
        Self { from, until: None }
    }

    pub fn between(from: u64, until: u64) -> Self {
        Self {
            from,
            until: Some(until),
        }
    }

    pub fn contains(&self, turn: u64) -> bool {
        turn >= self.from && self.until.map_or(true, |until| turn <= until)
    }
}

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRelation {
    pub source: EntityId,
    pub target: EntityId,
    /// Free-form, e.g. `ally_of`, `located_in`.
    pub relation_type: String,
    /// 0.0 to 1.0.
    pub confidence: f32,
    /// When the relation holds. `None` means always.
    #[serde(default)]
    pub valid: Option<TurnRange>,
}

impl MemoryRelation {
    pub fn new(source: EntityId, target: EntityId, relation_type: impl Into<String>) -> Self {
        Self {
            source,
            target,
            relation_type: relation_type.into(),
            confidence: 1.0,
            valid: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_validity(mut self, valid: TurnRange) -> Self {
        self.valid = Some(valid);
        self
    }

    /// Same endpoints and type; storing a matching relation replaces it.
    pub(crate) fn same_edge(&self, other: &MemoryRelation) -> bool {
        self.source == other.source
            && self.target == other.target
            && self.relation_type == other.relation_type
    }

    pub(crate) fn involves(&self, id: EntityId) -> bool {
        self.source == id || self.target == id
    }

    /// The entity at the other end from `id`.
    pub(crate) fn other(&self, id: EntityId) -> EntityId {
        if self.source == id {
            self.target
        } else {
            self.source
        }
    }

    pub fn valid_at(&self, turn: u64) -> bool {
        self.valid.map_or(true, |range| range.contains(turn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_range() {
        let range = TurnRange::between(3, 5);
        assert!(!range.contains(2));
        assert!(range.contains(3));
        assert!(range.contains(5));
        assert!(!range.contains(6));
        assert!(TurnRange::since(3).contains(1_000));
    }

    #[test]
    fn test_relation_validity() {
        let a = EntityId::new();
        let b = EntityId::new();
        let always = MemoryRelation::new(a, b, "ally_of");
        assert!(always.valid_at(0));

        let once = MemoryRelation::new(a, b, "ally_of").with_validity(TurnRange::between(1, 2));
        assert!(once.valid_at(2));
        assert!(!once.valid_at(3));
        assert!(once.same_edge(&always));
        assert_eq!(once.other(a), b);
        assert_eq!(once.other(b), a);
    }
}
