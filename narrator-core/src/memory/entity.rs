//! Entities tracked in world memory.

use crate::id::{EntityId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Types of entities that can be tracked in world memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Location,
    Fact,
    Plotline,
    /// Narrative style the story has settled into.
    Style,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Location => "location",
            EntityKind::Fact => "fact",
            EntityKind::Plotline => "plotline",
            EntityKind::Style => "style",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "character" | "npc" => Some(EntityKind::Character),
            "location" | "place" => Some(EntityKind::Location),
            "fact" => Some(EntityKind::Fact),
            "plotline" | "plot" => Some(EntityKind::Plotline),
            "style" => Some(EntityKind::Style),
            _ => None,
        }
    }

    /// Heading used when summarizing entities of this kind.
    pub fn heading(&self) -> &'static str {
        match self {
            EntityKind::Character => "Characters",
            EntityKind::Location => "Locations",
            EntityKind::Fact => "Facts",
            EntityKind::Plotline => "Plotlines",
            EntityKind::Style => "Style",
        }
    }

    pub const ALL: [EntityKind; 5] = [
        EntityKind::Character,
        EntityKind::Location,
        EntityKind::Fact,
        EntityKind::Plotline,
        EntityKind::Style,
    ];
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured fact about the story world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntity {
    pub id: EntityId,
    pub session_id: SessionId,
    pub kind: EntityKind,
    pub name: String,
    /// Free-form attributes, kept sorted so rendering is deterministic.
    #[serde(default)]
    pub content: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// 0.0 to 1.0; higher is retrieved first when nothing else ranks.
    pub importance: f32,
    /// Incremented on every store.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntity {
    /// A new entity with a name-derived id, so storing the same
    /// session/kind/name again updates instead of duplicating.
    pub fn new(session_id: SessionId, kind: EntityKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: EntityId::derive(session_id, kind, &name),
            session_id,
            kind,
            name,
            content: BTreeMap::new(),
            embedding: None,
            importance: 0.5,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.content.insert(key.into(), value.into());
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// String value of an attribute, if it is a string.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(|v| v.as_str())
    }

    /// Lowercased name and attribute text, for substring search.
    pub(crate) fn haystack(&self) -> String {
        let mut text = self.name.to_lowercase();
        for (key, value) in &self.content {
            text.push(' ');
            text.push_str(&key.to_lowercase());
            text.push(' ');
            match value {
                serde_json::Value::String(s) => text.push_str(&s.to_lowercase()),
                other => text.push_str(&other.to_string().to_lowercase()),
            }
        }
        text
    }

    /// One-line rendering used in prompts: `- [kind] Name: k=v; k=v`.
    pub fn render(&self) -> String {
        let mut line = format!("- [{}] {}", self.kind, self.name);
        if !self.content.is_empty() {
            let attrs: Vec<String> = self
                .content
                .iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => format!("{k}={s}"),
                    other => format!("{k}={other}"),
                })
                .collect();
            line.push_str(": ");
            line.push_str(&attrs.join("; "));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(EntityKind::parse("Character"), Some(EntityKind::Character));
        assert_eq!(EntityKind::parse("npc"), Some(EntityKind::Character));
        assert_eq!(EntityKind::parse("weather"), None);
    }

    #[test]
    fn test_render() {
        let session = SessionId::new();
        let entity = MemoryEntity::new(session, EntityKind::Character, "Mira")
            .with_attr("status", "alive")
            .with_attr("age", 31);
        assert_eq!(entity.render(), "- [character] Mira: age=31; status=alive");

        let bare = MemoryEntity::new(session, EntityKind::Location, "The Gate");
        assert_eq!(bare.render(), "- [location] The Gate");
    }

    #[test]
    fn test_importance_is_clamped() {
        let entity =
            MemoryEntity::new(SessionId::new(), EntityKind::Fact, "x").with_importance(4.0);
        assert_eq!(entity.importance, 1.0);
    }

    #[test]
    fn test_same_name_same_id() {
        let session = SessionId::new();
        let a = MemoryEntity::new(session, EntityKind::Character, "Mira");
        let b = MemoryEntity::new(session, EntityKind::Character, "MIRA");
        assert_eq!(a.id, b.id);
    }
}
