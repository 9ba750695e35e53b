//! Out-of-narrative instructions submitted alongside player input.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of instruction an intervention carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// Out-of-character remark to the narrator.
    Ooc,
    Edit,
    Retcon,
    Tone,
    Intent,
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterventionKind::Ooc => "ooc",
            InterventionKind::Edit => "edit",
            InterventionKind::Retcon => "retcon",
            InterventionKind::Tone => "tone",
            InterventionKind::Intent => "intent",
        };
        f.write_str(s)
    }
}

/// Priority levels, ordered `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Dropped first when the prompt is tight
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A structured intervention. Read-only input to a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub kind: InterventionKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Intervention {
    pub fn new(kind: InterventionKind, priority: Priority, payload: serde_json::Value) -> Self {
        Self {
            kind,
            priority,
            payload,
        }
    }

    /// Shorthand for an intervention whose payload is `{"text": ...}`.
    pub fn text(kind: InterventionKind, priority: Priority, text: impl Into<String>) -> Self {
        Self::new(kind, priority, serde_json::json!({ "text": text.into() }))
    }

    /// Directive line as shown to the narrator.
    pub fn render(&self) -> String {
        let body = match self.payload.get("text").and_then(|t| t.as_str()) {
            Some(text) => text.to_string(),
            None => match &self.payload {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        format!("- [{}/{}] {}", self.priority, self.kind, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_render_text_payload() {
        let i = Intervention::text(InterventionKind::Tone, Priority::High, "Keep it grim");
        assert_eq!(i.render(), "- [high/tone] Keep it grim");
    }

    #[test]
    fn test_render_structured_payload() {
        let i = Intervention::new(
            InterventionKind::Retcon,
            Priority::Critical,
            json!({"entity": "Mira", "status": "alive"}),
        );
        assert_eq!(
            i.render(),
            r#"- [critical/retcon] {"entity":"Mira","status":"alive"}"#
        );
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let i: Intervention = serde_json::from_str(r#"{"kind": "ooc"}"#).unwrap();
        assert_eq!(i.priority, Priority::Medium);
        assert!(i.payload.is_null());
    }
}
