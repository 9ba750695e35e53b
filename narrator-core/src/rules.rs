//! Rule text and the constraints declared with it.

use crate::consistency::Severity;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Already-parsed rule text plus its constraint strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub text: String,
    pub constraints: Vec<String>,
}

impl RuleSet {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Parse every constraint string, skipping blank ones.
    pub fn parsed_constraints(&self) -> Vec<Constraint> {
        self.constraints
            .iter()
            .filter_map(|c| Constraint::parse(c))
            .collect()
    }
}

/// A forbidden phrase with the severity of using it.
///
/// Constraint strings look like `[critical] forbid: resurrection`. The
/// severity tag is optional (default high) and so is the `forbid:` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub phrase: String,
    pub severity: Severity,
    /// The constraint as written, for messages.
    pub source: String,
}

impl Constraint {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut rest = raw.trim();
        let mut severity = Severity::High;

        if let Some(tagged) = rest.strip_prefix('[') {
            if let Some((tag, after)) = tagged.split_once(']') {
                if let Some(parsed) = Severity::parse(tag) {
                    severity = parsed;
                    rest = after.trim_start();
                }
            }
        }

        for prefix in ["forbid:", "forbidden:"] {
            if rest
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            {
                rest = rest[prefix.len()..].trim_start();
                break;
            }
        }

        let phrase = rest.trim();
        if phrase.is_empty() {
            return None;
        }

        Some(Self {
            phrase: phrase.to_string(),
            severity,
            source: raw.trim().to_string(),
        })
    }
}

/// Rule sets keyed by the `rules_ref` sessions point at.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<RuleSet>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the rules for `rules_ref`. Sessions already
    /// running a turn keep the snapshot they started with.
    pub fn insert(&self, rules_ref: impl Into<String>, rules: RuleSet) {
        self.rules.write().insert(rules_ref.into(), Arc::new(rules));
    }

    pub fn get(&self, rules_ref: &str) -> Option<Arc<RuleSet>> {
        self.rules.read().get(rules_ref).cloned()
    }

    pub fn contains(&self, rules_ref: &str) -> bool {
        self.rules.read().contains_key(rules_ref)
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_phrase() {
        let c = Constraint::parse("time travel").unwrap();
        assert_eq!(c.phrase, "time travel");
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn test_parse_tagged_and_prefixed() {
        let c = Constraint::parse("[critical] Forbid: resurrection").unwrap();
        assert_eq!(c.phrase, "resurrection");
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.source, "[critical] Forbid: resurrection");

        let c = Constraint::parse("[low]forbidden: swearing").unwrap();
        assert_eq!(c.phrase, "swearing");
        assert_eq!(c.severity, Severity::Low);
    }

    #[test]
    fn test_unknown_tag_is_part_of_phrase() {
        let c = Constraint::parse("[ooc] chatter").unwrap();
        assert_eq!(c.phrase, "[ooc] chatter");
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn test_blank_constraint_is_skipped() {
        assert!(Constraint::parse("   ").is_none());
        assert!(Constraint::parse("[medium] forbid:").is_none());

        let rules = RuleSet::new("text")
            .with_constraint("")
            .with_constraint("magic");
        assert_eq!(rules.parsed_constraints().len(), 1);
    }

    #[test]
    fn test_registry_snapshot() {
        let registry = RuleRegistry::new();
        registry.insert("canon", RuleSet::new("v1"));
        let snapshot = registry.get("canon").unwrap();

        registry.insert("canon", RuleSet::new("v2"));
        assert_eq!(snapshot.text, "v1");
        assert_eq!(registry.get("canon").unwrap().text, "v2");
        assert!(!registry.contains("other"));
    }
}
