//! Checking generated narrative against the rules and world memory.
//!
//! Structural checks (forbidden phrases, references to entities that can no
//! longer appear) always run and never suspend. The semantic check asks a
//! judge model and is optional.

use crate::config::ConsistencyConfig;
use crate::memory::MemoryEntity;
use crate::provider::{GenerateOptions, ProviderManager};
use crate::rules::Constraint;
use crate::text::{extract_json, find_word};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Issue severity, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// How much one issue of this severity takes off the score.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Critical => 1.0,
            Severity::High => 0.5,
            Severity::Medium => 0.25,
            Severity::Low => 0.1,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The narrative uses a phrase a constraint forbids.
    ForbiddenPhrase,
    /// The narrative contradicts something world memory records.
    MemoryContradiction,
    /// Reported by the judge model.
    Semantic,
    /// The semantic check could not run.
    CheckUnavailable,
}

/// Byte range into the checked narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(default)]
    pub location: Option<TextSpan>,
    pub message: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

/// Everything a check found, with an overall score in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub issues: Vec<Issue>,
    pub score: f64,
}

impl ConsistencyReport {
    pub fn new(issues: Vec<Issue>) -> Self {
        let penalty: f64 = issues.iter().map(|i| i.severity.weight()).sum();
        Self {
            score: (1.0 - penalty).clamp(0.0, 1.0),
            issues,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// The most severe issue, if any.
    pub fn worst(&self) -> Option<&Issue> {
        self.issues.iter().max_by_key(|i| i.severity)
    }
}

/// `status` values that mean an entity can no longer act in the story.
const GONE_STATUSES: &[&str] = &["dead", "deceased", "destroyed", "departed"];

const JUDGE_SYSTEM_PROMPT: &str = "You are a continuity checker for an interactive story. \
You never write story text. You compare a passage against the rules and established \
facts you are given and report contradictions as JSON.";

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    #[serde(default)]
    issues: Vec<JudgeIssue>,
}

#[derive(Debug, Deserialize)]
struct JudgeIssue {
    #[serde(default)]
    severity: String,
    message: String,
    #[serde(default)]
    suggested_fix: Option<String>,
}

pub struct ConsistencyChecker {
    semantic: bool,
    timeout: Duration,
    judge: Option<Arc<ProviderManager>>,
}

impl ConsistencyChecker {
    /// `judge` is only consulted when semantic checks are enabled.
    pub fn new(config: &ConsistencyConfig, judge: Option<Arc<ProviderManager>>) -> Self {
        Self {
            semantic: config.semantic,
            timeout: config.semantic_timeout(),
            judge,
        }
    }

    pub async fn check(
        &self,
        response: &str,
        constraints: &[Constraint],
        memories: &[MemoryEntity],
    ) -> ConsistencyReport {
        let mut issues = forbidden_phrases(response, constraints);
        issues.extend(gone_entities(response, memories));

        if self.semantic {
            issues.extend(self.semantic_issues(response, constraints, memories).await);
        }

        debug!(issues = issues.len(), "Consistency check finished");
        ConsistencyReport::new(issues)
    }

    async fn semantic_issues(
        &self,
        response: &str,
        constraints: &[Constraint],
        memories: &[MemoryEntity],
    ) -> Vec<Issue> {
        let Some(judge) = &self.judge else {
            return vec![unavailable("no judge provider configured")];
        };

        let prompt = judge_prompt(response, constraints, memories);
        let options = GenerateOptions::default()
            .with_system(JUDGE_SYSTEM_PROMPT)
            .with_temperature(0.0)
            .with_max_tokens(800)
            .with_timeout(self.timeout);

        let reply = match tokio::time::timeout(self.timeout, judge.generate(&prompt, &options)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(error = %e, "Semantic consistency check failed");
                return vec![unavailable(&e.to_string())];
            }
            Err(_) => {
                warn!("Semantic consistency check timed out");
                return vec![unavailable("judge timed out")];
            }
        };

        match serde_json::from_str::<JudgeVerdict>(extract_json(&reply.content)) {
            Ok(verdict) => verdict
                .issues
                .into_iter()
                .map(|issue| Issue {
                    kind: IssueKind::Semantic,
                    severity: Severity::parse(&issue.severity).unwrap_or(Severity::Medium),
                    location: None,
                    message: issue.message,
                    suggested_fix: issue.suggested_fix,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Judge reply was not valid JSON");
                vec![unavailable(&format!("unreadable judge reply: {e}"))]
            }
        }
    }
}

fn forbidden_phrases(response: &str, constraints: &[Constraint]) -> Vec<Issue> {
    constraints
        .iter()
        .filter_map(|constraint| {
            let start = find_word(response, &constraint.phrase)?;
            let phrase = constraint.phrase.trim();
            Some(Issue {
                kind: IssueKind::ForbiddenPhrase,
                severity: constraint.severity,
                location: Some(TextSpan {
                    start,
                    end: start + phrase.len(),
                }),
                message: format!("narrative uses forbidden phrase '{phrase}'"),
                suggested_fix: Some(format!("rewrite the passage without '{phrase}'")),
            })
        })
        .collect()
}

fn gone_entities(response: &str, memories: &[MemoryEntity]) -> Vec<Issue> {
    memories
        .iter()
        .filter_map(|entity| {
            let status = entity.attr_str("status")?.trim().to_ascii_lowercase();
            if !GONE_STATUSES.contains(&status.as_str()) {
                return None;
            }
            let start = find_word(response, &entity.name)?;
            let name = entity.name.trim();
            Some(Issue {
                kind: IssueKind::MemoryContradiction,
                severity: Severity::Medium,
                location: Some(TextSpan {
                    start,
                    end: start + name.len(),
                }),
                message: format!("{name} is {status} but appears in the narrative"),
                suggested_fix: Some(format!(
                    "only mention {name} in memories or in the past tense"
                )),
            })
        })
        .collect()
}

fn unavailable(reason: &str) -> Issue {
    Issue {
        kind: IssueKind::CheckUnavailable,
        severity: Severity::Low,
        location: None,
        message: format!("semantic check unavailable: {reason}"),
        suggested_fix: None,
    }
}

fn judge_prompt(response: &str, constraints: &[Constraint], memories: &[MemoryEntity]) -> String {
    let rules = if constraints.is_empty() {
        "(none)".to_string()
    } else {
        constraints
            .iter()
            .map(|c| format!("- [{}] never: {}", c.severity, c.phrase))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let facts = if memories.is_empty() {
        "(none)".to_string()
    } else {
        memories
            .iter()
            .map(|m| m.render())
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"## Rules
{rules}

## Established Facts
{facts}

## Passage
{response}

## Instructions
List every place the passage contradicts the rules or the established facts.

Respond with ONLY a JSON object (no markdown, no explanation outside the JSON):
{{
  "issues": [
    {{"severity": "critical|high|medium|low", "message": "what is wrong", "suggested_fix": "how to fix it"}}
  ]
}}

If nothing is wrong, return an empty array."#
    )
}
