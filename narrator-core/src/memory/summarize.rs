//! Turning a set of entities into prose or a digest.

use super::{EntityKind, MemoryEntity, MemoryError};
use crate::provider::{GenerateOptions, ProviderManager};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, entities: &[MemoryEntity]) -> Result<String, MemoryError>;
}

/// Deterministic digest grouped by kind, most important first.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSummarizer;

#[async_trait]
impl Summarizer for DigestSummarizer {
    async fn summarize(&self, entities: &[MemoryEntity]) -> Result<String, MemoryError> {
        Ok(digest(entities))
    }
}

pub(crate) fn digest(entities: &[MemoryEntity]) -> String {
    let mut summary = String::new();

    for kind in EntityKind::ALL {
        let mut group: Vec<&MemoryEntity> = entities.iter().filter(|e| e.kind == kind).collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| a.name.cmp(&b.name))
        });

        summary.push_str(&format!("### {}\n", kind.heading()));
        for entity in group {
            summary.push_str(&entity.render());
            summary.push('\n');
        }
        summary.push('\n');
    }

    summary.trim_end().to_string()
}

const SUMMARY_SYSTEM_PROMPT: &str = "You condense story-world notes into a short factual \
summary. Do not invent anything. Do not continue the story.";

/// Summarizes through the providers at temperature 0.
pub struct LlmSummarizer {
    providers: Arc<ProviderManager>,
    timeout: Duration,
}

impl LlmSummarizer {
    pub fn new(providers: Arc<ProviderManager>) -> Self {
        Self {
            providers,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, entities: &[MemoryEntity]) -> Result<String, MemoryError> {
        if entities.is_empty() {
            return Ok(String::new());
        }

        let prompt = format!(
            "Summarize these notes in one paragraph:\n\n{}",
            digest(entities)
        );
        let options = GenerateOptions::default()
            .with_system(SUMMARY_SYSTEM_PROMPT)
            .with_temperature(0.0)
            .with_max_tokens(400)
            .with_timeout(self.timeout);

        let response = self
            .providers
            .generate(&prompt, &options)
            .await
            .map_err(|e| MemoryError::Summarize(e.to_string()))?;
        Ok(response.content.trim().to_string())
    }
}
