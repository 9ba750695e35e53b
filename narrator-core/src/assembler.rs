//! Prompt assembly.
//!
//! Builds the user prompt for a turn from four sections, in this order:
//!
//! ```text
//! ## Rules
//! ## Directives (out of character)
//! ## World Memory
//! ## Player Input
//! ```
//!
//! Rules and player input are always present. Directives and memories are
//! included whole or not at all, and only as far as the budget allows.

use crate::error::ErrorKind;
use crate::intervention::Intervention;
use crate::memory::MemoryEntity;
use std::fmt;
use thiserror::Error;

const RULES_HEADER: &str = "## Rules";
const DIRECTIVES_HEADER: &str = "## Directives (out of character)";
const MEMORY_HEADER: &str = "## World Memory";
const INPUT_HEADER: &str = "## Player Input";
const SECTION_SEPARATOR: &str = "\n\n";

/// Size ceiling for an assembled prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Unicode scalar values.
    Chars(usize),
    /// Estimated with [`estimate_tokens`].
    Tokens(usize),
}

impl Budget {
    pub fn limit(&self) -> usize {
        match self {
            Budget::Chars(n) | Budget::Tokens(n) => *n,
        }
    }

    /// Size of `text` in this budget's unit.
    pub fn measure(&self, text: &str) -> usize {
        match self {
            Budget::Chars(_) => text.chars().count(),
            Budget::Tokens(_) => estimate_tokens(text),
        }
    }

    pub fn fits(&self, text: &str) -> bool {
        self.measure(text) <= self.limit()
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Budget::Chars(n) => write!(f, "{n} chars"),
            Budget::Tokens(n) => write!(f, "{n} tokens"),
        }
    }
}

/// Rough token count: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("rules and player input need {required} but the budget is {budget}")]
    BudgetExceeded { required: usize, budget: Budget },
}

impl AssembleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AssembleError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
        }
    }
}

/// Builds turn prompts. Pure: the same inputs always give the same prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptAssembler {
    max_memories: usize,
}

impl PromptAssembler {
    pub fn new(max_memories: usize) -> Self {
        Self { max_memories }
    }

    pub fn max_memories(&self) -> usize {
        self.max_memories
    }

    /// Assemble a prompt within `budget`.
    ///
    /// `memories` are in relevance order; at most `max_memories` are
    /// considered and the least relevant are dropped first. Interventions
    /// are rendered most urgent first, keeping caller order among equals,
    /// and are dropped lowest priority first, but only once every memory
    /// has been dropped.
    pub fn assemble(
        &self,
        rules_text: &str,
        memories: &[MemoryEntity],
        interventions: &[Intervention],
        player_input: &str,
        budget: Budget,
    ) -> Result<String, AssembleError> {
        let rules = section(RULES_HEADER, rules_text.trim());
        let input = section(INPUT_HEADER, player_input.trim());

        let required = render(&rules, &[], &[], &input);
        if !budget.fits(&required) {
            return Err(AssembleError::BudgetExceeded {
                required: budget.measure(&required),
                budget,
            });
        }

        let mut ordered: Vec<&Intervention> = interventions.iter().collect();
        // Stable, so equal priorities keep caller order.
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        let directive_lines: Vec<String> = ordered.iter().map(|i| i.render()).collect();
        let memory_lines: Vec<String> = memories
            .iter()
            .take(self.max_memories)
            .map(|m| m.render())
            .collect();

        let directives = longest_fitting_prefix(
            &directive_lines,
            |kept| render(&rules, kept, &[], &input),
            budget,
        );
        let kept_directives = &directive_lines[..directives];

        let memories = longest_fitting_prefix(
            &memory_lines,
            |kept| render(&rules, kept_directives, kept, &input),
            budget,
        );

        Ok(render(&rules, kept_directives, &memory_lines[..memories], &input))
    }
}

fn section(header: &str, body: &str) -> String {
    format!("{header}\n{body}")
}

fn render(rules: &str, directives: &[String], memories: &[String], input: &str) -> String {
    let mut sections = vec![rules.to_string()];
    if !directives.is_empty() {
        sections.push(section(DIRECTIVES_HEADER, &directives.join("\n")));
    }
    if !memories.is_empty() {
        sections.push(section(MEMORY_HEADER, &memories.join("\n")));
    }
    sections.push(input.to_string());
    sections.join(SECTION_SEPARATOR)
}

/// How many leading items fit when rendered with `build`.
fn longest_fitting_prefix(
    items: &[String],
    build: impl Fn(&[String]) -> String,
    budget: Budget,
) -> usize {
    let mut kept = 0;
    while kept < items.len() && budget.fits(&build(&items[..kept + 1])) {
        kept += 1;
    }
    kept
}
