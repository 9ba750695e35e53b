//! Error taxonomy shared by every component.
//!
//! Each component has its own `thiserror` enum; all of them map onto an
//! [`ErrorKind`] so a failed turn can report one stable category.

use crate::turn::PipelineState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error category recorded on failed turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    RetryableProvider,
    NonRetryableProvider,
    BudgetExceeded,
    ConsistencyViolation,
    AllProvidersExhausted,
    SessionBusy,
    SessionInactive,
    Cancelled,
    Memory,
    Persistence,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::RetryableProvider => "retryable_provider",
            ErrorKind::NonRetryableProvider => "non_retryable_provider",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::ConsistencyViolation => "consistency_violation",
            ErrorKind::AllProvidersExhausted => "all_providers_exhausted",
            ErrorKind::SessionBusy => "session_busy",
            ErrorKind::SessionInactive => "session_inactive",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Memory => "memory",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failed or cancelled turn records: the category, the pipeline
/// state that was executing, and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} during {state}: {reason}")]
pub struct TurnError {
    pub kind: ErrorKind,
    pub state: PipelineState,
    pub reason: String,
}

impl TurnError {
    pub fn new(kind: ErrorKind, state: PipelineState, reason: impl Into<String>) -> Self {
        Self {
            kind,
            state,
            reason: reason.into(),
        }
    }

    pub fn cancelled(state: PipelineState) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            state,
            format!("cancelled before {state}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_error_display() {
        let err = TurnError::new(
            ErrorKind::BudgetExceeded,
            PipelineState::Assembling,
            "rules too long",
        );
        assert_eq!(
            err.to_string(),
            "budget_exceeded during assembling: rules too long"
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AllProvidersExhausted).unwrap();
        assert_eq!(json, "\"all_providers_exhausted\"");
    }
}
