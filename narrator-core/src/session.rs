//! Narrative sessions.

use crate::id::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a session. Only `Active` sessions accept new turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// A narrative session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Number of turns started so far; the next one to leave the queue gets
    /// `turn_counter + 1`.
    pub turn_counter: u64,
    pub status: SessionStatus,
    /// Key of the rule-text snapshot governing this session.
    pub rules_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new active session.
    pub fn new(rules_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            turn_counter: 0,
            status: SessionStatus::Active,
            rules_ref: rules_ref.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn accepts_turns(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Reserve the next sequence number.
    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.turn_counter += 1;
        self.updated_at = Utc::now();
        self.turn_counter
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
