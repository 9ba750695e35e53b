//! Turns: one player input in, one narrative out.

use crate::consistency::ConsistencyReport;
use crate::error::TurnError;
use crate::id::{SessionId, TurnId};
use crate::intervention::Intervention;
use crate::provider::{LlmResponse, ProviderMetadata, TokenUsage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a turn. `Succeeded`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Succeeded | TurnStatus::Failed | TurnStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Running => "running",
            TurnStatus::Succeeded => "succeeded",
            TurnStatus::Failed => "failed",
            TurnStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the reasoning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Assembling,
    Generating,
    Checking,
    Updating,
    Done,
    Errored,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Assembling => "assembling",
            PipelineState::Generating => "generating",
            PipelineState::Checking => "checking",
            PipelineState::Updating => "updating",
            PipelineState::Done => "done",
            PipelineState::Errored => "errored",
            PipelineState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Errored | PipelineState::Cancelled
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared record of the pipeline states a turn has visited.
///
/// The scheduler keeps one clone and hands the other to the pipeline, so the
/// state a turn was in survives even if the pipeline task panics.
#[derive(Debug, Clone, Default)]
pub struct StateTrace(Arc<Mutex<Vec<PipelineState>>>);

impl StateTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, state: PipelineState) {
        self.0.lock().push(state);
    }

    /// Most recent state, if any was entered.
    pub fn current(&self) -> Option<PipelineState> {
        self.0.lock().last().copied()
    }

    /// The last non-terminal state: where the turn was when it stopped.
    pub fn last_working(&self) -> PipelineState {
        self.0
            .lock()
            .iter()
            .rev()
            .find(|s| !s.is_terminal())
            .copied()
            .unwrap_or(PipelineState::Assembling)
    }

    pub fn snapshot(&self) -> Vec<PipelineState> {
        self.0.lock().clone()
    }
}

/// A request to run one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub player_input: String,
    pub interventions: Vec<Intervention>,
}

impl TurnRequest {
    pub fn new(session_id: SessionId, player_input: impl Into<String>) -> Self {
        Self {
            session_id,
            player_input: player_input.into(),
            interventions: Vec::new(),
        }
    }

    pub fn with_intervention(mut self, intervention: Intervention) -> Self {
        self.interventions.push(intervention);
        self
    }

    pub fn with_interventions(mut self, interventions: Vec<Intervention>) -> Self {
        self.interventions.extend(interventions);
        self
    }
}

/// Usage and cost metadata of the generation that produced a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
    pub metadata: ProviderMetadata,
}

impl From<&LlmResponse> for GenerationRecord {
    fn from(response: &LlmResponse) -> Self {
        Self {
            model: response.model.clone(),
            usage: response.usage,
            cost: response.cost,
            metadata: response.metadata.clone(),
        }
    }
}

/// One player input → narrative output cycle within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub session_id: SessionId,
    /// Monotonic per session, assigned when the turn leaves the queue.
    /// Zero for a turn cancelled before it ran.
    pub sequence: u64,
    pub player_input: String,
    pub interventions: Vec<Intervention>,
    pub status: TurnStatus,
    pub narrative: Option<String>,
    pub generation: Option<GenerationRecord>,
    pub consistency: Option<ConsistencyReport>,
    pub error: Option<TurnError>,
    #[serde(default)]
    pub states: Vec<PipelineState>,
    /// Set when the turn succeeded but its memory updates did not apply.
    #[serde(default)]
    pub memory_update_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Turn {
    /// A pending turn built from a request. It has no sequence number yet.
    pub fn pending(request: TurnRequest) -> Self {
        Self {
            id: TurnId::new(),
            session_id: request.session_id,
            sequence: 0,
            player_input: request.player_input,
            interventions: request.interventions,
            status: TurnStatus::Pending,
            narrative: None,
            generation: None,
            consistency: None,
            error: None,
            states: Vec::new(),
            memory_update_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock run time, once the turn has started and finished.
    pub fn latency(&self) -> Option<std::time::Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }
}
