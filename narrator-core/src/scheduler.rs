//! Turn scheduling.
//!
//! Every session has a FIFO queue drained by at most one driver task, so a
//! session never runs two turns at once. Drivers share a global semaphore
//! that bounds how many turns run across all sessions.
//!
//! Finished turns stay in memory for a bounded window; lookups of older
//! turns go to the [`SessionStore`].

use crate::config::{BusyPolicy, SchedulerConfig};
use crate::error::{ErrorKind, TurnError};
use crate::id::{SessionId, TurnId};
use crate::metrics::MetricsSink;
use crate::persist::{PersistError, SessionStore};
use crate::pipeline::{ReasoningPipeline, TurnContext, TurnFailure, TurnOutcome};
use crate::rules::{RuleRegistry, RuleSet};
use crate::session::{Session, SessionStatus};
use crate::turn::{GenerationRecord, PipelineState, StateTrace, Turn, TurnRequest, TurnStatus};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("session {0} already has a running turn")]
    SessionBusy(SessionId),

    #[error("session {session} is {status} and does not accept turns")]
    SessionInactive {
        session: SessionId,
        status: SessionStatus,
    },

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("unknown turn {0}")]
    UnknownTurn(TurnId),

    #[error("no rules registered under '{0}'")]
    MissingRules(String),

    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::SessionBusy(_) => ErrorKind::SessionBusy,
            SchedulerError::SessionInactive { .. } => ErrorKind::SessionInactive,
            SchedulerError::UnknownSession(_)
            | SchedulerError::UnknownTurn(_)
            | SchedulerError::MissingRules(_) => ErrorKind::Configuration,
            SchedulerError::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

/// Accepts turns and runs them through the pipeline.
#[derive(Clone)]
pub struct TurnScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    permits: Arc<Semaphore>,
    busy_policy: BusyPolicy,
    retained_turns: usize,
    pipeline: Arc<ReasoningPipeline>,
    store: Arc<dyn SessionStore>,
    rules: Arc<RuleRegistry>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    sessions: HashMap<SessionId, SessionSlot>,
    turns: HashMap<TurnId, Arc<TurnRecord>>,
    /// Terminal turns still in `turns`, oldest first.
    finished: VecDeque<TurnId>,
}

struct SessionSlot {
    session: Session,
    queue: VecDeque<TurnId>,
    running: Option<TurnId>,
    driver_active: bool,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session,
            queue: VecDeque::new(),
            running: None,
            driver_active: false,
        }
    }
}

struct TurnRecord {
    turn: RwLock<Turn>,
    cancel: CancellationToken,
    trace: StateTrace,
    rules: Arc<RuleSet>,
    status: watch::Sender<TurnStatus>,
}

impl TurnRecord {
    fn snapshot(&self) -> Turn {
        self.turn.read().clone()
    }
}

impl TurnScheduler {
    pub fn new(
        config: &SchedulerConfig,
        pipeline: Arc<ReasoningPipeline>,
        store: Arc<dyn SessionStore>,
        rules: Arc<RuleRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(config.max_concurrent_turns)),
                busy_policy: config.busy_policy,
                retained_turns: config.retained_turns,
                pipeline,
                store,
                rules,
                metrics,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Make a session known to the scheduler without touching the store.
    pub fn register_session(&self, session: Session) {
        self.inner
            .state
            .lock()
            .sessions
            .entry(session.id)
            .or_insert_with(|| SessionSlot::new(session));
    }

    /// Current state of a session the scheduler knows about.
    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner
            .state
            .lock()
            .sessions
            .get(&id)
            .map(|slot| slot.session.clone())
    }

    /// Change a session's status and persist it. Turns already queued still
    /// run; new submissions need an active session.
    pub async fn set_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
    ) -> Result<Session, SchedulerError> {
        self.ensure_session(id).await?;
        let session = {
            let mut state = self.inner.state.lock();
            let slot = state
                .sessions
                .get_mut(&id)
                .ok_or(SchedulerError::UnknownSession(id))?;
            slot.session.status = status;
            slot.session.touch();
            slot.session.clone()
        };
        self.inner.store.save_session(&session).await?;
        info!(session = %id, %status, "Session status changed");
        Ok(session)
    }

    /// Queue a turn and return its id. The turn gets its sequence number
    /// when it leaves the queue, so cancelled queued turns leave no gap.
    ///
    /// Fails with [`SchedulerError::SessionBusy`] when the session is
    /// running a turn and the busy policy is `reject`. A session that is
    /// idle but waiting for a worker still accepts the turn.
    pub async fn submit(&self, request: TurnRequest) -> Result<TurnId, SchedulerError> {
        let session_id = request.session_id;
        self.ensure_session(session_id).await?;

        let (id, spawn_driver) = {
            let mut state = self.inner.state.lock();
            let slot = state
                .sessions
                .get_mut(&session_id)
                .ok_or(SchedulerError::UnknownSession(session_id))?;

            if !slot.session.accepts_turns() {
                return Err(SchedulerError::SessionInactive {
                    session: session_id,
                    status: slot.session.status,
                });
            }
            if slot.running.is_some() && self.inner.busy_policy == BusyPolicy::Reject {
                return Err(SchedulerError::SessionBusy(session_id));
            }
            let rules = self
                .inner
                .rules
                .get(&slot.session.rules_ref)
                .ok_or_else(|| SchedulerError::MissingRules(slot.session.rules_ref.clone()))?;

            let turn = Turn::pending(request);
            let id = turn.id;
            slot.queue.push_back(id);
            let spawn_driver = !slot.driver_active;
            slot.driver_active = true;

            let (status, _) = watch::channel(TurnStatus::Pending);
            state.turns.insert(
                id,
                Arc::new(TurnRecord {
                    turn: RwLock::new(turn),
                    cancel: CancellationToken::new(),
                    trace: StateTrace::new(),
                    rules,
                    status,
                }),
            );
            (id, spawn_driver)
        };

        info!(session = %session_id, turn = %id, "Turn submitted");
        if spawn_driver {
            tokio::spawn(drive(self.inner.clone(), session_id));
        }
        Ok(id)
    }

    pub async fn status(&self, id: TurnId) -> Option<TurnStatus> {
        if let Some(record) = self.record(id) {
            return Some(record.turn.read().status);
        }
        self.stored_turn(id).await.map(|turn| turn.status)
    }

    /// Snapshot of a turn.
    pub async fn turn(&self, id: TurnId) -> Option<Turn> {
        if let Some(record) = self.record(id) {
            return Some(record.snapshot());
        }
        self.stored_turn(id).await
    }

    /// Number of turns held in memory, queued, running and recently finished.
    pub fn tracked_turns(&self) -> usize {
        self.inner.state.lock().turns.len()
    }

    /// Wait until a turn is terminal and return it.
    pub async fn wait(&self, id: TurnId) -> Result<Turn, SchedulerError> {
        let Some(record) = self.record(id) else {
            return self
                .stored_turn(id)
                .await
                .ok_or(SchedulerError::UnknownTurn(id));
        };
        let mut status = record.status.subscribe();
        // The sender lives as long as the record, so this only fails if the
        // record is gone, and then the snapshot is the best answer anyway.
        let _ = status.wait_for(|s| s.is_terminal()).await;
        Ok(record.snapshot())
    }

    /// Cancel a turn.
    ///
    /// A queued turn is removed and marked cancelled. A running turn is
    /// asked to stop at its next state boundary. Returns false for unknown
    /// turns and turns that already finished.
    pub async fn cancel(&self, id: TurnId) -> bool {
        let dequeued = {
            let mut state = self.inner.state.lock();
            let Some(record) = state.turns.get(&id).cloned() else {
                return false;
            };
            let (status, session_id) = {
                let turn = record.turn.read();
                (turn.status, turn.session_id)
            };

            match status {
                TurnStatus::Pending => {
                    if let Some(slot) = state.sessions.get_mut(&session_id) {
                        slot.queue.retain(|queued| *queued != id);
                    }
                    record.trace.enter(PipelineState::Cancelled);
                    let mut turn = record.turn.write();
                    turn.status = TurnStatus::Cancelled;
                    turn.error = Some(TurnError::new(
                        ErrorKind::Cancelled,
                        PipelineState::Assembling,
                        "cancelled while queued",
                    ));
                    turn.states = record.trace.snapshot();
                    turn.finished_at = Some(Utc::now());
                    drop(turn);
                    let session = state.sessions.get(&session_id).map(|s| s.session.clone());
                    Some((record, session))
                }
                TurnStatus::Running => {
                    record.cancel.cancel();
                    debug!(turn = %id, "Cancellation requested for running turn");
                    return true;
                }
                TurnStatus::Succeeded | TurnStatus::Failed | TurnStatus::Cancelled => {
                    return false;
                }
            }
        };

        if let Some((record, session)) = dequeued {
            info!(turn = %id, "Queued turn cancelled");
            let turn = record.snapshot();
            self.inner
                .metrics
                .turn_finished(turn.session_id, turn.status, std::time::Duration::ZERO);
            persist(&self.inner, &turn, session).await;
            retire(&self.inner, id);
            record.status.send_replace(TurnStatus::Cancelled);
        }
        true
    }

    fn record(&self, id: TurnId) -> Option<Arc<TurnRecord>> {
        self.inner.state.lock().turns.get(&id).cloned()
    }

    /// Find a turn that has left memory in the turn logs of known sessions.
    async fn stored_turn(&self, id: TurnId) -> Option<Turn> {
        let sessions: Vec<SessionId> = self.inner.state.lock().sessions.keys().copied().collect();
        for session in sessions {
            match self.inner.store.load_turns(session).await {
                Ok(turns) => {
                    if let Some(turn) = turns.into_iter().find(|t| t.id == id) {
                        return Some(turn);
                    }
                }
                Err(e) => {
                    warn!(session = %session, turn = %id, error = %e, "Failed to read turn log");
                }
            }
        }
        None
    }

    /// Load a session from the store if the scheduler does not know it yet.
    async fn ensure_session(&self, id: SessionId) -> Result<(), SchedulerError> {
        if self.inner.state.lock().sessions.contains_key(&id) {
            return Ok(());
        }
        let session = self
            .inner
            .store
            .load_session(id)
            .await?
            .ok_or(SchedulerError::UnknownSession(id))?;
        self.register_session(session);
        Ok(())
    }
}

/// Drain one session's queue, one turn at a time.
async fn drive(inner: Arc<Inner>, session_id: SessionId) {
    loop {
        // Waiting here is what "queued behind the global pool" means.
        let permit = match inner.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(session = %session_id, "Worker pool closed");
                if let Some(slot) = inner.state.lock().sessions.get_mut(&session_id) {
                    slot.driver_active = false;
                }
                return;
            }
        };

        let next = {
            let mut state = inner.state.lock();
            let SchedulerState { sessions, turns, .. } = &mut *state;
            let Some(slot) = sessions.get_mut(&session_id) else {
                return;
            };
            match slot.queue.pop_front().and_then(|id| turns.get(&id).cloned()) {
                Some(record) => {
                    let mut turn = record.turn.write();
                    turn.sequence = slot.session.next_sequence();
                    turn.status = TurnStatus::Running;
                    turn.started_at = Some(Utc::now());
                    slot.running = Some(turn.id);
                    drop(turn);
                    record
                }
                None => {
                    slot.driver_active = false;
                    return;
                }
            }
        };

        next.status.send_replace(TurnStatus::Running);
        run_turn(&inner, session_id, next, permit).await;
    }
}

async fn run_turn(
    inner: &Arc<Inner>,
    session_id: SessionId,
    record: Arc<TurnRecord>,
    permit: OwnedSemaphorePermit,
) {
    let ctx = {
        let turn = record.turn.read();
        TurnContext {
            session_id,
            turn_id: turn.id,
            sequence: turn.sequence,
            rules: record.rules.clone(),
            player_input: turn.player_input.clone(),
            interventions: turn.interventions.clone(),
            cancel: record.cancel.clone(),
        }
    };
    info!(session = %session_id, turn = %ctx.turn_id, sequence = ctx.sequence, "Turn started");

    let pipeline = inner.pipeline.clone();
    let trace = record.trace.clone();
    let handle = tokio::spawn(async move { pipeline.process(&ctx, &trace).await });
    let result = handle.await;
    drop(permit);

    let session = {
        let mut state = inner.state.lock();
        let mut turn = record.turn.write();
        finish(&mut turn, &record.trace, result);
        let session = state.sessions.get_mut(&session_id).map(|slot| {
            slot.running = None;
            slot.session.touch();
            slot.session.clone()
        });
        drop(turn);
        session
    };

    let turn = record.snapshot();
    match &turn.error {
        Some(error) => info!(
            session = %session_id,
            turn = %turn.id,
            status = %turn.status,
            kind = %error.kind,
            state = %error.state,
            reason = %error.reason,
            "Turn finished"
        ),
        None => info!(session = %session_id, turn = %turn.id, status = %turn.status, "Turn finished"),
    }

    inner.metrics.turn_finished(
        session_id,
        turn.status,
        turn.latency().unwrap_or_default(),
    );
    // Waiters see the turn only once it is on record.
    persist(inner, &turn, session).await;
    retire(inner, turn.id);
    record.status.send_replace(turn.status);
}

/// Move a persisted terminal turn into the retention window, dropping the
/// oldest records beyond it. Waiters holding a record keep it alive.
fn retire(inner: &Inner, id: TurnId) {
    let mut state = inner.state.lock();
    state.finished.push_back(id);
    while state.finished.len() > inner.retained_turns {
        let Some(oldest) = state.finished.pop_front() else {
            break;
        };
        state.turns.remove(&oldest);
        debug!(turn = %oldest, "Turn record released");
    }
}

/// Write a pipeline result into its turn.
fn finish(
    turn: &mut Turn,
    trace: &StateTrace,
    result: Result<Result<TurnOutcome, TurnFailure>, JoinError>,
) {
    match result {
        Ok(Ok(outcome)) => {
            turn.status = TurnStatus::Succeeded;
            turn.narrative = Some(outcome.narrative);
            turn.generation = Some(GenerationRecord::from(&outcome.response));
            turn.consistency = Some(outcome.report);
            turn.memory_update_error = outcome.memory_update_error;
        }
        Ok(Err(failure)) => {
            turn.status = if failure.error.kind == ErrorKind::Cancelled {
                TurnStatus::Cancelled
            } else {
                TurnStatus::Failed
            };
            turn.generation = failure.response.as_ref().map(GenerationRecord::from);
            turn.consistency = failure.report;
            turn.error = Some(failure.error);
        }
        Err(join_error) => {
            let state = trace.last_working();
            trace.enter(PipelineState::Errored);
            turn.status = TurnStatus::Failed;
            turn.error = Some(TurnError::new(
                ErrorKind::Internal,
                state,
                panic_reason(join_error),
            ));
        }
    }
    turn.states = trace.snapshot();
    turn.finished_at = Some(Utc::now());
}

fn panic_reason(error: JoinError) -> String {
    if !error.is_panic() {
        return "turn worker was aborted".to_string();
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("turn worker panicked: {message}")
}

/// Record a terminal turn and the session counter. Failures are logged only.
async fn persist(inner: &Inner, turn: &Turn, session: Option<Session>) {
    if let Err(e) = inner.store.append_turn(turn).await {
        warn!(session = %turn.session_id, turn = %turn.id, error = %e, "Failed to persist turn");
    }
    if let Some(session) = session {
        if let Err(e) = inner.store.save_session(&session).await {
            warn!(session = %session.id, error = %e, "Failed to persist session");
        }
    }
}
