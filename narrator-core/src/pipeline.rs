//! The reasoning pipeline: one turn from player input to narrative.
//!
//! ```text
//! assembling → generating → checking → updating → done
//!      └────────────┴────────────┴──────────┴──→ errored | cancelled
//! ```
//!
//! Cancellation is only observed when entering a state, so a turn that is
//! cancelled after checking never touches world memory.

use crate::assembler::{Budget, PromptAssembler};
use crate::config::{ConsistencyMode, EngineConfig};
use crate::consistency::{ConsistencyChecker, ConsistencyReport, Severity};
use crate::error::{ErrorKind, TurnError};
use crate::extract::{split_memory_block, MemoryDelta, ResolvedDelta, MEMORY_BLOCK_INSTRUCTIONS};
use crate::id::{SessionId, TurnId};
use crate::intervention::Intervention;
use crate::memory::{MemoryEntity, MemoryError, MemoryFilter, MemoryQuery, WorldMemory};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::provider::{GenerateOptions, LlmResponse, ProviderManager};
use crate::rules::RuleSet;
use crate::turn::{PipelineState, StateTrace};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the pipeline needs to run one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub sequence: u64,
    pub rules: Arc<RuleSet>,
    pub player_input: String,
    pub interventions: Vec<Intervention>,
    pub cancel: CancellationToken,
}

/// A turn that made it to `done`.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The reply with any memory block removed.
    pub narrative: String,
    pub response: LlmResponse,
    pub report: ConsistencyReport,
    /// Why memory updates were not applied, if they were not.
    pub memory_update_error: Option<String>,
}

/// A turn that ended in `errored` or `cancelled`, with whatever it had
/// produced by then.
#[derive(Debug, Clone)]
pub struct TurnFailure {
    pub error: TurnError,
    pub response: Option<LlmResponse>,
    pub report: Option<ConsistencyReport>,
}

impl TurnFailure {
    fn new(error: TurnError) -> Self {
        Self {
            error,
            response: None,
            report: None,
        }
    }

    fn with_response(mut self, response: LlmResponse) -> Self {
        self.response = Some(response);
        self
    }

    fn with_report(mut self, report: ConsistencyReport) -> Self {
        self.report = Some(report);
        self
    }
}

pub struct ReasoningPipeline {
    assembler: PromptAssembler,
    budget: Budget,
    providers: Arc<ProviderManager>,
    checker: ConsistencyChecker,
    memory: Arc<WorldMemory>,
    mode: ConsistencyMode,
    options: GenerateOptions,
    update_retries: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl ReasoningPipeline {
    pub fn new(
        config: &EngineConfig,
        providers: Arc<ProviderManager>,
        memory: Arc<WorldMemory>,
    ) -> Self {
        let judge = config.consistency.semantic.then(|| providers.clone());

        let mut options = GenerateOptions::default()
            .with_system(format!(
                "{}\n\n{}",
                config.generation.system_prompt, MEMORY_BLOCK_INSTRUCTIONS
            ))
            .with_max_tokens(config.generation.max_tokens);
        options.temperature = config.generation.temperature;
        options.timeout = config.generation_timeout();

        Self {
            assembler: PromptAssembler::new(config.prompt.max_memories),
            budget: config.prompt.budget(),
            providers,
            checker: ConsistencyChecker::new(&config.consistency, judge),
            memory,
            mode: config.consistency.mode,
            options,
            update_retries: config.memory.update_retries,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run one turn, recording every state entered in `trace`.
    pub async fn process(
        &self,
        ctx: &TurnContext,
        trace: &StateTrace,
    ) -> Result<TurnOutcome, TurnFailure> {
        let result = self.run(ctx, trace).await;
        match &result {
            Ok(_) => trace.enter(PipelineState::Done),
            Err(failure) if failure.error.kind == ErrorKind::Cancelled => {
                trace.enter(PipelineState::Cancelled)
            }
            Err(_) => trace.enter(PipelineState::Errored),
        }
        result
    }

    async fn run(&self, ctx: &TurnContext, trace: &StateTrace) -> Result<TurnOutcome, TurnFailure> {
        // Assembling
        enter(ctx, trace, PipelineState::Assembling).map_err(TurnFailure::new)?;
        let memories = self.retrieve(ctx).await;
        let prompt = self
            .assembler
            .assemble(
                &ctx.rules.text,
                &memories,
                &ctx.interventions,
                &ctx.player_input,
                self.budget,
            )
            .map_err(|e| {
                TurnFailure::new(TurnError::new(
                    e.kind(),
                    PipelineState::Assembling,
                    e.to_string(),
                ))
            })?;
        debug!(session = %ctx.session_id, turn = %ctx.turn_id, memories = memories.len(), "Prompt assembled");

        // Generating
        enter(ctx, trace, PipelineState::Generating).map_err(TurnFailure::new)?;
        let response = self
            .providers
            .generate(&prompt, &self.options)
            .await
            .map_err(|e| {
                TurnFailure::new(TurnError::new(
                    e.kind(),
                    PipelineState::Generating,
                    e.to_string(),
                ))
            })?;
        let (narrative, memory_block) = split_memory_block(&response.content);
        if narrative.is_empty() {
            return Err(TurnFailure::new(TurnError::new(
                ErrorKind::NonRetryableProvider,
                PipelineState::Generating,
                format!("{} returned an empty narrative", response.metadata.provider),
            ))
            .with_response(response));
        }
        let memory_block = memory_block.map(str::to_string);

        // Checking
        if let Err(error) = enter(ctx, trace, PipelineState::Checking) {
            return Err(TurnFailure::new(error).with_response(response));
        }
        let known = self.memory.entities_for(ctx.session_id);
        let report = self
            .checker
            .check(&narrative, &ctx.rules.parsed_constraints(), &known)
            .await;
        self.report_violations(ctx.session_id, &report);

        if report.has_critical() {
            match self.mode {
                ConsistencyMode::Strict => {
                    let reason = report
                        .worst()
                        .map(|issue| issue.message.clone())
                        .unwrap_or_else(|| "critical consistency issue".to_string());
                    return Err(TurnFailure::new(TurnError::new(
                        ErrorKind::ConsistencyViolation,
                        PipelineState::Checking,
                        reason,
                    ))
                    .with_response(response)
                    .with_report(report));
                }
                ConsistencyMode::Lenient => {
                    warn!(session = %ctx.session_id, turn = %ctx.turn_id, "Critical consistency issue kept in lenient mode");
                }
            }
        }

        // Updating
        if let Err(error) = enter(ctx, trace, PipelineState::Updating) {
            return Err(TurnFailure::new(error)
                .with_response(response)
                .with_report(report));
        }
        let memory_update_error = match self
            .update_memory(ctx, &narrative, memory_block.as_deref())
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(session = %ctx.session_id, turn = %ctx.turn_id, error = %e, "Memory update failed");
                Some(e.to_string())
            }
        };

        info!(
            session = %ctx.session_id,
            turn = %ctx.turn_id,
            provider = %response.metadata.provider,
            score = report.score,
            "Turn processed"
        );

        Ok(TurnOutcome {
            narrative,
            response,
            report,
            memory_update_error,
        })
    }

    /// Memories matching the player input first, then the session's most
    /// important ones.
    async fn retrieve(&self, ctx: &TurnContext) -> Vec<MemoryEntity> {
        let limit = self.assembler.max_memories();
        let mut memories = self
            .memory
            .search(
                &MemoryQuery::text(ctx.player_input.as_str()),
                &MemoryFilter::session(ctx.session_id),
                limit,
            )
            .await;

        for entity in self.memory.entities_for(ctx.session_id) {
            if memories.len() >= limit {
                break;
            }
            if !memories.iter().any(|m| m.id == entity.id) {
                memories.push(entity);
            }
        }
        memories
    }

    async fn update_memory(
        &self,
        ctx: &TurnContext,
        narrative: &str,
        block: Option<&str>,
    ) -> Result<(), MemoryError> {
        let delta = match block {
            Some(json) => MemoryDelta::parse(json)?,
            None => MemoryDelta::default(),
        };

        // Resolved once, so a retry never re-applies importance bumps.
        let existing = self.memory.entities_for(ctx.session_id);
        let resolved = delta.resolve(ctx.session_id, &existing, narrative, ctx.sequence)?;
        if resolved.is_empty() {
            return Ok(());
        }

        let attempts = self.update_retries + 1;
        let mut applied = Applied::default();
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.apply(&resolved, &mut applied).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(turn = %ctx.turn_id, attempt, error = %e, "Memory update attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| MemoryError::Invalid("no update attempts".to_string())))
    }

    /// Apply what `applied` has not covered yet, advancing it as writes land.
    async fn apply(&self, delta: &ResolvedDelta, applied: &mut Applied) -> Result<(), MemoryError> {
        for entity in &delta.entities[applied.entities..] {
            self.memory.store(entity.clone()).await?;
            applied.entities += 1;
        }
        for relation in &delta.relations[applied.relations..] {
            self.memory.link(relation.clone())?;
            applied.relations += 1;
        }
        Ok(())
    }

    fn report_violations(&self, session: SessionId, report: &ConsistencyReport) {
        for severity in Severity::ALL {
            let count = report.count(severity);
            if count > 0 {
                self.metrics.consistency_violations(session, severity, count);
            }
        }
    }
}

/// How much of a resolved delta has been written.
#[derive(Debug, Default)]
struct Applied {
    entities: usize,
    relations: usize,
}

/// Enter `state` unless the turn has been cancelled.
fn enter(ctx: &TurnContext, trace: &StateTrace, state: PipelineState) -> Result<(), TurnError> {
    if ctx.cancel.is_cancelled() {
        debug!(turn = %ctx.turn_id, %state, "Cancellation observed");
        return Err(TurnError::cancelled(state));
    }
    trace.enter(state);
    Ok(())
}
