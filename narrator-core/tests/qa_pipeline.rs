//! QA tests for the reasoning pipeline as seen through finished turns.
//!
//! These tests verify:
//! - Strict and lenient handling of critical consistency issues
//! - Prompt budgets, memory dropping and directive ordering
//! - Memory blocks applied after a turn and recalled in the next
//! - Semantic judge verdicts and judge failures
//!
//! Run with: `cargo test -p narrator-core --test qa_pipeline`

use async_trait::async_trait;
use narrator_core::consistency::IssueKind;
use narrator_core::memory::{EntityKind, InMemoryVectorIndex, VectorIndex};
use narrator_core::testing::{ScriptedProvider, TestHarness};
use narrator_core::{
    Budget, ConsistencyMode, EntityId, ErrorKind, Intervention, InterventionKind, MemoryEntity,
    MemoryError, PipelineState, Priority, ProviderError, RuleSet, Severity, TurnRequest,
    TurnStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn rules() -> RuleSet {
    RuleSet::new("Magic does not exist in this world.").with_constraint("[critical] fireball")
}

// =============================================================================
// CONSISTENCY MODES
// =============================================================================

#[tokio::test]
async fn test_strict_mode_fails_on_critical_issue() {
    let reply = "A fireball bursts over the square.\n```memory\n\
        {\"entities\": [{\"kind\": \"location\", \"name\": \"Square\"}]}\n```";
    let mut config = TestHarness::config();
    config.consistency.mode = ConsistencyMode::Strict;
    let harness = TestHarness::with_config(vec![ScriptedProvider::new("p").otherwise(reply)], config);
    let session = harness.open_session(rules()).await;

    let turn = harness.play(session, "I cast a spell").await;
    assert_eq!(turn.status, TurnStatus::Failed);
    assert!(turn.narrative.is_none());

    let error = turn.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ConsistencyViolation);
    assert_eq!(error.state, PipelineState::Checking);
    assert!(error.reason.contains("fireball"));

    let report = turn.consistency.unwrap();
    assert!(report.has_critical());
    assert!(turn.generation.is_some());
    assert!(harness.engine.memory().entities_for(session).is_empty());
    assert_eq!(harness.metrics.violation_count(Severity::Critical), 1);
}

#[tokio::test]
async fn test_lenient_mode_keeps_report_unmodified() {
    let reply = "A Fireball bursts over the square.";
    let harness = TestHarness::new(vec![ScriptedProvider::new("p").otherwise(reply)]);
    let session = harness.open_session(rules()).await;

    let turn = harness.play(session, "I cast a spell").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    assert_eq!(turn.narrative.as_deref(), Some(reply));

    let report = turn.consistency.unwrap();
    assert_eq!(report.issues.len(), 1);
    let issue = &report.issues[0];
    assert_eq!(issue.kind, IssueKind::ForbiddenPhrase);
    assert_eq!(issue.severity, Severity::Critical);
    let span = issue.location.unwrap();
    assert_eq!(&reply[span.start..span.end], "Fireball");
    assert_eq!(report.score, 0.0);
}

#[tokio::test]
async fn test_phrase_inside_word_is_not_flagged() {
    let harness = TestHarness::new(vec![
        ScriptedProvider::new("p").otherwise("The fireballs of legend never existed.")
    ]);
    let session = harness.open_session(rules()).await;

    let turn = harness.play(session, "I read a book").await;
    assert!(turn.consistency.unwrap().is_clean());
}

// =============================================================================
// PROMPT ASSEMBLY
// =============================================================================

#[tokio::test]
async fn test_budget_equal_to_required_sections_drops_memories() {
    let rules_text = "Low magic.";
    let input = "I look around";
    let required = format!("## Rules\n{rules_text}\n\n## Player Input\n{input}");

    let config = TestHarness::config().with_prompt_budget(Budget::Chars(required.chars().count()));
    let harness = TestHarness::with_config(vec![ScriptedProvider::new("p")], config);
    let session = harness.open_session(RuleSet::new(rules_text)).await;
    harness
        .engine
        .memory()
        .store(MemoryEntity::new(session, EntityKind::Location, "Harbor").with_importance(0.9))
        .await
        .unwrap();

    let turn = harness.play(session, input).await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    assert_eq!(harness.provider(0).prompts(), vec![required]);
}

#[tokio::test]
async fn test_rules_over_budget_fail_while_assembling() {
    let config = TestHarness::config().with_prompt_budget(Budget::Chars(10));
    let harness = TestHarness::with_config(vec![ScriptedProvider::new("p")], config);
    let session = harness.open_session(rules()).await;

    let turn = harness.play(session, "hello").await;
    assert_eq!(turn.status, TurnStatus::Failed);
    let error = turn.error.unwrap();
    assert_eq!(error.kind, ErrorKind::BudgetExceeded);
    assert_eq!(error.state, PipelineState::Assembling);
    assert_eq!(harness.provider(0).calls(), 0);
}

#[tokio::test]
async fn test_directives_rendered_critical_first() {
    let harness = TestHarness::new(vec![ScriptedProvider::new("p")]);
    let session = harness.open_session(RuleSet::new("r")).await;

    let request = TurnRequest::new(session, "I knock")
        .with_intervention(Intervention::text(InterventionKind::Tone, Priority::Low, "keep it light"))
        .with_intervention(Intervention::text(InterventionKind::Retcon, Priority::Critical, "the door was never locked"))
        .with_intervention(Intervention::text(InterventionKind::Ooc, Priority::Low, "short replies please"));
    let id = harness.engine.scheduler().submit(request).await.unwrap();
    harness.wait(id).await;

    let prompt = &harness.provider(0).prompts()[0];
    let directives = prompt.find("## Directives (out of character)").unwrap();
    let retcon = prompt.find("the door was never locked").unwrap();
    let tone = prompt.find("keep it light").unwrap();
    let ooc = prompt.find("short replies please").unwrap();
    assert!(directives < retcon && retcon < tone && tone < ooc);
    assert!(ooc < prompt.find("## Player Input").unwrap());
}

// =============================================================================
// MEMORY UPDATES
// =============================================================================

#[tokio::test]
async fn test_memory_block_applied_and_recalled() {
    let first = "A cloaked woman named Mira waits by the docks.\n\n```memory\n\
        {\"entities\": [\
            {\"kind\": \"character\", \"name\": \"Mira\", \"content\": {\"role\": \"smuggler\"}, \"importance\": 0.8},\
            {\"kind\": \"location\", \"name\": \"Docks\"}],\
         \"relations\": [{\"source\": \"Mira\", \"target\": \"Docks\", \"type\": \"located_in\"}]}\n```";
    let harness = TestHarness::new(vec![
        ScriptedProvider::new("p").reply(first).otherwise("Mira nods.")
    ]);
    let session = harness.open_session(RuleSet::new("r")).await;

    let turn = harness.play(session, "I walk to the docks").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    assert_eq!(
        turn.narrative.as_deref(),
        Some("A cloaked woman named Mira waits by the docks.")
    );
    assert!(turn.memory_update_error.is_none());

    let memory = harness.engine.memory();
    let entities = memory.entities_for(session);
    assert_eq!(entities.len(), 2);
    let mira = entities.iter().find(|e| e.name == "Mira").unwrap();
    assert_eq!(mira.attr_str("role"), Some("smuggler"));
    let related = memory.related(mira.id, Some("located_in"));
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].name, "Docks");

    harness.play(session, "I greet Mira").await;
    let second_prompt = &harness.provider(0).prompts()[1];
    assert!(second_prompt.contains("## World Memory"));
    assert!(second_prompt.contains("Mira: role=smuggler"));

    // Mentioned by name in the second narrative
    let mira = memory.get(mira.id).unwrap();
    assert!(mira.importance > 0.8);
    assert!(mira.version >= 2);
}

#[tokio::test]
async fn test_bad_memory_block_is_noted_not_fatal() {
    let reply = "The lights go out.\n```memory\n{not json}\n```";
    let harness = TestHarness::new(vec![ScriptedProvider::new("p").otherwise(reply)]);
    let session = harness.open_session(RuleSet::new("r")).await;

    let turn = harness.play(session, "I wait").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    assert_eq!(turn.narrative.as_deref(), Some("The lights go out."));
    assert!(turn.memory_update_error.unwrap().contains("memory block"));
}

/// Vector index that rejects a set number of upserts, then recovers.
#[derive(Default)]
struct FlakyIndex {
    inner: InMemoryVectorIndex,
    failures_left: AtomicUsize,
    rejected: AtomicUsize,
}

impl FlakyIndex {
    fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn upsert(&self, id: EntityId, embedding: &[f32]) -> Result<(), MemoryError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(MemoryError::Vector("index busy".into()));
        }
        self.inner.upsert(id, embedding).await
    }

    async fn remove(&self, id: EntityId) -> Result<(), MemoryError> {
        self.inner.remove(id).await
    }

    async fn nearest(&self, embedding: &[f32], limit: usize) -> Result<Vec<(EntityId, f32)>, MemoryError> {
        self.inner.nearest(embedding, limit).await
    }
}

/// A harness whose world memory indexes through `index`, with "Mira"
/// already known and embedded.
async fn flaky_memory_harness(
    reply: &str,
    index: Arc<FlakyIndex>,
) -> (TestHarness, narrator_core::SessionId, EntityId) {
    let harness = TestHarness::with_builder(
        vec![ScriptedProvider::new("p").otherwise(reply)],
        TestHarness::config(),
        |builder| builder.with_vector_index(index as Arc<dyn VectorIndex>),
    );
    let session = harness.open_session(RuleSet::new("r")).await;
    let mira = harness
        .engine
        .memory()
        .store(
            MemoryEntity::new(session, EntityKind::Character, "Mira")
                .with_importance(0.5)
                .with_embedding(vec![1.0, 0.0]),
        )
        .await
        .unwrap();
    (harness, session, mira)
}

const HARBOR_REPLY: &str = "Mira hauls a crate past the harbor.\n```memory\n\
    {\"entities\": [{\"kind\": \"location\", \"name\": \"Harbor\"}]}\n```";

#[tokio::test]
async fn test_memory_update_retried_after_transient_failure() {
    let index = Arc::new(FlakyIndex::default());
    let (harness, session, mira) = flaky_memory_harness(HARBOR_REPLY, index.clone()).await;
    index.fail_next(1);

    let turn = harness.play(session, "I watch the water").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    assert!(turn.memory_update_error.is_none());
    assert_eq!(index.rejected(), 1);

    let memory = harness.engine.memory();
    let mira = memory.get(mira).unwrap();
    assert!(
        (mira.importance - 0.55).abs() < 1e-6,
        "mention bump applied once, got {}",
        mira.importance
    );
    assert_eq!(mira.version, 2);
    let harbor = memory
        .entities_for(session)
        .into_iter()
        .find(|e| e.name == "Harbor")
        .unwrap();
    assert_eq!(harbor.version, 1, "written once across both attempts");
}

#[tokio::test]
async fn test_memory_update_failure_is_noted_and_turn_succeeds() {
    let index = Arc::new(FlakyIndex::default());
    let (harness, session, mira) = flaky_memory_harness(HARBOR_REPLY, index.clone()).await;
    index.fail_next(10);

    let turn = harness.play(session, "I watch the water").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    assert_eq!(turn.narrative.as_deref(), Some("Mira hauls a crate past the harbor."));
    assert!(turn.memory_update_error.unwrap().contains("index busy"));
    // One try plus the default single retry
    assert_eq!(index.rejected(), 2);

    let mira = harness.engine.memory().get(mira).unwrap();
    assert_eq!(mira.version, 1);
    assert_eq!(mira.importance, 0.5);
}

#[tokio::test]
async fn test_gone_entity_mention_is_medium_issue() {
    let harness = TestHarness::new(vec![
        ScriptedProvider::new("p").otherwise("Old Bram waves from the window.")
    ]);
    let session = harness.open_session(RuleSet::new("r")).await;
    harness
        .engine
        .memory()
        .store(MemoryEntity::new(session, EntityKind::Character, "Bram").with_attr("status", "dead"))
        .await
        .unwrap();

    let turn = harness.play(session, "I look at the house").await;
    let report = turn.consistency.unwrap();
    assert_eq!(report.count(Severity::Medium), 1);
    assert_eq!(report.issues[0].kind, IssueKind::MemoryContradiction);
    assert_eq!(harness.metrics.violation_count(Severity::Medium), 1);
}

#[tokio::test]
async fn test_empty_narrative_fails_turn() {
    let reply = "```memory\n{\"entities\": []}\n```";
    let harness = TestHarness::new(vec![ScriptedProvider::new("p").otherwise(reply)]);
    let session = harness.open_session(RuleSet::new("r")).await;

    let turn = harness.play(session, "hello").await;
    assert_eq!(turn.status, TurnStatus::Failed);
    let error = turn.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NonRetryableProvider);
    assert_eq!(error.state, PipelineState::Generating);
}

// =============================================================================
// SEMANTIC JUDGE
// =============================================================================

#[tokio::test]
async fn test_semantic_judge_issues_are_reported() {
    let provider = ScriptedProvider::new("p")
        .reply("Mira sails north.")
        .reply("```json\n{\"issues\": [{\"severity\": \"high\", \"message\": \"Mira fears the sea\"}]}\n```");
    let config = TestHarness::config().with_semantic_checks(true);
    let harness = TestHarness::with_config(vec![provider], config);
    let session = harness.open_session(RuleSet::new("r")).await;

    let turn = harness.play(session, "I board the ship").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    let report = turn.consistency.unwrap();
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IssueKind::Semantic);
    assert_eq!(report.issues[0].severity, Severity::High);
    assert_eq!(harness.provider(0).calls(), 2);
}

#[tokio::test]
async fn test_judge_failure_adds_low_issue() {
    let provider = ScriptedProvider::new("p")
        .reply("The bell tolls.")
        .fail(ProviderError::Auth("judge key revoked".into()));
    let config = TestHarness::config().with_semantic_checks(true);
    let harness = TestHarness::with_config(vec![provider], config);
    let session = harness.open_session(RuleSet::new("r")).await;

    let turn = harness.play(session, "I listen").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    let report = turn.consistency.unwrap();
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IssueKind::CheckUnavailable);
    assert_eq!(report.issues[0].severity, Severity::Low);
    assert!((report.score - 0.9).abs() < 1e-9);
}
