//! QA tests for session persistence.
//!
//! These tests verify:
//! - Terminal turns and session counters land in the JSON store
//! - A fresh engine resumes a saved session where it left off
//! - Session status changes are saved and enforced
//!
//! Run with: `cargo test -p narrator-core --test qa_persistence`

use narrator_core::testing::ScriptedProvider;
use narrator_core::{
    ConsistencyMode, Engine, EngineBuilder, EngineConfig, ErrorKind, JsonDirStore, Provider,
    RuleSet, SessionStatus, SessionStore, TurnRequest, TurnStatus,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn engine(dir: &Path, reply: &str) -> Engine {
    let config = EngineConfig::new(ConsistencyMode::Lenient)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
    let engine = EngineBuilder::new(config)
        .with_provider(Arc::new(ScriptedProvider::new("p").otherwise(reply)) as Arc<dyn Provider>)
        .with_store(Arc::new(JsonDirStore::new(dir)))
        .build()
        .unwrap();
    engine.register_rules("canon", RuleSet::new("The sea is cold."));
    engine
}

async fn play(engine: &Engine, session: narrator_core::SessionId, input: &str) -> narrator_core::Turn {
    let id = engine
        .scheduler()
        .submit(TurnRequest::new(session, input))
        .await
        .unwrap();
    engine.scheduler().wait(id).await.unwrap()
}

#[tokio::test]
async fn test_turns_and_counter_written_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), "Waves crash.");
    let session = engine.open_session("canon").await.unwrap();

    play(&engine, session.id, "I walk the shore").await;
    play(&engine, session.id, "I dive in").await;

    let store = JsonDirStore::new(dir.path());
    assert_eq!(store.list_sessions().await.unwrap(), vec![session.id]);

    let saved = store.load_session(session.id).await.unwrap().unwrap();
    assert_eq!(saved.turn_counter, 2);
    assert_eq!(saved.rules_ref, "canon");

    let turns = store.load_turns(session.id).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].sequence, 1);
    assert_eq!(turns[0].player_input, "I walk the shore");
    assert_eq!(turns[1].narrative.as_deref(), Some("Waves crash."));
    assert!(turns.iter().all(|t| t.status == TurnStatus::Succeeded));
    assert!(turns[1].consistency.is_some());
}

#[tokio::test]
async fn test_fresh_engine_resumes_saved_session() {
    let dir = tempfile::tempdir().unwrap();
    let session = {
        let engine = engine(dir.path(), "Day one.");
        let session = engine.open_session("canon").await.unwrap();
        play(&engine, session.id, "I wake").await;
        play(&engine, session.id, "I eat").await;
        session.id
    };

    let engine = engine(dir.path(), "Day two.");
    let turn = play(&engine, session, "I wake again").await;
    assert_eq!(turn.status, TurnStatus::Succeeded);
    assert_eq!(turn.sequence, 3);

    let turns = engine.store().load_turns(session).await.unwrap();
    let narratives: Vec<_> = turns.iter().filter_map(|t| t.narrative.as_deref()).collect();
    assert_eq!(narratives, vec!["Day one.", "Day one.", "Day two."]);
}

#[tokio::test]
async fn test_paused_session_is_saved_and_rejects_turns() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), "Quiet.");
    let session = engine.open_session("canon").await.unwrap();

    engine
        .scheduler()
        .set_session_status(session.id, SessionStatus::Paused)
        .await
        .unwrap();
    let saved = engine.store().load_session(session.id).await.unwrap().unwrap();
    assert_eq!(saved.status, SessionStatus::Paused);

    let err = engine
        .scheduler()
        .submit(TurnRequest::new(session.id, "hello"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionInactive);

    engine
        .scheduler()
        .set_session_status(session.id, SessionStatus::Active)
        .await
        .unwrap();
    let turn = play(&engine, session.id, "hello").await;
    assert_eq!(turn.sequence, 1);
}

#[tokio::test]
async fn test_failed_turn_is_recorded_with_its_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), "");
    let session = engine.open_session("canon").await.unwrap();

    let turn = play(&engine, session.id, "hello").await;
    assert_eq!(turn.status, TurnStatus::Failed);

    let stored = engine.store().load_turns(session.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, turn.id);
    assert_eq!(stored[0].status, TurnStatus::Failed);
    assert_eq!(
        stored[0].error.as_ref().unwrap().kind,
        ErrorKind::NonRetryableProvider
    );
}
