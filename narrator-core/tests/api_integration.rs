//! Integration tests that call real LLM APIs.
//!
//! These tests require ANTHROPIC_API_KEY (and OPENAI_API_KEY for the
//! fallback test) to be set, via .env file or environment.
//! Run with: `cargo test -p narrator-core --test api_integration -- --ignored`
//!
//! These are marked #[ignore] by default to avoid:
//! - API costs in CI
//! - Test failures when no API key is available
//! - Slow test runs (API calls take seconds)

use narrator_core::{
    ConsistencyMode, Engine, EngineConfig, ProviderConfig, ProviderFactory, RuleSet, TurnRequest,
    TurnStatus,
};

/// Load environment variables from .env file
fn setup() {
    let _ = dotenvy::dotenv();
}

fn has_key(env: &str) -> bool {
    std::env::var(env).is_ok()
}

#[tokio::test]
#[ignore] // Run with: cargo test -p narrator-core --test api_integration -- --ignored
async fn test_live_turn_produces_narrative() {
    setup();
    if !has_key("ANTHROPIC_API_KEY") {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let config = EngineConfig::new(ConsistencyMode::Lenient)
        .with_provider(ProviderConfig::new("claude", "anthropic"));
    let engine = Engine::from_config(config, &ProviderFactory::with_defaults())
        .expect("engine should build");

    engine.register_rules(
        "canon",
        RuleSet::new("A quiet fishing village. No magic exists.").with_constraint("[critical] dragon"),
    );
    let session = engine.open_session("canon").await.expect("session should open");

    let id = engine
        .scheduler()
        .submit(TurnRequest::new(session.id, "I walk down to the harbor at dawn"))
        .await
        .expect("turn should be accepted");
    let turn = engine.scheduler().wait(id).await.expect("turn should finish");

    println!("Status: {}", turn.status);
    println!("Narrative: {:?}", turn.narrative);
    println!("Consistency: {:?}", turn.consistency);

    assert_eq!(turn.status, TurnStatus::Succeeded, "error: {:?}", turn.error);
    assert!(!turn.narrative.unwrap_or_default().trim().is_empty());
    let generation = turn.generation.expect("generation metadata");
    assert_eq!(generation.metadata.provider, "claude");
    assert!(generation.usage.output_tokens > 0);
}

#[tokio::test]
#[ignore]
async fn test_live_fallback_to_second_vendor() {
    setup();
    if !has_key("OPENAI_API_KEY") {
        eprintln!("Skipping test: OPENAI_API_KEY not set");
        return;
    }

    // The first provider points at a closed port, so every attempt fails
    // with a transport error and the call falls through.
    let config = EngineConfig::new(ConsistencyMode::Lenient)
        .with_max_attempts(1)
        .with_provider(
            ProviderConfig::new("broken", "openai").with_base_url("http://127.0.0.1:9"),
        )
        .with_provider(ProviderConfig::new("openai", "openai").with_model("gpt-4o-mini"));
    let engine = Engine::from_config(config, &ProviderFactory::with_defaults())
        .expect("engine should build");

    let response = engine
        .providers()
        .generate(
            "Describe a lighthouse in one sentence.",
            &narrator_core::GenerateOptions::default().with_max_tokens(100),
        )
        .await
        .expect("fallback should succeed");

    println!("{}", response.content);
    assert_eq!(response.metadata.provider, "openai");
    assert_eq!(engine.providers().health("broken").unwrap().failures, 1);
}
