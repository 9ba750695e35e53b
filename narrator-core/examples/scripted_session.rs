//! Play a short session against scripted providers, no API key needed.
//!
//! Run with: `RUST_LOG=narrator_core=debug cargo run -p narrator-core --example scripted_session`

use narrator_core::testing::{ScriptedProvider, TestHarness};
use narrator_core::{Intervention, InterventionKind, Priority, ProviderError, RuleSet, TurnRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    println!("=== Scripted Session ===\n");

    // The primary is rate limited once, then fails outright; the backup answers.
    let primary = ScriptedProvider::new("primary")
        .fail(ProviderError::RateLimited { retry_after: None })
        .always_fail(ProviderError::Server {
            status: 503,
            message: "overloaded".into(),
        });
    let backup = ScriptedProvider::new("backup")
        .reply(
            "Fog rolls in over the harbor. A woman named Mira mends nets by the pier.\n\n\
             ```memory\n\
             {\"entities\": [{\"kind\": \"character\", \"name\": \"Mira\", \"content\": {\"role\": \"net mender\"}, \"importance\": 0.7},\
                             {\"kind\": \"location\", \"name\": \"Harbor\"}],\
              \"relations\": [{\"source\": \"Mira\", \"target\": \"Harbor\", \"type\": \"located_in\"}]}\n\
             ```",
        )
        .otherwise("Mira looks up and nods, saying nothing.");

    let harness = TestHarness::new(vec![primary, backup]);
    let rules = RuleSet::new("A grey fishing town. No magic exists.").with_constraint("[critical] spell");
    let session = harness.open_session(rules).await;

    println!("1. Arriving...");
    let turn = harness.play(session, "I walk down to the harbor").await;
    println!("   Status: {}", turn.status);
    if let Some(generation) = &turn.generation {
        println!(
            "   Provider: {} after {} attempts",
            generation.metadata.provider, generation.metadata.attempts
        );
    }
    println!("   Narrative: {}", turn.narrative.as_deref().unwrap_or("-"));

    println!("\n2. Talking, with an out-of-character directive...");
    let request = TurnRequest::new(session, "I ask Mira about the fog").with_intervention(
        Intervention::text(InterventionKind::Tone, Priority::High, "keep it terse"),
    );
    let id = harness.engine.scheduler().submit(request).await?;
    let turn = harness.engine.scheduler().wait(id).await?;
    println!("   Status: {}", turn.status);
    println!("   Narrative: {}", turn.narrative.as_deref().unwrap_or("-"));

    println!("\n3. World memory:");
    let memory = harness.engine.memory();
    let entities = memory.entities_for(session);
    for line in memory.summarize(&entities).await?.lines() {
        println!("   {line}");
    }

    println!("\n4. Provider health:");
    for health in harness.engine.providers().health_all() {
        println!(
            "   {}: {} ok / {} failed, deprioritized: {}",
            health.name, health.successes, health.failures, health.deprioritized
        );
    }

    println!("\n=== Done ===");
    Ok(())
}
