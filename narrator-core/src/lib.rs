//! Turn-based narrative engine driving LLM storytellers.
//!
//! This crate provides:
//! - A turn scheduler with per-session ordering and a bounded worker pool
//! - Prompt assembly within a character or token budget
//! - Provider fallback with retries, health tracking and cost accounting
//! - Consistency checks against rules and world memory
//! - World memory with relations, search and cached summaries
//! - Session persistence
//!
//! # Quick Start
//!
//! ```ignore
//! use narrator_core::{ConsistencyMode, Engine, EngineConfig, ProviderFactory, RuleSet, TurnRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_file("narrator.toml")?;
//!     let engine = Engine::from_config(config, &ProviderFactory::with_defaults())?;
//!
//!     engine.register_rules("canon", RuleSet::new("No magic exists.").with_constraint("[critical] fireball"));
//!     let session = engine.open_session("canon").await?;
//!
//!     let id = engine.scheduler().submit(TurnRequest::new(session.id, "I light a lantern")).await?;
//!     let turn = engine.scheduler().wait(id).await?;
//!     println!("{}", turn.narrative.unwrap_or_default());
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod cache;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod extract;
pub mod id;
pub mod intervention;
pub mod memory;
pub mod metrics;
pub mod persist;
pub mod pipeline;
pub mod provider;
pub mod rules;
pub mod scheduler;
pub mod session;
pub mod testing;
pub mod text;
pub mod turn;

// Primary public API
pub use assembler::{AssembleError, Budget, PromptAssembler};
pub use config::{BusyPolicy, ConfigError, ConsistencyMode, EngineConfig, ProviderConfig};
pub use consistency::{ConsistencyChecker, ConsistencyReport, Issue, IssueKind, Severity};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorKind, TurnError};
pub use id::{EntityId, SessionId, TurnId};
pub use intervention::{Intervention, InterventionKind, Priority};
pub use memory::{EntityKind, MemoryEntity, MemoryError, MemoryRelation, WorldMemory};
pub use metrics::{MetricsSink, NoopMetrics};
pub use persist::{InMemoryStore, JsonDirStore, PersistError, SessionStore};
pub use provider::{
    GenerateError, GenerateOptions, LlmResponse, Provider, ProviderError, ProviderFactory,
    ProviderManager,
};
pub use rules::{RuleSet, RuleRegistry};
pub use scheduler::{SchedulerError, TurnScheduler};
pub use session::{Session, SessionStatus};
pub use testing::{ScriptedProvider, TestHarness};
pub use turn::{PipelineState, Turn, TurnRequest, TurnStatus};
