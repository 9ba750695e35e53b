//! Engine configuration.
//!
//! Loaded from TOML or built in code with the `with_*` methods, then checked
//! with [`EngineConfig::validate`]. Everything has a default except
//! `consistency.mode`, which must be chosen explicitly.
//!
//! ```toml
//! fallback_order = ["primary", "backup"]
//!
//! [scheduler]
//! max_concurrent_turns = 4
//! busy_policy = "reject"
//!
//! [consistency]
//! mode = "strict"
//!
//! [[providers]]
//! name = "primary"
//! kind = "anthropic"
//! api_key_env = "ANTHROPIC_API_KEY"
//! ```

use crate::assembler::Budget;
use crate::error::ErrorKind;
use crate::provider::pricing::ModelPrice;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default system prompt for the narrator.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the narrator of an interactive story. \
Continue the story in response to the player's input, honouring the rules and the \
established world memory. Follow out-of-character directives without mentioning them. \
Write only narrative prose.";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Provider '{provider}' needs an API key in ${env}")]
    MissingApiKey { provider: String, env: String },

    #[error("Unknown provider kind '{0}'")]
    UnknownProviderKind(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// What happens to a turn submitted while its session is running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Fail the submission with `SessionBusy`.
    #[default]
    Reject,
    /// Queue behind the running turn.
    Queue,
}

/// How critical consistency issues are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// A critical issue fails the turn.
    Strict,
    /// Issues are attached to the turn, which still succeeds.
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    #[default]
    Chars,
    Tokens,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Provider names in the order they are tried. Empty means
    /// configuration order.
    #[serde(default)]
    pub fallback_order: Vec<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    pub consistency: ConsistencyConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub response_cache: ResponseCacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_turns: usize,
    pub busy_policy: BusyPolicy,
    /// Finished turns kept in memory. Older ones are read back from the store.
    pub retained_turns: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_turns: 4,
            busy_policy: BusyPolicy::Reject,
            retained_turns: 256,
        }
    }
}

/// One provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name used in `fallback_order`, logs and health records.
    pub name: String,
    /// Factory key, e.g. `anthropic` or `openai`.
    pub kind: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key. Defaults per kind.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Per-call timeout when the request doesn't set one.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Price of the configured model; unknown pricing means zero cost.
    #[serde(default)]
    pub pricing: Option<ModelPrice>,
}

fn default_provider_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            model: None,
            base_url: None,
            api_key_env: None,
            timeout_secs: default_provider_timeout_secs(),
            pricing: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key_env(mut self, env: impl Into<String>) -> Self {
        self.api_key_env = Some(env.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPrice) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per provider before falling through to the next one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of recent attempts the success rate is computed over.
    pub window: usize,
    /// Attempts needed in the window before a provider can be deprioritized.
    pub min_samples: usize,
    pub min_success_rate: f64,
    /// How long a deprioritized provider waits between automatic probes.
    /// Generations probe due providers before picking one.
    pub probe_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            min_success_rate: 0.5,
            probe_interval_secs: 30,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub budget: usize,
    pub budget_unit: BudgetUnit,
    pub max_memories: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget: 24_000,
            budget_unit: BudgetUnit::Chars,
            max_memories: 12,
        }
    }
}

impl PromptConfig {
    pub fn budget(&self) -> Budget {
        match self.budget_unit {
            BudgetUnit::Chars => Budget::Chars(self.budget),
            BudgetUnit::Tokens => Budget::Tokens(self.budget),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    pub mode: ConsistencyMode,
    /// Ask an LLM judge for semantic contradictions after the cheap checks.
    #[serde(default)]
    pub semantic: bool,
    #[serde(default = "default_semantic_timeout_secs")]
    pub semantic_timeout_secs: u64,
}

fn default_semantic_timeout_secs() -> u64 {
    20
}

impl ConsistencyConfig {
    pub fn new(mode: ConsistencyMode) -> Self {
        Self {
            mode,
            semantic: false,
            semantic_timeout_secs: default_semantic_timeout_secs(),
        }
    }

    pub fn semantic_timeout(&self) -> Duration {
        Duration::from_secs(self.semantic_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Extra attempts at applying a turn's memory updates.
    pub update_retries: u32,
    pub summary_cache_capacity: usize,
    pub summary_cache_ttl_secs: u64,
    /// Summarize through the providers instead of the local digest.
    pub llm_summaries: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            update_retries: 1,
            summary_cache_capacity: 128,
            summary_cache_ttl_secs: 3600,
            llm_summaries: false,
        }
    }
}

impl MemoryConfig {
    pub fn summary_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.summary_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: usize,
    /// Overrides each provider's own timeout when set.
    pub timeout_secs: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: Some(0.8),
            max_tokens: 1024,
            timeout_secs: None,
        }
    }
}

/// Cache for deterministic (temperature 0) generations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseCacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            ttl_secs: 600,
        }
    }
}

impl EngineConfig {
    /// Configuration with every default and the given consistency mode.
    pub fn new(mode: ConsistencyMode) -> Self {
        Self {
            fallback_order: Vec::new(),
            scheduler: SchedulerConfig::default(),
            providers: Vec::new(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            prompt: PromptConfig::default(),
            consistency: ConsistencyConfig::new(mode),
            memory: MemoryConfig::default(),
            generation: GenerationConfig::default(),
            response_cache: ResponseCacheConfig::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_fallback_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_order = order.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent_turns(mut self, n: usize) -> Self {
        self.scheduler.max_concurrent_turns = n;
        self
    }

    pub fn with_retained_turns(mut self, n: usize) -> Self {
        self.scheduler.retained_turns = n;
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.scheduler.busy_policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.retry.max_attempts = n;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry.backoff_base_ms = base.as_millis() as u64;
        self.retry.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_prompt_budget(mut self, budget: Budget) -> Self {
        (self.prompt.budget, self.prompt.budget_unit) = match budget {
            Budget::Chars(n) => (n, BudgetUnit::Chars),
            Budget::Tokens(n) => (n, BudgetUnit::Tokens),
        };
        self
    }

    pub fn with_max_memories(mut self, n: usize) -> Self {
        self.prompt.max_memories = n;
        self
    }

    pub fn with_semantic_checks(mut self, enabled: bool) -> Self {
        self.consistency.semantic = enabled;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.generation.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.generation.temperature = temperature;
        self
    }

    pub fn with_memory_update_retries(mut self, n: u32) -> Self {
        self.memory.update_retries = n;
        self
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent_turns == 0 {
            return Err(invalid("scheduler.max_concurrent_turns must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(invalid(
                "retry.backoff_base_ms must not exceed retry.backoff_max_ms",
            ));
        }
        if self.health.window == 0 || self.health.min_samples == 0 {
            return Err(invalid("health.window and health.min_samples must be at least 1"));
        }
        if self.health.min_samples > self.health.window {
            return Err(invalid("health.min_samples must not exceed health.window"));
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(invalid("health.min_success_rate must be within [0, 1]"));
        }
        if self.prompt.budget == 0 {
            return Err(invalid("prompt.budget must be positive"));
        }
        if let Some(t) = self.generation.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(invalid("generation.temperature must be within [0, 2]"));
            }
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(invalid("provider names must not be empty"));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(invalid(format!("duplicate provider '{}'", provider.name)));
            }
            if provider.timeout_secs == 0 {
                return Err(invalid(format!(
                    "provider '{}' timeout_secs must be positive",
                    provider.name
                )));
            }
        }

        // With no providers configured here they are injected in code, and
        // the provider manager checks the order against those instead.
        if !self.providers.is_empty() {
            for name in &self.fallback_order {
                if !names.contains(name.as_str()) {
                    return Err(invalid(format!(
                        "fallback_order names unknown provider '{name}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Per-call timeout override for narrative generation, if configured.
    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation.timeout_secs.map(Duration::from_secs)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
