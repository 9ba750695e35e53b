//! LLM providers and the manager that retries and falls back across them.
//!
//! - [`Provider`]: one endpoint (a vendor API, or a scripted stand-in)
//! - [`ProviderManager`]: ordering, retries, health tracking, cost accounting
//! - [`ProviderFactory`]: builds providers from configuration by kind

mod adapter;
mod factory;
mod health;
mod manager;
pub mod pricing;
mod retry;

pub use adapter::ClientProvider;
pub use factory::{ProviderBuilder, ProviderFactory};
pub use health::HealthSnapshot;
pub use manager::ProviderManager;
pub use pricing::{ModelPrice, PricingModel, PricingTable};
pub use retry::backoff_delay;

use crate::error::ErrorKind;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Streaming text chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Errors from a single provider call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("provider misconfigured: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Timeouts, rate limits, 5xx and transport failures are worth retrying
    /// on the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::RateLimited { .. }
                | ProviderError::Server { .. }
                | ProviderError::Transport(_)
        )
    }

    /// Server-suggested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => ProviderError::RateLimited { retry_after: None },
            401 | 403 => ProviderError::Auth(message),
            408 => ProviderError::Timeout,
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::InvalidRequest(format!("status {status}: {message}")),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Configuration(_) => ErrorKind::Configuration,
            e if e.is_retryable() => ErrorKind::RetryableProvider,
            _ => ErrorKind::NonRetryableProvider,
        }
    }
}

/// The outcome of one provider attempt. Fallback is a plain branch on this
/// rather than error propagation.
#[derive(Debug)]
pub enum Attempt<T> {
    Ok(T),
    /// Worth trying the same provider again.
    Retry(ProviderError),
    /// Give up on this provider and try the next.
    Fallthrough(ProviderError),
    /// Stop the whole call; no other provider will do better.
    Fatal(ProviderError),
}

impl<T> Attempt<T> {
    pub fn classify(result: Result<T, ProviderError>) -> Self {
        match result {
            Ok(value) => Attempt::Ok(value),
            Err(e @ ProviderError::Configuration(_)) => Attempt::Fatal(e),
            Err(e) if e.is_retryable() => Attempt::Retry(e),
            Err(e) => Attempt::Fallthrough(e),
        }
    }
}

/// Token usage breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// What a provider sends back for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

impl ProviderReply {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage: TokenUsage::default(),
            finish_reason: "stop".to_string(),
        }
    }

    pub fn with_usage(mut self, input_tokens: usize, output_tokens: usize) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }
}

/// A normalized request handed to one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: usize,
    pub stop: Vec<String>,
}

/// Per-call options for [`ProviderManager::generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub system: Option<String>,
    /// Overrides each provider's default model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: usize,
    pub stop: Vec<String>,
    /// Overrides each provider's default timeout.
    pub timeout: Option<Duration>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            system: None,
            model: None,
            temperature: None,
            max_tokens: 1024,
            stop: Vec::new(),
            timeout: None,
        }
    }
}

impl GenerateOptions {
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deterministic requests may be served from the response cache.
    pub fn is_deterministic(&self) -> bool {
        self.temperature == Some(0.0)
    }

    pub(crate) fn request(&self, prompt: &str) -> ProviderRequest {
        ProviderRequest {
            prompt: prompt.to_string(),
            system: self.system.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stop: self.stop.clone(),
        }
    }
}

/// Where a response came from and how hard it was to get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub provider: String,
    /// Attempts across all providers for this call (0 when cached).
    pub attempts: u32,
    pub finish_reason: String,
    pub latency_ms: u64,
    #[serde(default)]
    pub cached: bool,
}

/// A generation with its cost attached.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    /// USD; zero when pricing is unknown.
    pub cost: f64,
    pub metadata: ProviderMetadata,
}

/// The last error each provider produced before the call gave up on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

/// Errors from [`ProviderManager::generate`].
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    #[error("all providers exhausted: {}", summarize_failures(.0))]
    AllProvidersExhausted(Vec<ProviderFailure>),

    #[error("provider '{provider}' is misconfigured: {message}")]
    Configuration { provider: String, message: String },

    #[error("no providers registered")]
    NoProviders,
}

impl GenerateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerateError::AllProvidersExhausted(_) => ErrorKind::AllProvidersExhausted,
            GenerateError::Configuration { .. } | GenerateError::NoProviders => {
                ErrorKind::Configuration
            }
        }
    }
}

fn summarize_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One LLM endpoint.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique name used in fallback order, logs and health records.
    fn name(&self) -> &str;

    /// Timeout applied when the request has none.
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError>;

    async fn generate_stream(&self, request: &ProviderRequest)
        -> Result<ChunkStream, ProviderError>;

    /// Cheap request proving the provider is reachable.
    async fn health(&self) -> Result<(), ProviderError>;
}
