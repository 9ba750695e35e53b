//! Minimal chat-completion client for Anthropic and OpenAI-compatible APIs.
//!
//! This crate provides a focused client with:
//! - One request/response shape for both vendors
//! - Non-streaming and streaming completions
//! - Buffered SSE parsing that tolerates events split across chunks
//! - Error values that keep the HTTP status and `Retry-After` hint

mod anthropic;
mod openai;
mod sse;

pub use anthropic::Anthropic;
pub use openai::OpenAi;

use reqwest::header::HeaderMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::Stream;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when talking to a completion API.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("API key not configured: set {0}")]
    NoApiKey(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status of an API error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(error.to_string())
        }
    }
}

/// Which wire protocol a client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Anthropic,
    OpenAi,
}

impl Vendor {
    /// Parse a vendor name (case-insensitive).
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "openai-compatible" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!(
                "unsupported vendor '{other}' (expected: anthropic, openai)"
            ))),
        }
    }

    /// Default API base URL.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::OpenAi => "https://api.openai.com/v1",
        }
    }

    /// Default model when a request does not name one.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
        }
    }

    /// Conventional environment variable holding the API key.
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }
}

/// A client for one vendor endpoint.
#[derive(Clone)]
pub enum Client {
    Anthropic(Anthropic),
    OpenAi(OpenAi),
}

impl Client {
    /// Create a client for `vendor` with the given API key and default settings.
    pub fn new(vendor: Vendor, api_key: impl Into<String>) -> Self {
        match vendor {
            Vendor::Anthropic => Client::Anthropic(Anthropic::new(api_key)),
            Vendor::OpenAi => Client::OpenAi(OpenAi::new(api_key)),
        }
    }

    /// Create a client reading the vendor's conventional API key variable.
    pub fn from_env(vendor: Vendor) -> Result<Self, Error> {
        let var = vendor.api_key_env();
        let api_key = std::env::var(var).map_err(|_| Error::NoApiKey(var.to_string()))?;
        Ok(Self::new(vendor, api_key))
    }

    pub fn vendor(&self) -> Vendor {
        match self {
            Client::Anthropic(_) => Vendor::Anthropic,
            Client::OpenAi(_) => Vendor::OpenAi,
        }
    }

    /// Override the API base URL (for proxies and compatible servers).
    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        match self {
            Client::Anthropic(c) => Client::Anthropic(c.with_base_url(base_url)),
            Client::OpenAi(c) => Client::OpenAi(c.with_base_url(base_url)),
        }
    }

    /// Set the default model.
    pub fn with_model(self, model: impl Into<String>) -> Self {
        match self {
            Client::Anthropic(c) => Client::Anthropic(c.with_model(model)),
            Client::OpenAi(c) => Client::OpenAi(c.with_model(model)),
        }
    }

    /// Set the whole-request timeout of the underlying HTTP client.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match self {
            Client::Anthropic(c) => Client::Anthropic(c.with_timeout(timeout)),
            Client::OpenAi(c) => Client::OpenAi(c.with_timeout(timeout)),
        }
    }

    /// Default model of this client.
    pub fn model(&self) -> &str {
        match self {
            Client::Anthropic(c) => c.model(),
            Client::OpenAi(c) => c.model(),
        }
    }

    /// Send a completion request and return the full response.
    pub async fn complete(&self, request: Request) -> Result<Response, Error> {
        match self {
            Client::Anthropic(c) => c.complete(request).await,
            Client::OpenAi(c) => c.complete(request).await,
        }
    }

    /// Send a completion request and stream the response.
    pub async fn stream(&self, request: Request) -> Result<EventStream, Error> {
        match self {
            Client::Anthropic(c) => c.stream(request).await,
            Client::OpenAi(c) => c.stream(request).await,
        }
    }

    /// Cheap authenticated request proving the endpoint is reachable.
    pub async fn ping(&self) -> Result<(), Error> {
        match self {
            Client::Anthropic(c) => c.ping().await,
            Client::OpenAi(c) => c.ping().await,
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn default_http_client() -> reqwest::Client {
    http_client(REQUEST_TIMEOUT)
}

/// Turn a non-success HTTP response into an [`Error::Api`].
pub(crate) async fn api_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let retry_after = retry_after(response.headers());
    let message = response.text().await.unwrap_or_default();
    Error::Api {
        status,
        message,
        retry_after,
    }
}

/// Parse an integer-seconds `Retry-After` header.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// ============================================================================
// Public types
// ============================================================================

/// A completion request.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: Option<String>,
    pub max_tokens: usize,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
}

impl Request {
    /// Create a new request with the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            system: None,
            messages,
            temperature: None,
            stop_sequences: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A normalized completion response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub content: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    StopSequence,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::StopSequence => "stop_sequence",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(other) => other,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl Usage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// Events from a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start { id: String, model: String },
    TextDelta(String),
    Usage(Usage),
    Finish(FinishReason),
    Done,
    Ping,
    Error(String),
}

/// A boxed stream of [`StreamEvent`]s.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>;
