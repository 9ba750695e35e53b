//! Testing utilities for exercising the engine without a real LLM.
//!
//! [`ScriptedProvider`] replays scripted replies and errors and counts
//! calls. [`TestHarness`] wires a complete engine around scripted
//! providers with an in-memory store and recording metrics.

use crate::config::{ConsistencyMode, EngineConfig};
use crate::engine::{Engine, EngineBuilder};
use crate::id::{SessionId, TurnId};
use crate::persist::InMemoryStore;
use crate::provider::{ChunkStream, Provider, ProviderError, ProviderReply, ProviderRequest, TokenUsage};
use crate::rules::RuleSet;
use crate::scheduler::SchedulerError;
use crate::turn::{Turn, TurnRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub use crate::metrics::{MetricEvent, RecordingMetrics};

/// Reply used when nothing else is scripted.
pub const DEFAULT_REPLY: &str = "The story continues.";

/// One scripted call outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(ProviderError),
    /// Panic inside the provider call.
    Panic(String),
}

/// A provider that follows a script.
///
/// Scripted steps are consumed one per call; once they run out every call
/// gets the fallback (a reply, or a permanent error).
///
/// # Example
///
/// ```ignore
/// let provider = ScriptedProvider::new("primary")
///     .fail(ProviderError::Timeout)
///     .reply("The gate opens.")
///     .otherwise("Nothing happens.");
/// ```
pub struct ScriptedProvider {
    name: String,
    model: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Option<Duration>,
    usage: TokenUsage,
    gate: Option<Arc<Semaphore>>,
    fail_probes: AtomicBool,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "scripted-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Reply(DEFAULT_REPLY.to_string()),
            delay: None,
            usage: TokenUsage::default(),
            gate: None,
            fail_probes: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for the next unscripted call.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.step(Step::Reply(text.into()))
    }

    /// Queue a failure for the next unscripted call.
    pub fn fail(self, error: ProviderError) -> Self {
        self.step(Step::Fail(error))
    }

    /// Queue a panic for the next unscripted call.
    pub fn panic(self, message: impl Into<String>) -> Self {
        self.step(Step::Panic(message.into()))
    }

    pub fn step(self, step: Step) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Reply to every call once the script runs out.
    pub fn otherwise(mut self, text: impl Into<String>) -> Self {
        self.fallback = Step::Reply(text.into());
        self
    }

    /// Fail every call once the script runs out.
    pub fn always_fail(mut self, error: ProviderError) -> Self {
        self.fallback = Step::Fail(error);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, input_tokens: usize, output_tokens: usize) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    /// Hold every call until a permit is added to the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Make health probes fail (or succeed again).
    pub fn set_probe_failure(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Number of generate and stream calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    async fn next(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());

        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(ProviderError::Transport("gate closed".to_string())),
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Reply(text) => Ok(text),
            Step::Fail(error) => Err(error),
            Step::Panic(message) => panic!("{message}"),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let text = self.next(request).await?;
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        Ok(ProviderReply::new(text, model)
            .with_usage(self.usage.input_tokens, self.usage.output_tokens))
    }

    async fn generate_stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let text = self.next(request).await?;
        let chunks: Vec<Result<String, ProviderError>> = text
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn health(&self) -> Result<(), ProviderError> {
        if self.fail_probes.load(Ordering::SeqCst) {
            Err(ProviderError::Transport("probe failed".to_string()))
        } else {
            Ok(())
        }
    }
}

/// A complete engine around scripted providers.
///
/// # Example
///
/// ```ignore
/// let harness = TestHarness::new(vec![ScriptedProvider::new("p").otherwise("Rain falls.")]);
/// let session = harness.open_session(RuleSet::new("No magic.")).await;
/// let turn = harness.play(session, "I look up").await;
/// assert_eq!(turn.narrative.as_deref(), Some("Rain falls."));
/// ```
pub struct TestHarness {
    pub engine: Engine,
    pub providers: Vec<Arc<ScriptedProvider>>,
    pub metrics: Arc<RecordingMetrics>,
    pub store: Arc<InMemoryStore>,
}

impl TestHarness {
    /// Lenient mode with fast backoff.
    pub fn new(providers: Vec<ScriptedProvider>) -> Self {
        Self::with_config(providers, Self::config())
    }

    /// The configuration [`new`](Self::new) uses, for tweaking.
    pub fn config() -> EngineConfig {
        EngineConfig::new(ConsistencyMode::Lenient)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    pub fn with_config(providers: Vec<ScriptedProvider>, config: EngineConfig) -> Self {
        Self::with_builder(providers, config, |builder| builder)
    }

    /// Like [`with_config`](Self::with_config), with a last say over the
    /// builder, e.g. to plug in a vector index.
    pub fn with_builder(
        providers: Vec<ScriptedProvider>,
        config: EngineConfig,
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        let providers: Vec<Arc<ScriptedProvider>> = providers.into_iter().map(Arc::new).collect();
        let metrics = Arc::new(RecordingMetrics::new());
        let store = Arc::new(InMemoryStore::new());

        let builder = EngineBuilder::new(config)
            .with_providers(
                providers
                    .iter()
                    .map(|p| p.clone() as Arc<dyn Provider>)
                    .collect(),
            )
            .with_store(store.clone())
            .with_metrics(metrics.clone());
        let engine = customize(builder)
            .build()
            .unwrap_or_else(|e| panic!("test engine failed to build: {e}"));

        Self {
            engine,
            providers,
            metrics,
            store,
        }
    }

    pub fn provider(&self, index: usize) -> &ScriptedProvider {
        &self.providers[index]
    }

    /// Register `rules` under a fresh key and open an active session on them.
    pub async fn open_session(&self, rules: RuleSet) -> SessionId {
        let rules_ref = format!("rules-{}", self.engine.rules().len() + 1);
        self.engine.register_rules(rules_ref.as_str(), rules);
        self.engine
            .open_session(&rules_ref)
            .await
            .unwrap_or_else(|e| panic!("failed to open session: {e}"))
            .id
    }

    pub async fn submit(&self, session: SessionId, input: &str) -> Result<TurnId, SchedulerError> {
        self.engine
            .scheduler()
            .submit(TurnRequest::new(session, input))
            .await
    }

    /// Submit a turn and wait for it to finish.
    pub async fn play(&self, session: SessionId, input: &str) -> Turn {
        let id = self
            .submit(session, input)
            .await
            .unwrap_or_else(|e| panic!("submit failed: {e}"));
        self.wait(id).await
    }

    pub async fn wait(&self, id: TurnId) -> Turn {
        self.engine
            .scheduler()
            .wait(id)
            .await
            .unwrap_or_else(|e| panic!("wait failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request(prompt: &str) -> ProviderRequest {
        crate::provider::GenerateOptions::default().request(prompt)
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let provider = ScriptedProvider::new("p")
            .fail(ProviderError::Timeout)
            .reply("first")
            .otherwise("rest");

        assert_eq!(
            provider.generate(&request("a")).await.unwrap_err(),
            ProviderError::Timeout
        );
        assert_eq!(provider.generate(&request("b")).await.unwrap().content, "first");
        assert_eq!(provider.generate(&request("c")).await.unwrap().content, "rest");
        assert_eq!(provider.generate(&request("d")).await.unwrap().content, "rest");
        assert_eq!(provider.calls(), 4);
        assert_eq!(provider.prompts(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_stream_chunks_concatenate() {
        let provider = ScriptedProvider::new("p").otherwise("one two three");
        let stream = provider.generate_stream(&request("x")).await.unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["one ", "two ", "three"]);
    }

    #[tokio::test]
    async fn test_probe_failure_toggle() {
        let provider = ScriptedProvider::new("p");
        assert!(provider.health().await.is_ok());
        provider.set_probe_failure(true);
        assert!(provider.health().await.is_err());
    }
}
