//! Ordered providers with retry, fallback, health and cost accounting.

use super::health::{HealthState, Transition};
use super::pricing::PricingModel;
use super::{
    backoff_delay, Attempt, ChunkStream, GenerateError, GenerateOptions, HealthSnapshot,
    LlmResponse, Provider, ProviderError, ProviderFailure, ProviderMetadata, ProviderReply,
    ProviderRequest,
};
use crate::cache::TtlCache;
use crate::config::{ConfigError, EngineConfig, HealthConfig, RetryConfig};
use crate::metrics::{MetricsSink, NoopMetrics};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Routes generations across providers.
///
/// Providers are tried in `fallback_order`; those whose rolling success
/// rate has dropped below the threshold go to the back until a probe
/// succeeds. Generations probe such providers once per
/// `health.probe_interval_secs`. Each provider gets up to `max_attempts`
/// attempts for retryable failures before the next one is tried.
pub struct ProviderManager {
    /// In fallback order.
    providers: Vec<Arc<dyn Provider>>,
    pricing: HashMap<String, Arc<dyn PricingModel>>,
    health: RwLock<HashMap<String, HealthState>>,
    retry: RetryConfig,
    health_config: HealthConfig,
    cache: Option<Mutex<TtlCache<u64, LlmResponse>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ProviderManager {
    /// Create a manager over `providers` (registration order) using the
    /// retry, health, fallback and cache settings of `config`.
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        config: &EngineConfig,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.name().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider '{}'",
                    provider.name()
                )));
            }
        }

        let mut ordered = Vec::with_capacity(providers.len());
        for name in &config.fallback_order {
            let provider = providers
                .iter()
                .find(|p| p.name() == name.as_str())
                .ok_or_else(|| {
                    ConfigError::Invalid(format!("fallback_order names unknown provider '{name}'"))
                })?;
            if !ordered
                .iter()
                .any(|p: &Arc<dyn Provider>| p.name() == name.as_str())
            {
                ordered.push(provider.clone());
            }
        }
        // Anything not named in fallback_order is tried last, in registration order.
        for provider in &providers {
            if !ordered.iter().any(|p| p.name() == provider.name()) {
                ordered.push(provider.clone());
            }
        }

        let health = ordered
            .iter()
            .map(|p| (p.name().to_string(), HealthState::new()))
            .collect();

        let cache = config.response_cache.enabled.then(|| {
            Mutex::new(TtlCache::new(
                config.response_cache.capacity,
                Duration::from_secs(config.response_cache.ttl_secs),
            ))
        });

        Ok(Self {
            providers: ordered,
            pricing: HashMap::new(),
            health: RwLock::new(health),
            retry: config.retry.clone(),
            health_config: config.health.clone(),
            cache,
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Attach a pricing model to a provider.
    pub fn with_pricing(
        mut self,
        provider: impl Into<String>,
        pricing: Arc<dyn PricingModel>,
    ) -> Self {
        self.pricing.insert(provider.into(), pricing);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Provider names in the order the next call will try them.
    pub fn order(&self) -> Vec<String> {
        self.ordered().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn health(&self, name: &str) -> Option<HealthSnapshot> {
        self.health.read().get(name).map(|h| h.snapshot(name))
    }

    pub fn health_all(&self) -> Vec<HealthSnapshot> {
        let health = self.health.read();
        self.providers
            .iter()
            .filter_map(|p| health.get(p.name()).map(|h| h.snapshot(p.name())))
            .collect()
    }

    /// Generate a complete response.
    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, GenerateError> {
        if self.providers.is_empty() {
            return Err(GenerateError::NoProviders);
        }

        let cache_key = options
            .is_deterministic()
            .then(|| cache_key(prompt, options));
        if let Some(hit) = cache_key.and_then(|key| self.cached(key)) {
            debug!(provider = %hit.metadata.provider, "serving response from cache");
            return Ok(hit);
        }
        self.probe_demoted().await;

        let request = options.request(prompt);
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut failures = Vec::new();

        for provider in self.ordered() {
            let timeout = options.timeout.unwrap_or_else(|| provider.default_timeout());
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                attempts += 1;
                let result = self
                    .call(provider.as_ref(), timeout, provider.generate(&request))
                    .await;

                match Attempt::classify(result) {
                    Attempt::Ok(reply) => {
                        let response = self.finish(provider.name(), reply, attempts, started);
                        if let Some(key) = cache_key {
                            self.remember(key, &response);
                        }
                        return Ok(response);
                    }
                    Attempt::Retry(error) if attempt < self.retry.max_attempts => {
                        self.back_off(provider.name(), attempt, &error).await;
                    }
                    Attempt::Retry(error) | Attempt::Fallthrough(error) => {
                        warn!(provider = provider.name(), attempt, %error, "falling through to next provider");
                        failures.push(ProviderFailure {
                            provider: provider.name().to_string(),
                            error,
                        });
                        break;
                    }
                    Attempt::Fatal(error) => {
                        return Err(GenerateError::Configuration {
                            provider: provider.name().to_string(),
                            message: error.to_string(),
                        });
                    }
                }
            }
        }

        Err(GenerateError::AllProvidersExhausted(failures))
    }

    /// Generate a streamed response.
    ///
    /// Retry and fallback apply until the first chunk arrives; after that the
    /// stream belongs to the provider that produced it and errors are passed
    /// through to the caller.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ChunkStream, GenerateError> {
        if self.providers.is_empty() {
            return Err(GenerateError::NoProviders);
        }

        self.probe_demoted().await;
        let request = options.request(prompt);
        let mut failures = Vec::new();

        for provider in self.ordered() {
            let timeout = options.timeout.unwrap_or_else(|| provider.default_timeout());
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                let result = self
                    .call(provider.as_ref(), timeout, open_stream(provider.as_ref(), &request))
                    .await;

                match Attempt::classify(result) {
                    Attempt::Ok(stream) => {
                        debug!(provider = provider.name(), attempt, "stream opened");
                        return Ok(stream);
                    }
                    Attempt::Retry(error) if attempt < self.retry.max_attempts => {
                        self.back_off(provider.name(), attempt, &error).await;
                    }
                    Attempt::Retry(error) | Attempt::Fallthrough(error) => {
                        warn!(provider = provider.name(), attempt, %error, "falling through to next provider");
                        failures.push(ProviderFailure {
                            provider: provider.name().to_string(),
                            error,
                        });
                        break;
                    }
                    Attempt::Fatal(error) => {
                        return Err(GenerateError::Configuration {
                            provider: provider.name().to_string(),
                            message: error.to_string(),
                        });
                    }
                }
            }
        }

        Err(GenerateError::AllProvidersExhausted(failures))
    }

    /// Run one provider's health probe. Success restores a deprioritized
    /// provider to its configured position.
    pub async fn probe(&self, name: &str) -> Result<(), ProviderError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| ProviderError::Configuration(format!("unknown provider '{name}'")))?;

        let result = match tokio::time::timeout(provider.default_timeout(), provider.health()).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        match &result {
            Ok(()) => {
                let restored = self
                    .health
                    .write()
                    .get_mut(name)
                    .map(|h| h.restore())
                    .unwrap_or(false);
                if restored {
                    info!(provider = name, "probe succeeded, provider restored");
                }
            }
            Err(error) => debug!(provider = name, %error, "probe failed"),
        }
        result
    }

    /// Probe every provider concurrently.
    pub async fn probe_all(&self) -> Vec<(String, Result<(), ProviderError>)> {
        let probes = self.providers.iter().map(|p| async move {
            let name = p.name().to_string();
            let result = self.probe(&name).await;
            (name, result)
        });
        futures::future::join_all(probes).await
    }

    /// Probe deprioritized providers whose probe interval has elapsed.
    async fn probe_demoted(&self) {
        let interval = self.health_config.probe_interval();
        let due: Vec<String> = self
            .health
            .write()
            .iter_mut()
            .filter_map(|(name, h)| h.claim_probe(interval).then(|| name.clone()))
            .collect();
        for name in due {
            // Failures are logged by probe and leave the provider demoted.
            let _ = self.probe(&name).await;
        }
    }

    fn ordered(&self) -> Vec<Arc<dyn Provider>> {
        let health = self.health.read();
        let (healthy, demoted): (Vec<_>, Vec<_>) = self.providers.iter().cloned().partition(|p| {
            !health
                .get(p.name())
                .map(|h| h.is_deprioritized())
                .unwrap_or(false)
        });
        healthy.into_iter().chain(demoted).collect()
    }

    /// Run one attempt under `timeout` and record its outcome.
    async fn call<T, F>(
        &self,
        provider: &dyn Provider,
        timeout: Duration,
        attempt: F,
    ) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };
        let latency = start.elapsed();

        let error = result.as_ref().err().map(|e| e.to_string());
        self.metrics
            .provider_call(provider.name(), error.is_none(), latency);

        let transition = self.health.write().get_mut(provider.name()).map(|h| {
            h.record(&self.health_config, error.is_none(), latency, error.clone())
        });
        if transition == Some(Transition::Deprioritized) {
            warn!(provider = provider.name(), "success rate below threshold, deprioritizing provider");
        }

        result
    }

    async fn back_off(&self, provider: &str, attempt: u32, error: &ProviderError) {
        let delay = backoff_delay(
            attempt,
            self.retry.backoff_base(),
            self.retry.backoff_max(),
            error.retry_after(),
        );
        debug!(provider, attempt, ?delay, %error, "retrying provider");
        tokio::time::sleep(delay).await;
    }

    fn finish(
        &self,
        provider: &str,
        reply: ProviderReply,
        attempts: u32,
        started: Instant,
    ) -> LlmResponse {
        let cost = match self
            .pricing
            .get(provider)
            .and_then(|p| p.cost(&reply.model, &reply.usage))
        {
            Some(cost) => cost,
            None => {
                warn!(provider, model = %reply.model, "no pricing for model, recording zero cost");
                0.0
            }
        };

        LlmResponse {
            content: reply.content,
            model: reply.model,
            usage: reply.usage,
            cost,
            metadata: ProviderMetadata {
                provider: provider.to_string(),
                attempts,
                finish_reason: reply.finish_reason,
                latency_ms: started.elapsed().as_millis() as u64,
                cached: false,
            },
        }
    }

    fn cached(&self, key: u64) -> Option<LlmResponse> {
        let mut hit = self.cache.as_ref()?.lock().get(&key)?;
        hit.metadata.cached = true;
        hit.metadata.attempts = 0;
        hit.metadata.latency_ms = 0;
        Some(hit)
    }

    fn remember(&self, key: u64, response: &LlmResponse) {
        if let Some(cache) = &self.cache {
            cache.lock().insert(key, response.clone());
        }
    }
}

/// Open a stream and wait for its first chunk, so failures before any text
/// arrives still count as a failed attempt.
async fn open_stream(
    provider: &dyn Provider,
    request: &ProviderRequest,
) -> Result<ChunkStream, ProviderError> {
    let mut stream = provider.generate_stream(request).await?;
    match stream.next().await {
        Some(Ok(first)) => {
            let head = futures::stream::once(async move { Ok(first) });
            Ok(Box::pin(head.chain(stream)))
        }
        Some(Err(error)) => Err(error),
        None => Ok(Box::pin(futures::stream::empty())),
    }
}

fn cache_key(prompt: &str, options: &GenerateOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    prompt.hash(&mut hasher);
    options.system.hash(&mut hasher);
    options.model.hash(&mut hasher);
    options.max_tokens.hash(&mut hasher);
    options.stop.hash(&mut hasher);
    hasher.finish()
}
