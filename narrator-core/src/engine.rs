//! The engine facade: everything wired from one [`EngineConfig`].

use crate::config::{ConfigError, EngineConfig};
use crate::memory::{LlmSummarizer, Summarizer, VectorIndex, WorldMemory};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::persist::{InMemoryStore, SessionStore};
use crate::pipeline::ReasoningPipeline;
use crate::provider::{PricingModel, PricingTable, Provider, ProviderFactory, ProviderManager};
use crate::rules::{RuleRegistry, RuleSet};
use crate::scheduler::{SchedulerError, TurnScheduler};
use crate::session::Session;
use std::sync::Arc;
use tracing::info;

/// A running narrative engine.
///
/// Sessions are opened against a registered rule set, then driven through
/// the [`TurnScheduler`].
pub struct Engine {
    config: EngineConfig,
    scheduler: TurnScheduler,
    providers: Arc<ProviderManager>,
    memory: Arc<WorldMemory>,
    rules: Arc<RuleRegistry>,
    store: Arc<dyn SessionStore>,
}

impl Engine {
    /// Build providers from `config.providers` with `factory` and wire an
    /// engine around them with an in-memory store and no metrics.
    pub fn from_config(config: EngineConfig, factory: &ProviderFactory) -> Result<Self, ConfigError> {
        EngineBuilder::from_config(config, factory)?.build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    pub fn memory(&self) -> &Arc<WorldMemory> {
        &self.memory
    }

    pub fn providers(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Register (or replace) a rule set.
    pub fn register_rules(&self, rules_ref: impl Into<String>, rules: RuleSet) {
        self.rules.insert(rules_ref, rules);
    }

    /// Create an active session governed by `rules_ref` and persist it.
    pub async fn open_session(&self, rules_ref: &str) -> Result<Session, SchedulerError> {
        if !self.rules.contains(rules_ref) {
            return Err(SchedulerError::MissingRules(rules_ref.to_string()));
        }
        let session = Session::new(rules_ref);
        self.store.save_session(&session).await?;
        self.scheduler.register_session(session.clone());
        info!(session = %session.id, rules = rules_ref, "Session opened");
        Ok(session)
    }
}

/// Assembles an [`Engine`] from a configuration and injected collaborators.
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new(EngineConfig::new(ConsistencyMode::Strict))
///     .with_provider(Arc::new(my_provider))
///     .with_store(Arc::new(JsonDirStore::new("saves")))
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    providers: Vec<Arc<dyn Provider>>,
    pricing: Vec<(String, Arc<dyn PricingModel>)>,
    store: Option<Arc<dyn SessionStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    vector_index: Option<Arc<dyn VectorIndex>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            pricing: Vec::new(),
            store: None,
            metrics: None,
            vector_index: None,
            summarizer: None,
        }
    }

    /// A builder holding the providers and flat prices named in `config`.
    pub fn from_config(config: EngineConfig, factory: &ProviderFactory) -> Result<Self, ConfigError> {
        config.validate()?;
        let providers = factory.build_all(&config.providers)?;
        let pricing = config
            .providers
            .iter()
            .filter_map(|p| {
                p.pricing.clone().map(|price| {
                    (p.name.clone(), Arc::new(PricingTable::flat(price)) as Arc<dyn PricingModel>)
                })
            })
            .collect();

        let mut builder = Self::new(config).with_providers(providers);
        builder.pricing = pricing;
        Ok(builder)
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn Provider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    pub fn with_pricing(mut self, provider: impl Into<String>, pricing: Arc<dyn PricingModel>) -> Self {
        self.pricing.push((provider.into(), pricing));
        self
    }

    /// Defaults to an [`InMemoryStore`].
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector_index = Some(index);
        self
    }

    /// Overrides the summarizer chosen by `memory.llm_summaries`.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("no providers configured".to_string()));
        }

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        let mut manager = ProviderManager::new(self.providers, &self.config)?.with_metrics(metrics.clone());
        for (name, pricing) in self.pricing {
            manager = manager.with_pricing(name, pricing);
        }
        let providers = Arc::new(manager);

        let mut memory = WorldMemory::new(&self.config.memory);
        if let Some(index) = self.vector_index {
            memory = memory.with_vector_index(index);
        }
        match self.summarizer {
            Some(summarizer) => memory = memory.with_summarizer(summarizer),
            None if self.config.memory.llm_summaries => {
                memory = memory.with_summarizer(Arc::new(LlmSummarizer::new(providers.clone())));
            }
            None => {}
        }
        let memory = Arc::new(memory);

        let pipeline = ReasoningPipeline::new(&self.config, providers.clone(), memory.clone())
            .with_metrics(metrics.clone());
        let rules = Arc::new(RuleRegistry::new());
        let scheduler = TurnScheduler::new(
            &self.config.scheduler,
            Arc::new(pipeline),
            store.clone(),
            rules.clone(),
            metrics,
        );

        info!(
            providers = ?providers.order(),
            max_concurrent_turns = self.config.scheduler.max_concurrent_turns,
            mode = ?self.config.consistency.mode,
            "Engine ready"
        );

        Ok(Engine {
            config: self.config,
            scheduler,
            providers,
            memory,
            rules,
            store,
        })
    }
}
