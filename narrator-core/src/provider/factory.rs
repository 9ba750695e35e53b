//! Builds providers from configuration, keyed by provider kind.

use super::{ClientProvider, Provider};
use crate::config::{ConfigError, ProviderConfig};
use llm_client::{Client, Vendor};
use std::collections::HashMap;
use std::sync::Arc;

/// Constructor for one provider kind.
pub type ProviderBuilder =
    Box<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> + Send + Sync>;

/// Registry of provider constructors.
///
/// [`ProviderFactory::with_defaults`] knows `anthropic` and `openai`; other
/// kinds (local servers, test doubles) are added with [`register`].
///
/// [`register`]: ProviderFactory::register
pub struct ProviderFactory {
    builders: HashMap<String, ProviderBuilder>,
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProviderFactory {
    /// A factory with no kinds registered.
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// A factory knowing the built-in vendor kinds.
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        factory.register("anthropic", |config| build_client(Vendor::Anthropic, config));
        factory.register("openai", |config| build_client(Vendor::OpenAi, config));
        factory
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, builder: F)
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> + Send + Sync + 'static,
    {
        self.builders
            .insert(kind.into().to_lowercase(), Box::new(builder));
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.builders.contains_key(&kind.to_lowercase())
    }

    pub fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> {
        let builder = self
            .builders
            .get(&config.kind.to_lowercase())
            .ok_or_else(|| ConfigError::UnknownProviderKind(config.kind.clone()))?;
        builder(config)
    }

    pub fn build_all(
        &self,
        configs: &[ProviderConfig],
    ) -> Result<Vec<Arc<dyn Provider>>, ConfigError> {
        configs.iter().map(|c| self.build(c)).collect()
    }
}

fn build_client(vendor: Vendor, config: &ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> {
    let env = config
        .api_key_env
        .clone()
        .unwrap_or_else(|| vendor.api_key_env().to_string());
    let api_key = std::env::var(&env).map_err(|_| ConfigError::MissingApiKey {
        provider: config.name.clone(),
        env: env.clone(),
    })?;

    let mut client = Client::new(vendor, api_key);
    if let Some(base_url) = &config.base_url {
        client = client.with_base_url(base_url.as_str());
    }
    if let Some(model) = &config.model {
        client = client.with_model(model.as_str());
    }

    Ok(Arc::new(ClientProvider::new(
        config.name.as_str(),
        client,
        config.timeout(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[test]
    fn test_unknown_kind() {
        let factory = ProviderFactory::with_defaults();
        let result = factory.build(&ProviderConfig::new("local", "llama"));
        assert!(matches!(result, Err(ConfigError::UnknownProviderKind(k)) if k == "llama"));
    }

    #[test]
    fn test_missing_api_key() {
        let factory = ProviderFactory::with_defaults();
        let config = ProviderConfig::new("primary", "anthropic")
            .with_api_key_env("NARRATOR_TEST_KEY_THAT_IS_NEVER_SET");
        let result = factory.build(&config);
        assert!(matches!(result, Err(ConfigError::MissingApiKey { provider, .. }) if provider == "primary"));
    }

    #[test]
    fn test_custom_kind() {
        let mut factory = ProviderFactory::empty();
        assert!(!factory.knows("scripted"));
        factory.register("Scripted", |config| {
            Ok(Arc::new(ScriptedProvider::new(config.name.as_str())) as Arc<dyn Provider>)
        });
        assert!(factory.knows("scripted"));

        let provider = factory
            .build(&ProviderConfig::new("stub", "SCRIPTED"))
            .unwrap();
        assert_eq!(provider.name(), "stub");
    }
}
