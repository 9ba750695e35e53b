//! [`Provider`] over the vendor clients in `llm-client`.

use super::{ChunkStream, Provider, ProviderError, ProviderReply, ProviderRequest, TokenUsage};
use async_trait::async_trait;
use futures::StreamExt;
use llm_client::{Client, Message, Request, StreamEvent};
use std::time::Duration;

/// A named provider backed by an HTTP client.
pub struct ClientProvider {
    name: String,
    client: Client,
    timeout: Duration,
}

impl ClientProvider {
    pub fn new(name: impl Into<String>, client: Client, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            // The manager enforces `timeout`; the HTTP layer gets a little
            // slack so the manager's deadline fires first.
            client: client.with_timeout(timeout + Duration::from_secs(5)),
            timeout,
        }
    }

    fn build_request(&self, request: &ProviderRequest) -> Request {
        let mut api_request = Request::new(vec![Message::user(request.prompt.as_str())])
            .with_max_tokens(request.max_tokens);
        if let Some(system) = &request.system {
            api_request = api_request.with_system(system.as_str());
        }
        if let Some(model) = &request.model {
            api_request = api_request.with_model(model.as_str());
        }
        if let Some(temperature) = request.temperature {
            api_request = api_request.with_temperature(temperature);
        }
        for stop in &request.stop {
            api_request = api_request.with_stop_sequence(stop.as_str());
        }
        api_request
    }
}

#[async_trait]
impl Provider for ClientProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let response = self
            .client
            .complete(self.build_request(request))
            .await
            .map_err(map_error)?;

        Ok(ProviderReply {
            content: response.content,
            model: response.model,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
            finish_reason: response.finish_reason.as_str().to_string(),
        })
    }

    async fn generate_stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let events = self
            .client
            .stream(self.build_request(request))
            .await
            .map_err(map_error)?;

        let chunks = events.filter_map(|event| async move {
            match event {
                Ok(StreamEvent::TextDelta(text)) => Some(Ok(text)),
                Ok(StreamEvent::Error(message)) => Some(Err(ProviderError::Transport(message))),
                Ok(_) => None,
                Err(e) => Some(Err(map_error(e))),
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn health(&self) -> Result<(), ProviderError> {
        self.client.ping().await.map_err(map_error)
    }
}

/// Map client errors onto the retry taxonomy.
fn map_error(error: llm_client::Error) -> ProviderError {
    match error {
        llm_client::Error::Timeout => ProviderError::Timeout,
        llm_client::Error::Network(message) => ProviderError::Transport(message),
        llm_client::Error::Api {
            status: 429,
            retry_after,
            ..
        } => ProviderError::RateLimited { retry_after },
        llm_client::Error::Api {
            status, message, ..
        } => ProviderError::from_status(status, message),
        llm_client::Error::Parse(message) => ProviderError::MalformedResponse(message),
        llm_client::Error::NoApiKey(var) => {
            ProviderError::Configuration(format!("API key not set: {var}"))
        }
        llm_client::Error::Config(message) => ProviderError::Configuration(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_client::Vendor;

    #[test]
    fn test_error_mapping() {
        let rate_limited = map_error(llm_client::Error::Api {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(3)),
        });
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(3)));
        assert!(rate_limited.is_retryable());

        assert!(map_error(llm_client::Error::Network("reset".into())).is_retryable());
        assert!(map_error(llm_client::Error::Timeout).is_retryable());
        assert!(!map_error(llm_client::Error::Parse("bad json".into())).is_retryable());
        assert!(matches!(
            map_error(llm_client::Error::Api {
                status: 401,
                message: "nope".into(),
                retry_after: None
            }),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            map_error(llm_client::Error::Config("bad header".into())),
            ProviderError::Configuration(_)
        ));
    }

    #[test]
    fn test_build_request() {
        let provider = ClientProvider::new(
            "primary",
            Client::new(Vendor::OpenAi, "key"),
            Duration::from_secs(30),
        );
        let request = provider.build_request(&ProviderRequest {
            prompt: "Look around".into(),
            system: Some("Narrate".into()),
            model: None,
            temperature: Some(0.0),
            max_tokens: 256,
            stop: vec!["END".into()],
        });

        assert_eq!(request.messages, vec![Message::user("Look around")]);
        assert_eq!(request.system.as_deref(), Some("Narrate"));
        assert_eq!(request.max_tokens, 256);
        assert_eq!(request.stop_sequences, vec!["END".to_string()]);
        assert_eq!(provider.default_timeout(), Duration::from_secs(30));
    }
}
