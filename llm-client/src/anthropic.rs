//! Anthropic Messages API.

use crate::sse;
use crate::{
    api_error, default_http_client, http_client, Error, EventStream, FinishReason, Request,
    Response, StreamEvent, Usage, Vendor,
};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
#[derive(Clone)]
pub struct Anthropic {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl Anthropic {
    /// Create a new client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: default_http_client(),
            api_key: api_key.into(),
            base_url: Vendor::Anthropic.default_base_url().to_string(),
            model: Vendor::Anthropic.default_model().to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a completion request and return the full response.
    pub async fn complete(&self, request: Request) -> Result<Response, Error> {
        let response = self.post(&request, false).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(parse_response(api_response))
    }

    /// Send a completion request and stream the response.
    pub async fn stream(&self, request: Request) -> Result<EventStream, Error> {
        let response = self.post(&request, true).await?;
        Ok(sse::event_stream(response, convert_stream_data))
    }

    /// The smallest possible generation; proves auth and reachability.
    pub async fn ping(&self) -> Result<(), Error> {
        let request = Request::new(vec![crate::Message::user("ping")]).with_max_tokens(1);
        self.post(&request, false).await.map(|_| ())
    }

    async fn post(&self, request: &Request, stream: bool) -> Result<reqwest::Response, Error> {
        let api_request = self.build_api_request(request, stream);
        let headers = self.build_headers()?;

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(Error::from_reqwest)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response)
    }

    fn build_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }

    fn build_api_request<'a>(&'a self, request: &'a Request, stream: bool) -> ApiRequest<'a> {
        ApiRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            stop_sequences: (!request.stop_sequences.is_empty())
                .then_some(request.stop_sequences.as_slice()),
            stream,
        }
    }
}

fn parse_response(api_response: ApiResponse) -> Response {
    let content = api_response
        .content
        .into_iter()
        .filter_map(|c| match c {
            ApiContent::Text { text } => Some(text),
            ApiContent::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");

    Response {
        id: api_response.id,
        model: api_response.model,
        content,
        usage: Usage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        },
        finish_reason: api_response
            .stop_reason
            .as_deref()
            .map(finish_reason)
            .unwrap_or(FinishReason::Stop),
    }
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "end_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "stop_sequence" => FinishReason::StopSequence,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn convert_stream_data(data: &str) -> Vec<Result<StreamEvent, Error>> {
    let event = match serde_json::from_str::<ApiStreamEvent>(data) {
        Ok(event) => event,
        Err(e) => return vec![Err(Error::Parse(format!("SSE parse error: {e}")))],
    };

    match event {
        ApiStreamEvent::MessageStart { message } => vec![
            Ok(StreamEvent::Start {
                id: message.id,
                model: message.model,
            }),
            Ok(StreamEvent::Usage(Usage {
                input_tokens: message.usage.input_tokens,
                output_tokens: message.usage.output_tokens,
            })),
        ],
        ApiStreamEvent::ContentBlockDelta { delta } => match delta {
            ApiDelta::TextDelta { text } => vec![Ok(StreamEvent::TextDelta(text))],
            ApiDelta::Other => Vec::new(),
        },
        ApiStreamEvent::MessageDelta { delta, usage } => {
            let mut events = Vec::new();
            if let Some(usage) = usage {
                events.push(Ok(StreamEvent::Usage(Usage {
                    input_tokens: 0,
                    output_tokens: usage.output_tokens,
                })));
            }
            if let Some(reason) = delta.stop_reason {
                events.push(Ok(StreamEvent::Finish(finish_reason(&reason))));
            }
            events
        }
        ApiStreamEvent::MessageStop => vec![Ok(StreamEvent::Done)],
        ApiStreamEvent::Ping => vec![Ok(StreamEvent::Ping)],
        ApiStreamEvent::Error { error } => vec![Ok(StreamEvent::Error(error.message))],
        ApiStreamEvent::ContentBlockStart | ApiStreamEvent::ContentBlockStop => Vec::new(),
    }
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ApiContent>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContent {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStreamEvent {
    MessageStart {
        message: ApiMessageStart,
    },
    ContentBlockStart,
    ContentBlockDelta {
        delta: ApiDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: ApiMessageDelta,
        #[serde(default)]
        usage: Option<ApiUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
}

#[derive(Debug, Deserialize)]
struct ApiMessageStart {
    id: String,
    model: String,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}
