//! OpenAI-compatible Chat Completions API.

use crate::sse;
use crate::{
    api_error, default_http_client, http_client, Error, EventStream, FinishReason, Request,
    Response, StreamEvent, Usage, Vendor,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat Completions client. Works against any server speaking the same shape.
#[derive(Clone)]
pub struct OpenAi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: default_http_client(),
            api_key: api_key.into(),
            base_url: Vendor::OpenAi.default_base_url().to_string(),
            model: Vendor::OpenAi.default_model().to_string(),
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

    pub async fn complete(&self, request: Request) -> Result<Response, Error> {
        let response = self.post(&request, false).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        parse_response(api_response)
    }

    pub async fn stream(&self, request: Request) -> Result<EventStream, Error> {
        let response = self.post(&request, true).await?;
        Ok(sse::event_stream(response, convert_stream_data))
    }

    /// Lists models; cheaper than a generation and needs the same key.
    pub async fn ping(&self) -> Result<(), Error> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .headers(self.build_headers()?)
            .send()
            .await
            .map_err(Error::from_reqwest)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    async fn post(&self, request: &Request, stream: bool) -> Result<reqwest::Response, Error> {
        let api_request = self.build_api_request(request, stream);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.build_headers()?)
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
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
        );
        Ok(headers)
    }

    fn build_api_request<'a>(&'a self, request: &'a Request, stream: bool) -> ApiRequest<'a> {
        // The system prompt travels as the first message.
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system.as_deref() {
            messages.push(ApiMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|m| ApiMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        ApiRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: (!request.stop_sequences.is_empty())
                .then_some(request.stop_sequences.as_slice()),
            stream,
            stream_options: stream.then_some(ApiStreamOptions {
                include_usage: true,
            }),
        }
    }
}

fn parse_response(api_response: ApiResponse) -> Result<Response, Error> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Parse("response has no choices".to_string()))?;

    Ok(Response {
        id: api_response.id,
        model: api_response.model,
        content: choice.message.content.unwrap_or_default(),
        usage: api_response.usage.map(Usage::from).unwrap_or_default(),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(finish_reason)
            .unwrap_or(FinishReason::Stop),
    })
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn convert_stream_data(data: &str) -> Vec<Result<StreamEvent, Error>> {
    if data == "[DONE]" {
        return vec![Ok(StreamEvent::Done)];
    }

    let chunk = match serde_json::from_str::<ApiChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => return vec![Err(Error::Parse(format!("SSE parse error: {e}")))],
    };

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            events.push(Ok(StreamEvent::TextDelta(text)));
        }
        if let Some(reason) = choice.finish_reason {
            events.push(Ok(StreamEvent::Finish(finish_reason(&reason))));
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(Ok(StreamEvent::Usage(usage.into())));
    }
    events
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<ApiStreamOptions>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

impl From<ApiUsage> for Usage {
    fn from(usage: ApiUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiChunk {
    #[serde(default)]
    choices: Vec<ApiChunkChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChunkChoice {
    #[serde(default)]
    delta: ApiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDelta {
    content: Option<String>,
}
