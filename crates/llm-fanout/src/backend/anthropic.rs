//! AnthropicBackend - Messages API backend with SSE streaming.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_fanout::backend::{AnthropicBackend, LlmBackend};
//! use llm_fanout::schema::SchemaDescriptor;
//! use llm_fanout::template::ModelParameters;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // From environment variable (ANTHROPIC_API_KEY)
//! let backend = AnthropicBackend::try_from_env()?
//!     .with_system("Answer with JSON only.");
//!
//! let params = ModelParameters::new("claude-sonnet-4-5", 0.2, 1024);
//! let payload = backend
//!     .call("List three calming herbs.", &params, &SchemaDescriptor::any())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use super::sse::{SseDecoder, SseEvent};
use super::{BackendError, FragmentStream, LlmBackend, prompt_with_schema};
use crate::extract::parse_json_payload;
use crate::schema::SchemaDescriptor;
use crate::template::ModelParameters;
use async_trait::async_trait;
use futures::{StreamExt, stream};
use reqwest::{Client, StatusCode, header::HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::env;
use std::time::Duration;
use tracing::{debug, warn};

const BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Backend that talks to the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    base_url: String,
    /// Overrides the template's `config.model` when set.
    model_override: Option<String>,
    system: Option<String>,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: BASE_URL.to_string(),
            model_override: None,
            system: None,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// - `ANTHROPIC_API_KEY` (required)
    /// - `ANTHROPIC_MODEL` (optional, overrides every template's model)
    pub fn try_from_env() -> Result<Self, BackendError> {
        let api_key = env::var("ANTHROPIC_API_KEY").map_err(|_| {
            BackendError::fatal("ANTHROPIC_API_KEY environment variable not set")
        })?;

        let mut backend = Self::new(api_key);
        if let Ok(model) = env::var("ANTHROPIC_MODEL")
            && !model.trim().is_empty()
        {
            backend.model_override = Some(model);
        }
        Ok(backend)
    }

    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    /// Adds a system prompt sent alongside every request.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Points the backend at a different endpoint, e.g. a proxy.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
        stream: bool,
    ) -> CreateMessageRequest {
        CreateMessageRequest {
            model: self
                .model_override
                .clone()
                .unwrap_or_else(|| params.model_id.clone()),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt_with_schema(prompt, schema),
            }],
            max_tokens: params.max_output_tokens,
            temperature: params.temperature,
            system: self.system.clone(),
            stream,
            extra: params.extra.clone(),
        }
    }

    async fn send(&self, body: &CreateMessageRequest) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|err| BackendError {
                message: format!("Anthropic API request failed: {err}"),
                retriable: err.is_connect() || err.is_timeout(),
                status_code: None,
                retry_after: None,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = parse_retry_after(response.headers().get("retry-after"));
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read Anthropic error body".to_string());
            return Err(map_http_error(status, body_text, retry_after));
        }

        Ok(response)
    }
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("base_url", &self.base_url)
            .field("model_override", &self.model_override)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn call(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<JsonValue, BackendError> {
        let request = self.build_request(prompt, params, schema, false);
        let response = self.send(&request).await?;
        let parsed: CreateMessageResponse = response
            .json()
            .await
            .map_err(|err| BackendError::retriable(format!("Failed to parse Anthropic response: {err}")))?;

        let text = extract_text_response(parsed)?;
        // Models occasionally wrap or truncate JSON; another attempt often fixes it.
        parse_json_payload(&text)
            .map_err(|err| BackendError::retriable(format!("Model output is not JSON: {err}")))
    }

    async fn call_streaming(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<FragmentStream, BackendError> {
        let request = self.build_request(prompt, params, schema, true);
        let response = self.send(&request).await?;
        debug!(model = %request.model, "Anthropic stream opened");

        let fragments = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let items: Vec<Result<String, BackendError>> = match chunk {
                    Ok(bytes) => decoder
                        .push(&bytes)
                        .iter()
                        .filter_map(fragment_from_event)
                        .collect(),
                    Err(err) => vec![Err(BackendError::retriable(format!(
                        "Anthropic stream interrupted: {err}"
                    )))],
                };
                futures::future::ready(Some(items))
            })
            .flat_map(stream::iter);

        Ok(fragments.boxed())
    }
}

/// Maps one SSE event to a text fragment, an error, or nothing.
fn fragment_from_event(event: &SseEvent) -> Option<Result<String, BackendError>> {
    match event.event.as_deref() {
        Some("content_block_delta") => {
            let delta: ContentBlockDelta = match serde_json::from_str(&event.data) {
                Ok(delta) => delta,
                Err(err) => {
                    warn!(error = %err, "Ignoring undecodable content_block_delta");
                    return None;
                }
            };
            match delta.delta {
                Delta::TextDelta { text } => Some(Ok(text)),
                Delta::Other => None,
            }
        }
        Some("error") => {
            let error = serde_json::from_str::<ErrorResponse>(&event.data)
                .map(|wrapper| wrapper.error)
                .unwrap_or_else(|_| ErrorBody {
                    r#type: "unknown".to_string(),
                    message: event.data.clone(),
                });
            let retriable = matches!(error.r#type.as_str(), "overloaded_error" | "api_error");
            Some(Err(BackendError {
                message: error.message,
                retriable,
                status_code: None,
                retry_after: None,
            }))
        }
        _ => None,
    }
}

#[derive(Serialize)]
struct CreateMessageRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(flatten)]
    extra: Map<String, JsonValue>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlockResponse>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlockResponse {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: Delta,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    r#type: String,
    message: String,
}

fn extract_text_response(response: CreateMessageResponse) -> Result<String, BackendError> {
    let text: String = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlockResponse::Text { text } => Some(text),
            ContentBlockResponse::Other => None,
        })
        .collect();

    if text.is_empty() {
        return Err(BackendError::fatal(
            "Anthropic API returned no text in the response content",
        ));
    }
    Ok(text)
}

fn map_http_error(status: StatusCode, body: String, retry_after: Option<Duration>) -> BackendError {
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or(body);

    let retriable = matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    ) || status.as_u16() == 529;

    BackendError {
        message,
        retriable,
        status_code: Some(status.as_u16()),
        retry_after,
    }
}

fn parse_retry_after(header: Option<&HeaderValue>) -> Option<Duration> {
    let value = header?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> ModelParameters {
        let mut params = ModelParameters::new("claude-sonnet-4-5", 0.4, 2048);
        params.extra.insert("top_p".to_string(), json!(0.9));
        params
    }

    #[test]
    fn test_builder_methods() {
        let backend = AnthropicBackend::new("test-key")
            .with_model_override("claude-opus-4-1")
            .with_system("JSON only")
            .with_base_url("http://localhost:9999/v1/messages");

        assert_eq!(backend.model_override.as_deref(), Some("claude-opus-4-1"));
        assert_eq!(backend.system.as_deref(), Some("JSON only"));
        assert_eq!(backend.base_url, "http://localhost:9999/v1/messages");
        assert!(!format!("{backend:?}").contains("test-key"));
    }

    #[test]
    fn test_request_serialization() {
        let backend = AnthropicBackend::new("k");
        let request = backend.build_request("Hello", &params(), &SchemaDescriptor::any(), false);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "claude-sonnet-4-5");
        assert_eq!(json["max_tokens"], 2048);
        assert_eq!(json["temperature"], 0.4);
        assert_eq!(json["top_p"], 0.9);
        assert_eq!(json["messages"][0]["content"], "Hello");
        assert!(json.get("stream").is_none());
        assert!(json.get("system").is_none());
    }

    #[test]
    fn test_streaming_request_uses_override_and_system() {
        let backend = AnthropicBackend::new("k")
            .with_model_override("other-model")
            .with_system("Be brief");
        let request = backend.build_request("Hi", &params(), &SchemaDescriptor::any(), true);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "other-model");
        assert_eq!(json["system"], "Be brief");
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"content": [{"type": "thinking", "thinking": "..."}, {"type": "text", "text": "{\"a\": 1}"}]}"#;
        let response: CreateMessageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(extract_text_response(response).unwrap(), "{\"a\": 1}");

        let empty: CreateMessageResponse = serde_json::from_str(r#"{"content": []}"#).unwrap();
        assert!(extract_text_response(empty).is_err());
    }

    #[test]
    fn test_fragment_from_events() {
        let delta = SseEvent {
            event: Some("content_block_delta".to_string()),
            data: r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"{\"it"}}"#.to_string(),
        };
        assert_eq!(fragment_from_event(&delta), Some(Ok("{\"it".to_string())));

        let ping = SseEvent {
            event: Some("ping".to_string()),
            data: "{}".to_string(),
        };
        assert_eq!(fragment_from_event(&ping), None);

        let overloaded = SseEvent {
            event: Some("error".to_string()),
            data: r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#.to_string(),
        };
        let err = fragment_from_event(&overloaded).unwrap().unwrap_err();
        assert!(err.retriable);
        assert_eq!(err.message, "Overloaded");
    }

    #[test]
    fn test_error_parsing() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"Invalid API key"}}"#;
        let error = map_http_error(StatusCode::UNAUTHORIZED, body.to_string(), None);
        assert_eq!(error.message, "Invalid API key");
        assert_eq!(error.status_code, Some(401));
        assert!(!error.retriable);
    }

    #[test]
    fn test_retriable_status_codes() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert!(map_http_error(status, "error".into(), None).retriable, "{status:?}");
        }
        for status in [StatusCode::BAD_REQUEST, StatusCode::FORBIDDEN, StatusCode::NOT_FOUND] {
            assert!(!map_http_error(status, "error".into(), None).retriable, "{status:?}");
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let value = HeaderValue::from_static("7");
        assert_eq!(parse_retry_after(Some(&value)), Some(Duration::from_secs(7)));
        let date = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&date)), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
