//! The LLM call capability the rest of the crate is written against.
//!
//! Implementations turn a resolved prompt plus [`ModelParameters`] into a
//! JSON payload (`call`) or a stream of raw text fragments
//! (`call_streaming`). The orchestrator and the generator only ever see the
//! [`LlmBackend`] trait, so tests drive them with in-process mocks.

#[cfg(feature = "anthropic-api")]
pub mod anthropic;
pub mod retry;
#[cfg(feature = "anthropic-api")]
pub mod sse;

#[cfg(feature = "anthropic-api")]
pub use anthropic::AnthropicBackend;
pub use retry::{RetryBackend, retry_with_backoff};

use crate::schema::SchemaDescriptor;
use crate::template::ModelParameters;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A failed backend call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Whether repeating the call may succeed (rate limits, 5xx, transport errors).
    pub retriable: bool,
    pub status_code: Option<u16>,
    /// Server-requested delay before the next attempt.
    pub retry_after: Option<Duration>,
}

impl BackendError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
            status_code: None,
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
            status_code: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

/// Raw text fragments of a streamed response, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String, BackendError>>;

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Sends `prompt` and returns the parsed JSON payload.
    async fn call(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<JsonValue, BackendError>;

    /// Sends `prompt` and returns the response text as it is generated.
    async fn call_streaming(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<FragmentStream, BackendError>;

    /// Short identifier used in logs.
    fn name(&self) -> String {
        let type_name = std::any::type_name::<Self>();
        type_name.rsplit("::").next().unwrap_or(type_name).to_string()
    }
}

#[async_trait]
impl<T: LlmBackend + ?Sized> LlmBackend for Arc<T> {
    async fn call(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<JsonValue, BackendError> {
        (**self).call(prompt, params, schema).await
    }

    async fn call_streaming(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<FragmentStream, BackendError> {
        (**self).call_streaming(prompt, params, schema).await
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// Appends the output schema to a prompt so the model knows the expected shape.
///
/// Schemas that accept anything add nothing.
pub fn prompt_with_schema(prompt: &str, schema: &SchemaDescriptor) -> String {
    match schema.as_json() {
        JsonValue::Object(rules) if rules.is_empty() => prompt.to_string(),
        json => {
            let rendered = serde_json::to_string_pretty(json).unwrap_or_else(|_| json.to_string());
            format!(
                "{prompt}\n\nRespond with a single JSON document matching this schema:\n```json\n{rendered}\n```"
            )
        }
    }
}
