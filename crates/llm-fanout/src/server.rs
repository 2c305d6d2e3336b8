//! HTTP boundary: `POST /generate` answered as Server-Sent Events.
//!
//! Every [`StreamFrame`] is sent as an unnamed event with the frame as JSON
//! data. The stream ends with a `done` event carrying the
//! [`GenerationOutcome`], or an `error` event carrying an [`ErrorBody`].
//! Dropping the response (client disconnect) cancels the generation.

use crate::generator::{GenerateRequest, GenerationOutcome, Generator, GeneratorError, StreamFrame};
use crate::template::TemplateError;
use async_stream::stream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DONE_EVENT: &str = "done";
pub const ERROR_EVENT: &str = "error";

#[derive(Clone)]
struct AppState {
    generator: Arc<Generator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// The service's routes over `generator`.
pub fn router(generator: Arc<Generator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .with_state(AppState { generator })
}

async fn health() -> &'static str {
    "ok"
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorBody>)> {
    let name = request.template_name();
    // Unknown or broken templates are answered before the stream opens.
    state
        .generator
        .store()
        .load(&name)
        .await
        .map_err(map_template_error)?;
    info!(template = %name, "Generation requested");

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<StreamFrame>();
    let cancel = CancellationToken::new();
    let generator = Arc::clone(&state.generator);
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move { generator.generate(request, frames_tx, task_cancel).await });

    let event_stream = stream! {
        let guard = cancel.drop_guard();

        while let Some(frame) = frames_rx.recv().await {
            yield Ok(json_event(None, &frame));
        }

        match handle.await {
            Ok(Ok(outcome)) => yield Ok(done_event(&outcome)),
            Ok(Err(err)) => {
                warn!(template = %name, error = %err, "Generation failed");
                yield Ok(json_event(Some(ERROR_EVENT), &error_body(&err)));
            }
            Err(join_err) => {
                warn!(template = %name, error = %join_err, "Generation task aborted");
                yield Ok(json_event(
                    Some(ERROR_EVENT),
                    &ErrorBody::new("internal", "Generation task aborted"),
                ));
            }
        }

        guard.disarm();
    };

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    ))
}

fn done_event(outcome: &GenerationOutcome) -> SseEvent {
    json_event(Some(DONE_EVENT), outcome)
}

fn json_event(name: Option<&str>, data: &impl Serialize) -> SseEvent {
    let event = match name {
        Some(name) => SseEvent::default().event(name),
        None => SseEvent::default(),
    };
    match event.json_data(data) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "Failed to serialize SSE payload");
            SseEvent::default()
                .event(ERROR_EVENT)
                .data(r#"{"code":"internal","message":"Failed to serialize event"}"#)
        }
    }
}

fn map_template_error(err: TemplateError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &err {
        TemplateError::NotFound(_) => StatusCode::NOT_FOUND,
        TemplateError::Malformed { .. } | TemplateError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(template_error_body(&err)))
}

fn template_error_body(err: &TemplateError) -> ErrorBody {
    let code = match err {
        TemplateError::NotFound(_) => "not_found",
        TemplateError::Malformed { .. } => "malformed_template",
        TemplateError::Io { .. } => "template_io",
    };
    ErrorBody::new(code, err.to_string())
}

fn error_body(err: &GeneratorError) -> ErrorBody {
    let code = match err {
        GeneratorError::Template(inner) => return template_error_body(inner),
        GeneratorError::Backend(_) => "backend_error",
        GeneratorError::Assembler(_) => "incomplete_stream",
        GeneratorError::Orchestrator(_) => "orchestrator_error",
        GeneratorError::InvalidRequest(_) => "invalid_request",
        GeneratorError::InvalidPayload(_) => "invalid_payload",
        GeneratorError::Cancelled => "cancelled",
    };
    ErrorBody::new(code, err.to_string())
}
