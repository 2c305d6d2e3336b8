//! The request-level data flow: template lookup, then either one streamed
//! LLM call or an orchestrated fan-out over facets.
//!
//! Progress is reported as [`StreamFrame`]s over an unbounded channel while
//! the final [`GenerationOutcome`] is returned.

use crate::assembler::{AssemblerError, IncrementalAssembler};
use crate::backend::{BackendError, LlmBackend};
use crate::extract::parse_json_payload;
use crate::orchestrator::{
    AggregateResult, OrchestratorError, ParallelOrchestrator, ParallelOrchestratorConfig, TaskErrorKind,
    TaskResult,
};
use crate::task::{Facet, SharedContext, TaskDescriptor, TaskDescriptorBuilder};
use crate::template::{FanOutSpec, TemplateDocument, TemplateError, TemplateStore};
use crate::variables::VariableBag;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Body of `POST /generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub feature: String,
    pub step: String,
    #[serde(default)]
    pub data: VariableBag,
}

impl GenerateRequest {
    pub fn new(feature: impl Into<String>, step: impl Into<String>, data: VariableBag) -> Self {
        Self {
            feature: feature.into(),
            step: step.into(),
            data,
        }
    }

    /// `"{feature}/{step}"`.
    pub fn template_name(&self) -> String {
        format!("{}/{}", self.feature, self.step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetError {
    pub kind: TaskErrorKind,
    pub message: String,
}

/// Incremental progress sent to the client while a generation runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Raw response text from a single streamed call.
    Text { text: String },
    /// A completed element of the streamed target array.
    Item { index: usize, item: JsonValue },
    /// A settled facet of an orchestrated run.
    Facet {
        facet_id: String,
        status: FacetStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<JsonValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<FacetError>,
    },
}

impl From<&TaskResult> for StreamFrame {
    fn from(outcome: &TaskResult) -> Self {
        match outcome {
            TaskResult::Success { facet_id, payload, .. } => Self::Facet {
                facet_id: facet_id.clone(),
                status: FacetStatus::Success,
                payload: Some(payload.clone()),
                error: None,
            },
            TaskResult::Failure {
                facet_id,
                error_kind,
                message,
                ..
            } => Self::Facet {
                facet_id: facet_id.clone(),
                status: FacetStatus::Failure,
                payload: None,
                error: Some(FacetError {
                    kind: *error_kind,
                    message: message.clone(),
                }),
            },
        }
    }
}

/// The terminal document of a generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GenerationOutcome {
    /// Finalized payload of a single streamed call.
    Payload(JsonValue),
    /// Result of an orchestrated fan-out.
    Aggregate(AggregateResult),
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Backend call failed: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Assembler(#[from] AssemblerError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// The request data does not fit the template's fan-out declaration.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The finished response could not be turned into a conforming payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Generation cancelled")]
    Cancelled,
}

/// Defaults applied to every generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Base configuration for fan-out runs; a document's `fan_out` block may
    /// override concurrency and timeout.
    #[serde(default)]
    pub orchestrator: ParallelOrchestratorConfig,
    /// Array to stream item by item when a document has no `stream` block.
    #[serde(default)]
    pub default_target_path: Option<String>,
}

/// Runs generations against one template store and one backend.
pub struct Generator {
    store: Arc<TemplateStore>,
    backend: Arc<dyn LlmBackend>,
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(store: Arc<TemplateStore>, backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            store,
            backend,
            config: GeneratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GeneratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Runs `request` to completion, sending progress over `frames`.
    ///
    /// A closed `frames` receiver does not stop the generation; cancel
    /// `cancel` for that.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        frames: mpsc::UnboundedSender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome, GeneratorError> {
        let name = request.template_name();
        let span = info_span!("generate", template = %name, backend = %self.backend.name());

        async move {
            let document = self.store.load(&name).await?;
            match &document.fan_out {
                Some(fan_out) => self
                    .generate_fan_out(&document, fan_out, &request.data, &frames, cancel)
                    .await
                    .map(GenerationOutcome::Aggregate),
                None => self
                    .generate_single(&document, &request.data, &frames, cancel)
                    .await
                    .map(GenerationOutcome::Payload),
            }
        }
        .instrument(span)
        .await
    }

    /// One streamed call, surfacing text and completed array items.
    pub async fn generate_single(
        &self,
        document: &TemplateDocument,
        variables: &VariableBag,
        frames: &mpsc::UnboundedSender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Result<JsonValue, GeneratorError> {
        let prompt = document.render(variables);
        let target_path = document
            .stream
            .as_ref()
            .map(|s| s.target_path.clone())
            .or_else(|| self.config.default_target_path.clone());

        let mut fragments = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GeneratorError::Cancelled),
            opened = self.backend.call_streaming(&prompt, &document.model_parameters, &document.output_schema) => opened?,
        };

        let mut assembler = target_path
            .map(|path| IncrementalAssembler::new(path).with_schema(document.output_schema.clone()));
        let mut text = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        emitted = assembler.as_ref().map_or(0, IncrementalAssembler::emitted_count),
                        "Generation cancelled mid-stream"
                    );
                    return Err(GeneratorError::Cancelled);
                }
                next = fragments.next() => next,
            };
            let Some(fragment) = next else { break };
            let fragment = fragment?;

            let _ = frames.send(StreamFrame::Text {
                text: fragment.clone(),
            });
            match assembler.as_mut() {
                Some(assembler) => {
                    for item in assembler.feed_items(fragment.as_bytes()) {
                        let _ = frames.send(StreamFrame::Item {
                            index: item.index,
                            item: item.value,
                        });
                    }
                }
                None => text.push_str(&fragment),
            }
        }

        let payload = match assembler {
            Some(assembler) => {
                let emitted = assembler.emitted_count();
                let payload = assembler.finalize()?;
                debug!(emitted, "Stream finalized");
                payload
            }
            None => {
                let payload = parse_json_payload(&text).map_err(|e| GeneratorError::InvalidPayload(e.to_string()))?;
                document
                    .output_schema
                    .validate(&payload)
                    .map_err(|e| GeneratorError::InvalidPayload(e.to_string()))?;
                payload
            }
        };
        Ok(payload)
    }

    /// One backend call per facet, reported as each facet settles.
    pub async fn generate_fan_out(
        &self,
        document: &TemplateDocument,
        fan_out: &FanOutSpec,
        variables: &VariableBag,
        frames: &mpsc::UnboundedSender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Result<AggregateResult, GeneratorError> {
        let records = match variables.get(&fan_out.facets_key) {
            Some(JsonValue::Array(records)) => records,
            Some(_) => {
                return Err(GeneratorError::InvalidRequest(format!(
                    "'{}' must be a list of facets",
                    fan_out.facets_key
                )));
            }
            None => {
                return Err(GeneratorError::InvalidRequest(format!(
                    "'{}' is required by template '{}'",
                    fan_out.facets_key, document.name
                )));
            }
        };

        let facets: Vec<Facet> = records
            .iter()
            .enumerate()
            .map(|(index, record)| Facet::from_record(record, &fan_out.id_field, index))
            .collect();
        let shared = Arc::new(SharedContext::from_variables(variables, &fan_out.facets_key));
        let facet_template = self.store.load(&fan_out.template).await?;
        let descriptors = TaskDescriptorBuilder::new(facet_template).build_all(&facets, &shared);

        let mut config = self.config.orchestrator.clone();
        if let Some(max) = fan_out.max_concurrency {
            config = config.with_max_concurrent_tasks(max);
        }
        if let Some(secs) = fan_out.timeout_secs {
            config = config.with_task_timeout(Duration::from_secs(secs));
        }
        info!(facets = descriptors.len(), template = %fan_out.template, "Fanning out");

        let backend = Arc::clone(&self.backend);
        let execute = move |descriptor: TaskDescriptor| {
            let backend = Arc::clone(&backend);
            async move {
                backend
                    .call(
                        &descriptor.resolved_prompt,
                        &descriptor.model_parameters,
                        &descriptor.output_schema,
                    )
                    .await
            }
        };

        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel();
        let forward = async {
            while let Some(outcome) = settled_rx.recv().await {
                let _ = frames.send(StreamFrame::from(&outcome));
            }
        };
        let orchestrator = ParallelOrchestrator::new(config);
        let (result, ()) = tokio::join!(
            orchestrator.run_streaming(descriptors, execute, cancel, settled_tx),
            forward
        );
        Ok(result?)
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("store", &self.store)
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}
