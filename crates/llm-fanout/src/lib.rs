//! 'llm-fanout' - Multi-part LLM recommendations, fanned out and streamed.
//!
//! A request names a template document (`feature/step`) and carries its
//! variables. The crate resolves the document into a prompt and then either
//! streams one model response, surfacing completed array items as they
//! arrive, or fans out one call per facet (e.g. per health property) on a
//! bounded worker pool and folds the outcomes into one aggregate that
//! tolerates partial failure.
//!
//! The building blocks are usable on their own:
//!
//! - [`template`]: cached YAML template documents and the `{{...}}` resolver.
//! - [`orchestrator`]: bounded, cancellable parallel execution with per-task
//!   timeouts and an [`AggregateResult`].
//! - [`assembler`]: incremental extraction of array elements from a JSON
//!   document that arrives in fragments.
//! - [`extract`]: pulling a JSON payload out of free-form model output.
//!
//! [`generator::Generator`] ties them together; the `server` feature exposes
//! it over HTTP as Server-Sent Events.

pub mod assembler;
pub mod backend;
pub mod config;
pub mod extract;
pub mod generator;
pub mod observability;
pub mod orchestrator;
pub mod schema;
#[cfg(feature = "server")]
pub mod server;
pub mod task;
pub mod template;
pub mod variables;

pub use assembler::{AssemblerError, IncrementalAssembler};
pub use backend::{BackendError, LlmBackend};
pub use extract::{ParseError, extract_json, parse_json_payload};
pub use generator::{GenerateRequest, GenerationOutcome, Generator, GeneratorError, StreamFrame};
pub use orchestrator::{AggregateResult, AggregateStatus, ParallelOrchestrator, TaskErrorKind, TaskResult};
pub use schema::SchemaDescriptor;
pub use task::{Facet, SharedContext, TaskDescriptor, TaskDescriptorBuilder};
pub use template::{TemplateDocument, TemplateError, TemplateStore};
pub use variables::VariableBag;
