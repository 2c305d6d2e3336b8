//! Error types for orchestrator runs.

use thiserror::Error;

/// Caller errors that prevent a run from starting.
///
/// Per-facet failures are never reported through this type; they are
/// recorded as [`TaskResult::Failure`](super::TaskResult::Failure) values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    /// `run` was called with no task descriptors.
    #[error("Cannot run an orchestration with an empty descriptor set")]
    EmptyDescriptorSet,

    /// The configuration cannot be executed (e.g. zero workers).
    #[error("Invalid orchestrator configuration: {0}")]
    InvalidConfig(String),
}
