//! Per-facet outcomes and the aggregate built from them.

use super::OrchestratorError;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;

/// Why a facet failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The attempt exceeded the per-task timeout.
    Timeout,
    /// The backend call returned an error or panicked.
    ExecutionError,
    /// The run was cancelled before the facet settled.
    Cancelled,
    /// The payload did not match the descriptor's output schema.
    InvalidPayload,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Timeout => "timeout",
            Self::ExecutionError => "execution_error",
            Self::Cancelled => "cancelled",
            Self::InvalidPayload => "invalid_payload",
        };
        f.write_str(text)
    }
}

/// The settled outcome of one facet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Success {
        facet_id: String,
        payload: JsonValue,
        #[serde(rename = "duration_ms", serialize_with = "as_millis")]
        duration: Duration,
    },
    Failure {
        facet_id: String,
        error_kind: TaskErrorKind,
        message: String,
        #[serde(rename = "duration_ms", serialize_with = "as_millis")]
        duration: Duration,
    },
}

impl TaskResult {
    pub fn success(facet_id: impl Into<String>, payload: JsonValue, duration: Duration) -> Self {
        Self::Success {
            facet_id: facet_id.into(),
            payload,
            duration,
        }
    }

    pub fn failure(
        facet_id: impl Into<String>,
        error_kind: TaskErrorKind,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self::Failure {
            facet_id: facet_id.into(),
            error_kind,
            message: message.into(),
            duration,
        }
    }

    pub fn facet_id(&self) -> &str {
        match self {
            Self::Success { facet_id, .. } | Self::Failure { facet_id, .. } => facet_id,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Success { duration, .. } | Self::Failure { duration, .. } => *duration,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error_kind, .. } => Some(*error_kind),
        }
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Every facet succeeded.
    Success,
    /// At least one facet succeeded and at least one failed.
    PartialFailure,
    /// No facet succeeded.
    TotalFailure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateCounts {
    pub submitted: usize,
    pub succeeded: usize,
    /// All failures, whatever their kind.
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

/// Every facet's outcome folded into one result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub status: AggregateStatus,
    /// Success payloads in submission order.
    pub successes: Vec<JsonValue>,
    /// Failed facet ids in submission order.
    pub failures: Vec<String>,
    /// One outcome per submitted facet, in submission order.
    pub outcomes: Vec<TaskResult>,
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
    pub counts: AggregateCounts,
}

impl AggregateResult {
    /// Builds the aggregate from outcomes listed in submission order.
    pub fn from_outcomes(
        outcomes: Vec<TaskResult>,
        total_duration: Duration,
    ) -> Result<Self, OrchestratorError> {
        if outcomes.is_empty() {
            return Err(OrchestratorError::EmptyDescriptorSet);
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        let mut counts = AggregateCounts {
            submitted: outcomes.len(),
            ..Default::default()
        };

        for outcome in &outcomes {
            match outcome {
                TaskResult::Success { payload, .. } => {
                    counts.succeeded += 1;
                    successes.push(payload.clone());
                }
                TaskResult::Failure {
                    facet_id,
                    error_kind,
                    ..
                } => {
                    counts.failed += 1;
                    match error_kind {
                        TaskErrorKind::Timeout => counts.timed_out += 1,
                        TaskErrorKind::Cancelled => counts.cancelled += 1,
                        TaskErrorKind::ExecutionError | TaskErrorKind::InvalidPayload => {}
                    }
                    failures.push(facet_id.clone());
                }
            }
        }

        let status = match (successes.is_empty(), failures.is_empty()) {
            (_, true) => AggregateStatus::Success,
            (false, false) => AggregateStatus::PartialFailure,
            (true, false) => AggregateStatus::TotalFailure,
        };

        Ok(Self {
            status,
            successes,
            failures,
            outcomes,
            total_duration,
            counts,
        })
    }

    /// Text to show the end user, if the outcome needs explaining.
    pub fn user_message(&self) -> Option<String> {
        match self.status {
            AggregateStatus::Success => None,
            AggregateStatus::PartialFailure => Some(format!(
                "Some recommendations could not be generated ({}). The rest are shown below.",
                self.failures.join(", ")
            )),
            AggregateStatus::TotalFailure if self.counts.cancelled == self.counts.submitted => {
                Some("The request was cancelled before any recommendations were generated.".to_string())
            }
            AggregateStatus::TotalFailure => Some(
                "We couldn't generate recommendations right now. Please try again in a moment."
                    .to_string(),
            ),
        }
    }

    /// The outcome recorded for `facet_id`.
    pub fn outcome(&self, facet_id: &str) -> Option<&TaskResult> {
        self.outcomes.iter().find(|o| o.facet_id() == facet_id)
    }
}
