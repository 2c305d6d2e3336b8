//! Configuration for parallel facet execution.

use super::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for [`ParallelOrchestrator`](super::ParallelOrchestrator).
///
/// # Examples
///
/// ```
/// use llm_fanout::orchestrator::ParallelOrchestratorConfig;
/// use std::time::Duration;
///
/// let config = ParallelOrchestratorConfig::new()
///     .with_max_concurrent_tasks(4)
///     .with_task_timeout(Duration::from_secs(60))
///     .with_max_attempts(2);
/// assert_eq!(config.max_concurrent_tasks, Some(4));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelOrchestratorConfig {
    /// Number of workers pulling from the task queue.
    ///
    /// If `None`, every descriptor gets its own worker. Set it when the
    /// backend enforces rate limits.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,

    /// Upper bound on a single execution attempt. `None` waits indefinitely.
    ///
    /// A timed-out facet is recorded as a timeout; it is not retried.
    #[serde(default)]
    pub task_timeout: Option<Duration>,

    /// Total attempts per facet for retriable backend errors.
    ///
    /// **Default:** 1 (no retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Base delay for exponential backoff between attempts.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: Duration,

    /// Check each payload against its descriptor's output schema before
    /// recording success.
    ///
    /// **Default:** `true`
    #[serde(default = "default_true")]
    pub validate_payloads: bool,
}

fn default_max_attempts() -> usize {
    1
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

impl Default for ParallelOrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelOrchestratorConfig {
    /// Unbounded concurrency, no timeout, one attempt, validation on.
    pub fn new() -> Self {
        Self {
            max_concurrent_tasks: None,
            task_timeout: None,
            max_attempts: default_max_attempts(),
            retry_base_delay: default_retry_base_delay(),
            validate_payloads: true,
        }
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    pub fn with_unlimited_concurrency(mut self) -> Self {
        self.max_concurrent_tasks = None;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_no_timeout(mut self) -> Self {
        self.task_timeout = None;
        self
    }

    /// Sets the total number of attempts (e.g. 3 = initial + 2 retries).
    pub fn with_max_attempts(mut self, max: usize) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.validate_payloads = enable;
        self
    }

    /// Number of workers for `descriptor_count` tasks.
    pub fn worker_count(&self, descriptor_count: usize) -> usize {
        self.max_concurrent_tasks
            .map_or(descriptor_count, |max| max.min(descriptor_count))
    }

    pub(crate) fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_concurrent_tasks == Some(0) {
            return Err(OrchestratorError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
