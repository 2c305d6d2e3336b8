//! Bounded worker pool over facet task descriptors.

use super::{AggregateResult, OrchestratorError, ParallelOrchestratorConfig, TaskErrorKind, TaskResult};
use crate::backend::BackendError;
use crate::backend::retry::backoff_delay;
use crate::task::TaskDescriptor;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::task::AbortOnDropHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Runs facet tasks concurrently and aggregates their outcomes.
///
/// Descriptors are queued in submission order; `min(max_concurrent_tasks, N)`
/// workers pull from the queue. Each facet settles independently: a timeout,
/// backend error, schema violation or panic in one facet is recorded as that
/// facet's [`TaskResult::Failure`] and never affects its siblings.
///
/// # Examples
///
/// ```
/// use llm_fanout::backend::BackendError;
/// use llm_fanout::orchestrator::{AggregateStatus, ParallelOrchestrator, ParallelOrchestratorConfig};
/// use llm_fanout::task::TaskDescriptor;
/// use serde_json::json;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(descriptors: Vec<TaskDescriptor>) {
/// let orchestrator = ParallelOrchestrator::new(ParallelOrchestratorConfig::new().with_max_concurrent_tasks(4));
/// let result = orchestrator
///     .run(
///         descriptors,
///         |descriptor: TaskDescriptor| async move {
///             Ok::<_, BackendError>(json!({"facet": descriptor.facet_id}))
///         },
///         CancellationToken::new(),
///     )
///     .await
///     .unwrap();
/// assert_eq!(result.status, AggregateStatus::Success);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParallelOrchestrator {
    config: ParallelOrchestratorConfig,
}

type Job = (usize, TaskDescriptor);

impl ParallelOrchestrator {
    pub fn new(config: ParallelOrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParallelOrchestratorConfig {
        &self.config
    }

    /// Executes every descriptor and waits for all of them to settle.
    ///
    /// Cancelling `cancel` stops queued facets from starting and interrupts
    /// running ones at their next suspension point; both are recorded as
    /// [`TaskErrorKind::Cancelled`]. Outcomes that settled earlier are kept.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::EmptyDescriptorSet`] for an empty `descriptors`,
    /// [`OrchestratorError::InvalidConfig`] for a zero worker or attempt count.
    pub async fn run<F, Fut>(
        &self,
        descriptors: Vec<TaskDescriptor>,
        execute: F,
        cancel: CancellationToken,
    ) -> Result<AggregateResult, OrchestratorError>
    where
        F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, BackendError>> + Send + 'static,
    {
        self.run_inner(descriptors, execute, cancel, None).await
    }

    /// Like [`run`](Self::run), additionally sending each facet's outcome
    /// over `settled` as soon as it is known.
    ///
    /// A closed receiver does not affect the run.
    pub async fn run_streaming<F, Fut>(
        &self,
        descriptors: Vec<TaskDescriptor>,
        execute: F,
        cancel: CancellationToken,
        settled: mpsc::UnboundedSender<TaskResult>,
    ) -> Result<AggregateResult, OrchestratorError>
    where
        F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, BackendError>> + Send + 'static,
    {
        self.run_inner(descriptors, execute, cancel, Some(settled)).await
    }

    async fn run_inner<F, Fut>(
        &self,
        descriptors: Vec<TaskDescriptor>,
        execute: F,
        cancel: CancellationToken,
        settled: Option<mpsc::UnboundedSender<TaskResult>>,
    ) -> Result<AggregateResult, OrchestratorError>
    where
        F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, BackendError>> + Send + 'static,
    {
        if descriptors.is_empty() {
            return Err(OrchestratorError::EmptyDescriptorSet);
        }
        self.config.validate()?;

        let total = descriptors.len();
        let workers = self.config.worker_count(total);
        let started = Instant::now();

        async move {
            let facet_ids: Vec<String> = descriptors.iter().map(|d| d.facet_id.clone()).collect();

            let (job_tx, job_rx) = mpsc::channel::<Job>(total);
            for job in descriptors.into_iter().enumerate() {
                // Capacity equals the job count, so this never waits.
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
            drop(job_tx);

            let jobs = Arc::new(Mutex::new(job_rx));
            let execute = Arc::new(execute);
            let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, TaskResult)>();

            // Dropping the set (and with it this future) aborts every worker.
            let mut pool = JoinSet::new();
            for worker in 0..workers {
                pool.spawn(worker_loop(
                    worker,
                    Arc::clone(&jobs),
                    Arc::clone(&execute),
                    self.config.clone(),
                    cancel.clone(),
                    result_tx.clone(),
                ));
            }
            drop(result_tx);

            let mut slots: Vec<Option<TaskResult>> = vec![None; total];
            while let Some((index, outcome)) = result_rx.recv().await {
                if let Some(tx) = &settled {
                    let _ = tx.send(outcome.clone());
                }
                slots[index] = Some(outcome);
            }

            while let Some(joined) = pool.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Worker terminated abnormally");
                }
            }

            // Facets that never ran: still queued at cancellation, or lost with a worker.
            let elapsed = started.elapsed();
            let outcomes: Vec<TaskResult> = slots
                .into_iter()
                .zip(facet_ids)
                .map(|(slot, facet_id)| {
                    slot.unwrap_or_else(|| {
                        let outcome = if cancel.is_cancelled() {
                            TaskResult::failure(facet_id, TaskErrorKind::Cancelled, "Cancelled before start", Duration::ZERO)
                        } else {
                            TaskResult::failure(
                                facet_id,
                                TaskErrorKind::ExecutionError,
                                "Task did not settle",
                                elapsed,
                            )
                        };
                        if let Some(tx) = &settled {
                            let _ = tx.send(outcome.clone());
                        }
                        outcome
                    })
                })
                .collect();

            let result = AggregateResult::from_outcomes(outcomes, started.elapsed())?;
            info!(
                status = ?result.status,
                succeeded = result.counts.succeeded,
                failed = result.counts.failed,
                duration_ms = result.total_duration.as_millis() as u64,
                "Orchestration finished"
            );
            Ok::<_, OrchestratorError>(result)
        }
        .instrument(info_span!(
            "parallel_orchestrator_run",
            descriptors = total,
            workers = workers,
        ))
        .await
    }
}

async fn worker_loop<F, Fut>(
    worker: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    execute: Arc<F>,
    config: ParallelOrchestratorConfig,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<(usize, TaskResult)>,
) where
    F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, BackendError>> + Send + 'static,
{
    loop {
        let job = {
            let mut queue = jobs.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = queue.recv() => job,
            }
        };
        let Some((index, descriptor)) = job else {
            debug!(worker, "Worker idle, exiting");
            break;
        };

        let span = info_span!("facet_task", facet_id = %descriptor.facet_id, worker);
        let outcome = run_task(descriptor, Arc::clone(&execute), &config, &cancel)
            .instrument(span)
            .await;
        if results.send((index, outcome)).is_err() {
            break;
        }
    }
}

enum Attempt {
    Finished(Result<Result<JsonValue, BackendError>, tokio::task::JoinError>),
    TimedOut(Duration),
    Cancelled,
}

/// Executes one facet, with retries, and classifies the outcome.
async fn run_task<F, Fut>(
    descriptor: TaskDescriptor,
    execute: Arc<F>,
    config: &ParallelOrchestratorConfig,
    cancel: &CancellationToken,
) -> TaskResult
where
    F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, BackendError>> + Send + 'static,
{
    let started = Instant::now();
    let facet_id = descriptor.facet_id.clone();
    let schema = config.validate_payloads.then(|| descriptor.output_schema.clone());
    let mut pending = Some(descriptor);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let is_last = attempt >= config.max_attempts;
        let Some(input) = (if is_last { pending.take() } else { pending.clone() }) else {
            break TaskResult::failure(facet_id, TaskErrorKind::ExecutionError, "No attempts left", started.elapsed());
        };

        // Spawned so a panicking call is contained; aborted if the worker is dropped.
        let mut handle = AbortOnDropHandle::new(tokio::spawn((*execute)(input)));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Attempt::Cancelled,
            outcome = await_attempt(&mut handle, config.task_timeout) => outcome,
        };

        match outcome {
            Attempt::Finished(Ok(Ok(payload))) => {
                if let Some(schema) = &schema
                    && let Err(e) = schema.validate(&payload)
                {
                    warn!(facet_id = %facet_id, error = %e, "Payload failed schema validation");
                    break TaskResult::failure(facet_id, TaskErrorKind::InvalidPayload, e.to_string(), started.elapsed());
                }
                debug!(facet_id = %facet_id, attempt, "Facet succeeded");
                break TaskResult::success(facet_id, payload, started.elapsed());
            }
            Attempt::Finished(Ok(Err(e))) if e.retriable && !is_last => {
                let delay = backoff_delay(&e, attempt as u32, config.retry_base_delay);
                warn!(facet_id = %facet_id, attempt, error = %e, ?delay, "Facet attempt failed, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        break TaskResult::failure(facet_id, TaskErrorKind::Cancelled, "Cancelled during retry backoff", started.elapsed());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Attempt::Finished(Ok(Err(e))) => {
                warn!(facet_id = %facet_id, attempt, error = %e, "Facet failed");
                break TaskResult::failure(facet_id, TaskErrorKind::ExecutionError, e.message, started.elapsed());
            }
            Attempt::Finished(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    "Task panicked".to_string()
                } else {
                    format!("Task aborted: {join_error}")
                };
                warn!(facet_id = %facet_id, "{message}");
                break TaskResult::failure(facet_id, TaskErrorKind::ExecutionError, message, started.elapsed());
            }
            Attempt::TimedOut(limit) => {
                handle.abort();
                warn!(facet_id = %facet_id, timeout = ?limit, "Facet timed out");
                break TaskResult::failure(
                    facet_id,
                    TaskErrorKind::Timeout,
                    format!("Timed out after {limit:?}"),
                    started.elapsed(),
                );
            }
            Attempt::Cancelled => {
                handle.abort();
                warn!(facet_id = %facet_id, "Facet cancelled");
                break TaskResult::failure(facet_id, TaskErrorKind::Cancelled, "Cancelled", started.elapsed());
            }
        }
    }
}

async fn await_attempt(
    handle: &mut AbortOnDropHandle<Result<JsonValue, BackendError>>,
    timeout: Option<Duration>,
) -> Attempt {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => Attempt::Finished(joined),
            Err(_) => Attempt::TimedOut(limit),
        },
        None => Attempt::Finished(handle.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDescriptor;
    use crate::task::SharedContext;
    use crate::template::ModelParameters;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(id: &str) -> TaskDescriptor {
        TaskDescriptor {
            facet_id: id.to_string(),
            resolved_prompt: format!("prompt for {id}"),
            output_schema: SchemaDescriptor::any(),
            model_parameters: ModelParameters::new("m", 0.0, 10),
            shared_context: Arc::new(SharedContext::default()),
        }
    }

    #[tokio::test]
    async fn test_retriable_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let orchestrator = ParallelOrchestrator::new(
            ParallelOrchestratorConfig::new()
                .with_max_attempts(3)
                .with_retry_base_delay(Duration::from_millis(1)),
        );

        let result = orchestrator
            .run(
                vec![descriptor("a")],
                move |_d| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(BackendError::retriable("busy"))
                        } else {
                            Ok(json!({"ok": true}))
                        }
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.outcomes[0].is_success());
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let orchestrator = ParallelOrchestrator::new(ParallelOrchestratorConfig::new().with_max_attempts(3));

        let result = orchestrator
            .run(
                vec![descriptor("a")],
                move |_d| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(BackendError::fatal("bad request")) }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match &result.outcomes[0] {
            TaskResult::Failure { error_kind, message, .. } => {
                assert_eq!(*error_kind, TaskErrorKind::ExecutionError);
                assert_eq!(message, "bad request");
            }
            other => panic!("Expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_schema_violation_is_invalid_payload() {
        let mut strict = descriptor("strict");
        strict.output_schema = SchemaDescriptor::new(json!({"type": "object", "required": ["items"]}));
        let orchestrator = ParallelOrchestrator::default();

        let result = orchestrator
            .run(
                vec![strict, descriptor("loose")],
                |_d| async { Ok(json!({"other": 1})) },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcomes[0].error_kind(), Some(TaskErrorKind::InvalidPayload));
        assert!(result.outcomes[1].is_success());

        let lenient = ParallelOrchestrator::new(ParallelOrchestratorConfig::new().with_validation(false));
        let mut strict = descriptor("strict");
        strict.output_schema = SchemaDescriptor::new(json!({"required": ["items"]}));
        let result = lenient
            .run(vec![strict], |_d| async { Ok(json!({})) }, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.outcomes[0].is_success());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let orchestrator = ParallelOrchestrator::new(ParallelOrchestratorConfig::new().with_max_concurrent_tasks(0));
        let err = orchestrator
            .run(vec![descriptor("a")], |_d| async { Ok(json!({})) }, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_run_streaming_reports_every_facet() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = ParallelOrchestrator::default();

        let result = orchestrator
            .run_streaming(
                vec![descriptor("a"), descriptor("b")],
                |d| async move {
                    if d.facet_id == "b" {
                        Err(BackendError::fatal("nope"))
                    } else {
                        Ok(json!({"id": d.facet_id}))
                    }
                },
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        let mut streamed = Vec::new();
        while let Some(outcome) = rx.recv().await {
            streamed.push(outcome);
        }
        assert_eq!(streamed.len(), 2);
        streamed.sort_by(|a, b| a.facet_id().cmp(b.facet_id()));
        assert_eq!(streamed, result.outcomes);
    }
}
