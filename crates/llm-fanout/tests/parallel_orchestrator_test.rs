//! Integration tests for ParallelOrchestrator fan-out/fan-in behavior.
//!
//! Facet executions are closures sleeping on the tokio clock, so timing
//! assertions stay coarse.

use llm_fanout::backend::BackendError;
use llm_fanout::orchestrator::{
    AggregateStatus, OrchestratorError, ParallelOrchestrator, ParallelOrchestratorConfig, TaskErrorKind,
    TaskResult,
};
use llm_fanout::schema::SchemaDescriptor;
use llm_fanout::task::{SharedContext, TaskDescriptor};
use llm_fanout::template::ModelParameters;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

fn descriptor(id: &str) -> TaskDescriptor {
    TaskDescriptor {
        facet_id: id.to_string(),
        resolved_prompt: format!("Research {id}"),
        output_schema: SchemaDescriptor::new(json!({"type": "object", "required": ["facet"]})),
        model_parameters: ModelParameters::new("test-model", 0.0, 256),
        shared_context: Arc::new(SharedContext::new().with_concern("sleep")),
    }
}

fn descriptors(ids: &[&str]) -> Vec<TaskDescriptor> {
    ids.iter().map(|id| descriptor(id)).collect()
}

fn succeed(descriptor: &TaskDescriptor) -> Result<JsonValue, BackendError> {
    Ok(json!({"facet": descriptor.facet_id}))
}

// ============================================================================
// Aggregation
// ============================================================================

#[tokio::test]
async fn test_partial_failure_keeps_submission_order() {
    let orchestrator = ParallelOrchestrator::new(ParallelOrchestratorConfig::new());

    let result = orchestrator
        .run(
            descriptors(&["facet1", "facet2", "facet3"]),
            |d: TaskDescriptor| async move {
                if d.facet_id == "facet2" {
                    Err(BackendError::fatal("upstream refused"))
                } else {
                    succeed(&d)
                }
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, AggregateStatus::PartialFailure);
    assert_eq!(
        result.successes,
        vec![json!({"facet": "facet1"}), json!({"facet": "facet3"})]
    );
    assert_eq!(result.failures, vec!["facet2".to_string()]);
    assert_eq!(
        result.outcome("facet2").unwrap().error_kind(),
        Some(TaskErrorKind::ExecutionError)
    );
    assert!(result.user_message().unwrap().contains("facet2"));
}

#[tokio::test]
async fn test_k_failures_of_n_facets() {
    for (n, k, workers) in [(1, 0, 1), (1, 1, 1), (4, 1, 2), (5, 2, 2), (6, 3, 4), (7, 0, 3), (8, 8, 3), (10, 9, 4)] {
        let ids: Vec<String> = (0..n).map(|i| format!("facet{i}")).collect();
        let failing: Vec<String> = ids.iter().rev().take(k).cloned().collect();
        let orchestrator =
            ParallelOrchestrator::new(ParallelOrchestratorConfig::new().with_max_concurrent_tasks(workers));

        let should_fail = failing.clone();
        let result = orchestrator
            .run(
                ids.iter().map(|id| descriptor(id)).collect(),
                move |d: TaskDescriptor| {
                    let fails = should_fail.contains(&d.facet_id);
                    async move {
                        if fails {
                            Err(BackendError::fatal("refused"))
                        } else {
                            succeed(&d)
                        }
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let expected_status = match k {
            0 => AggregateStatus::Success,
            k if k == n => AggregateStatus::TotalFailure,
            _ => AggregateStatus::PartialFailure,
        };
        assert_eq!(result.status, expected_status, "n={n} k={k}");
        assert_eq!(result.successes.len(), n - k, "n={n} k={k}");
        assert_eq!(result.failures.len(), k, "n={n} k={k}");
        assert_eq!(result.outcomes.len(), n, "n={n} k={k}");

        let mut expected_failures: Vec<String> = failing;
        expected_failures.reverse();
        assert_eq!(result.failures, expected_failures, "n={n} k={k}");
    }
}

#[tokio::test]
async fn test_all_success() {
    let orchestrator = ParallelOrchestrator::default();
    let result = orchestrator
        .run(
            descriptors(&["a", "b"]),
            |d: TaskDescriptor| async move { succeed(&d) },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, AggregateStatus::Success);
    assert!(result.failures.is_empty());
    assert_eq!(result.counts.succeeded, 2);
    assert!(result.user_message().is_none());
}

#[tokio::test]
async fn test_every_facet_timing_out_is_total_failure() {
    let orchestrator = ParallelOrchestrator::new(
        ParallelOrchestratorConfig::new().with_task_timeout(Duration::from_millis(20)),
    );

    let started = Instant::now();
    let result = orchestrator
        .run(
            descriptors(&["a", "b", "c"]),
            |d: TaskDescriptor| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                succeed(&d)
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.status, AggregateStatus::TotalFailure);
    assert_eq!(result.counts.timed_out, 3);
    assert!(
        result
            .outcomes
            .iter()
            .all(|o| o.error_kind() == Some(TaskErrorKind::Timeout))
    );
    assert!(result.user_message().unwrap().contains("try again"));
}

#[tokio::test]
async fn test_results_follow_submission_order_not_completion_order() {
    let orchestrator = ParallelOrchestrator::default();

    let result = orchestrator
        .run(
            descriptors(&["slow", "medium", "fast"]),
            |d: TaskDescriptor| async move {
                let delay = match d.facet_id.as_str() {
                    "slow" => 60,
                    "medium" => 30,
                    _ => 1,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                succeed(&d)
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let ids: Vec<&str> = result.outcomes.iter().map(TaskResult::facet_id).collect();
    assert_eq!(ids, vec!["slow", "medium", "fast"]);
    assert_eq!(result.successes[0], json!({"facet": "slow"}));
}

#[tokio::test]
async fn test_empty_descriptor_set_is_rejected() {
    let orchestrator = ParallelOrchestrator::default();
    let err = orchestrator
        .run(
            Vec::new(),
            |d: TaskDescriptor| async move { succeed(&d) },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::EmptyDescriptorSet);
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
async fn test_panicking_facet_is_isolated() {
    let orchestrator = ParallelOrchestrator::default();

    let result = orchestrator
        .run(
            descriptors(&["ok", "boom"]),
            |d: TaskDescriptor| async move {
                if d.facet_id == "boom" {
                    panic!("facet exploded");
                }
                succeed(&d)
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, AggregateStatus::PartialFailure);
    match result.outcome("boom").unwrap() {
        TaskResult::Failure {
            error_kind, message, ..
        } => {
            assert_eq!(*error_kind, TaskErrorKind::ExecutionError);
            assert_eq!(message, "Task panicked");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_schema_violation_is_invalid_payload() {
    let orchestrator = ParallelOrchestrator::default();

    let result = orchestrator
        .run(
            descriptors(&["good", "bad"]),
            |d: TaskDescriptor| async move {
                if d.facet_id == "bad" {
                    Ok::<_, BackendError>(json!({"unexpected": true}))
                } else {
                    succeed(&d)
                }
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        result.outcome("bad").unwrap().error_kind(),
        Some(TaskErrorKind::InvalidPayload)
    );
    assert!(result.outcome("good").unwrap().is_success());
}

#[tokio::test]
async fn test_payload_outside_value_constraints_is_invalid_payload() {
    let schema = SchemaDescriptor::new(json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["score", "name"],
        "properties": {
            "score": {"type": "number", "minimum": 0, "maximum": 10},
            "name": {"type": "string", "minLength": 1}
        }
    }));
    let scored = |id: &str| TaskDescriptor {
        output_schema: schema.clone(),
        ..descriptor(id)
    };

    let result = ParallelOrchestrator::default()
        .run(
            vec![scored("in_range"), scored("out_of_range"), scored("extra_field")],
            |d: TaskDescriptor| async move {
                Ok::<_, BackendError>(match d.facet_id.as_str() {
                    "in_range" => json!({"score": 7, "name": "Sage"}),
                    "out_of_range" => json!({"score": 999, "name": "Sage"}),
                    _ => json!({"score": 3, "name": "Sage", "junk": true}),
                })
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, AggregateStatus::PartialFailure);
    assert_eq!(result.successes, vec![json!({"score": 7, "name": "Sage"})]);
    assert_eq!(result.failures, vec!["out_of_range".to_string(), "extra_field".to_string()]);
    for id in ["out_of_range", "extra_field"] {
        assert_eq!(
            result.outcome(id).unwrap().error_kind(),
            Some(TaskErrorKind::InvalidPayload)
        );
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let orchestrator = ParallelOrchestrator::new(ParallelOrchestratorConfig::new().with_max_concurrent_tasks(2));

    let (in_flight_c, peak_c) = (Arc::clone(&in_flight), Arc::clone(&peak));
    let result = orchestrator
        .run(
            descriptors(&["a", "b", "c", "d", "e", "f"]),
            move |d: TaskDescriptor| {
                let in_flight = Arc::clone(&in_flight_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    succeed(&d)
                }
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, AggregateStatus::Success);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_facets_run_in_parallel() {
    let orchestrator = ParallelOrchestrator::default();
    let started = Instant::now();

    orchestrator
        .run(
            descriptors(&["a", "b", "c", "d"]),
            |d: TaskDescriptor| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                succeed(&d)
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(350));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_keeps_settled_outcomes() {
    let orchestrator = ParallelOrchestrator::new(ParallelOrchestratorConfig::new().with_max_concurrent_tasks(1));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = orchestrator
        .run(
            descriptors(&["quick", "stuck", "queued"]),
            |d: TaskDescriptor| async move {
                if d.facet_id != "quick" {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                succeed(&d)
            },
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(result.counts.submitted, 3);
    assert_eq!(result.outcomes.len(), 3);
    assert!(result.outcome("quick").unwrap().is_success());
    assert_eq!(
        result.outcome("stuck").unwrap().error_kind(),
        Some(TaskErrorKind::Cancelled)
    );
    assert_eq!(
        result.outcome("queued").unwrap().error_kind(),
        Some(TaskErrorKind::Cancelled)
    );
    assert_eq!(result.counts.cancelled, 2);
    assert_eq!(result.status, AggregateStatus::PartialFailure);
}

#[tokio::test]
async fn test_already_cancelled_run_starts_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = ParallelOrchestrator::default()
        .run(
            descriptors(&["a", "b"]),
            move |d: TaskDescriptor| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { succeed(&d) }
            },
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.status, AggregateStatus::TotalFailure);
    assert_eq!(result.counts.cancelled, 2);
    assert!(result.user_message().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn test_dropping_the_run_stops_running_facets() {
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);
    let orchestrator = ParallelOrchestrator::default();

    let run = orchestrator.run(
        descriptors(&["a", "b"]),
        move |d: TaskDescriptor| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                succeed(&d)
            }
        },
        CancellationToken::new(),
    );
    assert!(tokio::time::timeout(Duration::from_millis(20), run).await.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_run_streaming_reports_in_completion_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let result = ParallelOrchestrator::default()
        .run_streaming(
            descriptors(&["late", "early"]),
            |d: TaskDescriptor| async move {
                let delay = if d.facet_id == "late" { 50 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                succeed(&d)
            },
            CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

    let mut streamed = Vec::new();
    while let Some(outcome) = rx.recv().await {
        streamed.push(outcome.facet_id().to_string());
    }
    assert_eq!(streamed, vec!["early", "late"]);
    assert_eq!(result.outcomes[0].facet_id(), "late");
}
