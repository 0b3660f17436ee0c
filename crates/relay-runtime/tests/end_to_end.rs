//! End-to-end submission scenarios against the in-memory ledger

mod common;

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use relay_core::run::RunStatus;
use relay_core::spec::{trigger_source, WorkSpec};
use relay_core::ErrorCategory;
use relay_runtime::{DeadLetterService, DispatchError, RetrySweeper};
use relay_storage::{Ledger, Pagination, RunFilter, RunSort};

use common::harness;

#[tokio::test]
async fn submit_and_complete() {
    let h = harness();

    let run_id = h
        .dispatcher
        .submit_task("add", json!({"a": 3, "b": 7}))
        .await
        .unwrap();

    let record = h.dispatcher.wait_for_terminal(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.result, Some(json!({"a": 3, "b": 7, "result": 10})));
    assert!(record.error.is_none());
    assert!(record.started_at.unwrap() >= record.created_at);
    assert!(record.completed_at.unwrap() >= record.started_at.unwrap());

    let events = h
        .dispatcher
        .get_run_events(run_id, Pagination::default())
        .await
        .unwrap();
    let types: Vec<&str> = events.items.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["run.created", "run.started", "run.completed"]);
}

#[tokio::test]
async fn failing_task_retries_then_dead_letters() {
    let h = harness();
    let dlq = Arc::new(DeadLetterService::new(
        Arc::clone(h.dispatcher.ledger()),
        Arc::clone(&h.dispatcher),
        h.bus.clone(),
    ));
    let sweeper = RetrySweeper::new(
        Arc::clone(h.dispatcher.ledger()),
        Arc::clone(&h.dispatcher),
        Arc::clone(&dlq),
    );

    let spec = WorkSpec::task("fail", json!({"message": "x"})).with_max_retries(2);
    let run_id = h.dispatcher.submit(spec).await.unwrap();

    let record = h.dispatcher.wait_for_terminal(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_category, Some(ErrorCategory::Internal));
    assert_eq!(record.retry_count, 0);
    assert!(record.error.as_deref().unwrap().contains("x"));

    // First auto-retry cadence: one replay, which fails again.
    let summary = sweeper.sweep().await;
    assert_eq!(summary.runs_replayed, 1);
    let retried = wait_for_lineage_terminal(&h, run_id).await;
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.status, RunStatus::Failed);
    assert_eq!(retried.spec.trigger_source, trigger_source::RETRY);

    // Second cadence: the replay exhausts the budget and dead-letters.
    let summary = sweeper.sweep().await;
    assert_eq!(summary.runs_replayed, 1);
    let last = wait_for_lineage_terminal(&h, retried.run_id).await;
    assert_eq!(last.retry_count, 2);
    assert_eq!(last.status, RunStatus::DeadLettered);

    let page = dlq.list(None, false, Pagination::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].workflow_name, "fail");
    assert!(page.items[0].error.contains("x"));

    // Nothing left to sweep.
    let summary = sweeper.sweep().await;
    assert_eq!(summary.runs_replayed, 0);
}

/// Wait for the child run of `parent` to reach a terminal state.
async fn wait_for_lineage_terminal(
    h: &common::Harness,
    parent: Uuid,
) -> relay_core::RunRecord {
    loop {
        let page = h
            .ledger
            .list_runs(
                RunFilter {
                    parent_run_id: Some(parent),
                    ..Default::default()
                },
                Pagination::default(),
                RunSort::CreatedAtDesc,
            )
            .await
            .unwrap();
        if let Some(child) = page.items.first() {
            if child.status.is_terminal() {
                return child.clone();
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn unknown_handler_is_rejected_without_a_run() {
    let h = harness();

    let result = h.dispatcher.submit_task("nonexistent", json!({})).await;
    assert!(matches!(result, Err(DispatchError::Validation(_))));

    let page = h
        .ledger
        .list_runs(RunFilter::default(), Pagination::default(), RunSort::CreatedAtDesc)
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn idempotency_key_returns_active_run() {
    let h = harness();

    let spec = WorkSpec::task("slow", json!({"millis": 500}))
        .with_idempotency_key("recon-2026-02-02");
    let first = h.dispatcher.submit(spec.clone()).await.unwrap();

    // Same key while the first run is active: same run id, no new run.
    let second = h.dispatcher.submit(spec).await.unwrap();
    assert_eq!(first, second);

    let page = h
        .ledger
        .list_runs(RunFilter::default(), Pagination::default(), RunSort::CreatedAtDesc)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn cancel_running_run() {
    let h = harness();

    let run_id = h
        .dispatcher
        .submit_task("slow", json!({"millis": 10_000}))
        .await
        .unwrap();

    // Wait for it to start.
    loop {
        if h.dispatcher.get_run(run_id).await.unwrap().status == RunStatus::Running {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert!(h.dispatcher.cancel(run_id).await.unwrap());
    let record = h.dispatcher.wait_for_terminal(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn cancel_pending_run_and_terminal_noop() {
    let mut config = relay_core::RelayConfig::default();
    config.worker_pool_size = 1;
    let h = common::harness_with(config);

    // Occupy the single worker, then queue a second run behind it.
    let blocker = h
        .dispatcher
        .submit_task("slow", json!({"millis": 1_000}))
        .await
        .unwrap();
    let queued = h
        .dispatcher
        .submit_task("add", json!({"a": 1, "b": 1}))
        .await
        .unwrap();

    assert!(h.dispatcher.cancel(queued).await.unwrap());
    let record = h.dispatcher.get_run(queued).await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);

    // The blocker completes untouched; cancel on terminal is a no-op.
    let record = h.dispatcher.wait_for_terminal(blocker).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(!h.dispatcher.cancel(blocker).await.unwrap());
    assert!(!h.dispatcher.cancel(Uuid::now_v7()).await.unwrap());
}

#[tokio::test]
async fn outcome_envelope_is_unwrapped() {
    let h = harness();

    // Handlers may return the explicit envelope instead of Err.
    h.registry
        .register(
            relay_core::WorkKind::Task,
            "enveloped_ok",
            relay_core::registry::handler_fn(|_params| async move {
                Ok(serde_json::to_value(relay_core::Outcome::ok(json!({"rows": 5}))).unwrap())
            }),
        )
        .unwrap();
    h.registry
        .register(
            relay_core::WorkKind::Task,
            "enveloped_err",
            relay_core::registry::handler_fn(|_params| async move {
                let out: relay_core::Outcome<serde_json::Value> =
                    relay_core::Outcome::err(relay_core::CoreError::source("bad feed"));
                Ok(serde_json::to_value(out).unwrap())
            }),
        )
        .unwrap();

    let ok_run = h.dispatcher.submit_task("enveloped_ok", json!({})).await.unwrap();
    let record = h.dispatcher.wait_for_terminal(ok_run).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.result, Some(json!({"rows": 5})));

    let err_run = h.dispatcher.submit_task("enveloped_err", json!({})).await.unwrap();
    let record = h.dispatcher.wait_for_terminal(err_run).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_category, Some(ErrorCategory::Source));
}

#[tokio::test]
async fn timeout_fails_with_timeout_category() {
    let h = harness();

    let spec = WorkSpec::task("slow", json!({"millis": 30_000})).with_timeout_seconds(1);
    let run_id = h.dispatcher.submit(spec).await.unwrap();

    let record = h.dispatcher.wait_for_terminal(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_category, Some(ErrorCategory::Timeout));
}

#[tokio::test]
async fn lock_contention_rejects_submission() {
    let h = harness();

    let holder = WorkSpec::task("slow", json!({"millis": 2_000}))
        .with_metadata("lock_key", "etl:daily");
    h.dispatcher.submit(holder).await.unwrap();

    let contender =
        WorkSpec::task("add", json!({"a": 1, "b": 2})).with_metadata("lock_key", "etl:daily");
    let result = h.dispatcher.submit(contender).await;
    assert!(matches!(
        result,
        Err(DispatchError::LockContention { .. })
    ));
}

#[tokio::test]
async fn manual_retry_links_parent_and_increments_count() {
    let h = harness();

    let spec = WorkSpec::task("fail", json!({"message": "once"})).with_max_retries(3);
    let run_id = h.dispatcher.submit(spec).await.unwrap();
    h.dispatcher.wait_for_terminal(run_id).await.unwrap();

    let new_run_id = h.dispatcher.retry(run_id).await.unwrap();
    assert_ne!(new_run_id, run_id);

    let child = h.dispatcher.get_run(new_run_id).await.unwrap();
    assert_eq!(child.spec.parent_run_id, Some(run_id));
    assert_eq!(child.retry_count, 1);
    assert_eq!(child.spec.trigger_source, trigger_source::RETRY);

    // Retrying a completed run is a validation failure.
    h.dispatcher.wait_for_terminal(new_run_id).await.unwrap();
    let ok_run = h
        .dispatcher
        .submit_task("add", json!({"a": 1, "b": 1}))
        .await
        .unwrap();
    h.dispatcher.wait_for_terminal(ok_run).await.unwrap();
    assert!(matches!(
        h.dispatcher.retry(ok_run).await,
        Err(DispatchError::Validation(_))
    ));
}

#[tokio::test]
async fn dlq_replay_and_resolve() {
    let h = harness();
    let dlq = DeadLetterService::new(
        Arc::clone(h.dispatcher.ledger()),
        Arc::clone(&h.dispatcher),
        h.bus.clone(),
    );

    // max_retries = 0 dead-letters on the first failure.
    let spec = WorkSpec::task("fail", json!({"message": "dead"})).with_max_retries(0);
    let run_id = h.dispatcher.submit(spec).await.unwrap();
    let record = h.dispatcher.wait_for_terminal(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::DeadLettered);

    let page = dlq.list(Some("fail"), false, Pagination::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    let entry = &page.items[0];
    assert_eq!(entry.run_id, run_id);

    // A zero replay budget refuses replay; resolve instead.
    assert!(!dlq.can_retry(entry.id).await.unwrap());
    dlq.resolve(entry.id, "oncall").await.unwrap();
    let resolved = dlq.get(entry.id).await.unwrap();
    assert!(resolved.is_resolved());
    assert_eq!(resolved.resolved_by.as_deref(), Some("oncall"));

    // Resolved entries drop out of the default listing.
    let page = dlq.list(None, false, Pagination::default()).await.unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn dlq_replay_creates_linked_run() {
    let h = harness();
    let dlq = DeadLetterService::new(
        Arc::clone(h.dispatcher.ledger()),
        Arc::clone(&h.dispatcher),
        h.bus.clone(),
    );

    let spec = WorkSpec::task("fail", json!({"message": "dead"}))
        .with_max_retries(0);
    let run_id = h.dispatcher.submit(spec).await.unwrap();
    h.dispatcher.wait_for_terminal(run_id).await.unwrap();

    let mut entry = dlq
        .list(None, false, Pagination::default())
        .await
        .unwrap()
        .items
        .remove(0);
    // Grant a replay budget (an operator raising max_retries).
    entry.max_retries = 2;
    h.ledger.update_dead_letter(&entry).await.unwrap();

    let new_run_id = dlq.replay(entry.id).await.unwrap();
    assert_ne!(new_run_id, run_id);

    let child = h.dispatcher.get_run(new_run_id).await.unwrap();
    assert_eq!(child.spec.parent_run_id, Some(run_id));
    assert_eq!(child.spec.trigger_source, trigger_source::DLQ_REPLAY);

    let updated = dlq.get(entry.id).await.unwrap();
    assert_eq!(updated.retry_count, 1);
    assert!(updated.last_retry_at.is_some());
}
