//! Scheduler tick scenarios with a simulated clock

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use relay_core::schedule::{Cadence, Schedule};
use relay_core::spec::{trigger_source, WorkKind};
use relay_runtime::SchedulerService;
use relay_storage::{Ledger, Pagination, RunFilter, RunSort};

use common::{harness, Harness};

fn service(h: &Harness) -> Arc<SchedulerService> {
    SchedulerService::new(
        Arc::clone(h.dispatcher.ledger()),
        Arc::clone(&h.dispatcher),
        h.bus.clone(),
        &h.config,
    )
}

#[tokio::test]
async fn interval_schedule_dispatches_and_advances() {
    let h = harness();
    let service = service(&h);

    let t0 = Utc::now();
    let mut schedule = Schedule::new(
        "s1",
        WorkKind::Operation,
        "etl",
        Cadence::Interval { seconds: 60 },
    )
    .with_params(json!({"tier": "t1"}));
    // Simulate a previously computed due time.
    schedule.next_run_at = Some(t0 + ChronoDuration::seconds(60));
    h.ledger.create_schedule(&schedule).await.unwrap();

    // Not yet due.
    let summary = service.tick(t0).await;
    assert_eq!(summary.due, 0);
    assert_eq!(summary.dispatched, 0);

    // 61 seconds later the schedule fires exactly once.
    let t1 = t0 + ChronoDuration::seconds(61);
    let summary = service.tick(t1).await;
    assert_eq!(summary.due, 1);
    assert_eq!(summary.dispatched, 1);

    let runs = h
        .ledger
        .list_schedule_runs(schedule.schedule_id, Pagination::default())
        .await
        .unwrap();
    assert_eq!(runs.total, 1);
    assert_eq!(runs.items[0].status, "dispatched");

    let page = h
        .ledger
        .list_runs(
            RunFilter {
                trigger_source: Some(trigger_source::SCHEDULER.to_string()),
                ..Default::default()
            },
            Pagination::default(),
            RunSort::CreatedAtDesc,
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].spec.name, "etl");
    assert_eq!(page.items[0].spec.params, json!({"tier": "t1"}));

    let updated = h.ledger.get_schedule(schedule.schedule_id).await.unwrap();
    assert_eq!(updated.last_run_at, Some(t1));
    // Next-run arithmetic anchors on the scheduled time, not the tick time.
    assert_eq!(
        updated.next_run_at,
        Some(t0 + ChronoDuration::seconds(120))
    );
    assert!(updated.next_run_at.unwrap() > schedule.next_run_at.unwrap());

    // The scheduled run completes through the normal pipeline.
    let record = h
        .dispatcher
        .wait_for_terminal(page.items[0].run_id)
        .await
        .unwrap();
    assert_eq!(record.status, relay_core::RunStatus::Completed);
}

#[tokio::test]
async fn misfired_schedule_is_skipped_but_advanced() {
    let h = harness();
    let service = service(&h);

    let now = Utc::now();
    let mut schedule = Schedule::new(
        "stale",
        WorkKind::Operation,
        "etl",
        Cadence::Interval { seconds: 60 },
    )
    .with_misfire_grace_seconds(300);
    schedule.next_run_at = Some(now - ChronoDuration::seconds(400));
    h.ledger.create_schedule(&schedule).await.unwrap();

    let summary = service.tick(now).await;
    assert_eq!(summary.skipped_misfire, 1);
    assert_eq!(summary.dispatched, 0);

    // No run was created, but next_run_at moved past now.
    let page = h
        .ledger
        .list_runs(RunFilter::default(), Pagination::default(), RunSort::CreatedAtDesc)
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    let updated = h.ledger.get_schedule(schedule.schedule_id).await.unwrap();
    assert!(updated.next_run_at.unwrap() > now);
    assert_eq!(updated.last_run_status.as_deref(), Some("skipped_misfire"));

    let runs = h
        .ledger
        .list_schedule_runs(schedule.schedule_id, Pagination::default())
        .await
        .unwrap();
    assert_eq!(runs.items[0].status, "skipped_misfire");
}

#[tokio::test]
async fn leased_schedule_is_skipped() {
    let h = harness();
    let service = service(&h);

    let schedule = Schedule::new(
        "contended",
        WorkKind::Operation,
        "etl",
        Cadence::Interval { seconds: 60 },
    );
    h.ledger.create_schedule(&schedule).await.unwrap();

    // Another instance holds the lease.
    assert!(h
        .ledger
        .try_lease_schedule(schedule.schedule_id, "other-instance", 60)
        .await
        .unwrap());

    let summary = service.tick(Utc::now()).await;
    assert_eq!(summary.skipped_lease, 1);
    assert_eq!(summary.dispatched, 0);
}

#[tokio::test]
async fn one_shot_schedule_fires_once_and_disables() {
    let h = harness();
    let service = service(&h);

    let now = Utc::now();
    let schedule = Schedule::new(
        "once",
        WorkKind::Task,
        "add",
        Cadence::OneShot {
            run_at: now - ChronoDuration::seconds(1),
        },
    )
    .with_params(json!({"a": 2, "b": 2}));
    h.ledger.create_schedule(&schedule).await.unwrap();

    let summary = service.tick(now).await;
    assert_eq!(summary.dispatched, 1);

    let updated = h.ledger.get_schedule(schedule.schedule_id).await.unwrap();
    assert!(!updated.enabled);

    // A later tick finds nothing due.
    let summary = service.tick(now + ChronoDuration::seconds(120)).await;
    assert_eq!(summary.due, 0);
}

#[tokio::test]
async fn max_instances_bounds_concurrent_runs() {
    let h = harness();
    let service = service(&h);

    // A long-running operation the schedule targets.
    h.registry
        .register(
            WorkKind::Operation,
            "long_etl",
            relay_core::registry::handler_fn(|_params| async move {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                Ok(json!({}))
            }),
        )
        .unwrap();

    let schedule = Schedule::new(
        "bounded",
        WorkKind::Operation,
        "long_etl",
        Cadence::Interval { seconds: 60 },
    )
    .with_max_instances(1);
    h.ledger.create_schedule(&schedule).await.unwrap();

    let t0 = Utc::now();
    let summary = service.tick(t0).await;
    assert_eq!(summary.dispatched, 1);

    // The schedule is due again on the simulated clock while the first run
    // is still executing on the wall clock.
    let summary = service.tick(t0 + ChronoDuration::seconds(61)).await;
    assert_eq!(summary.due, 1);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.skipped_max_instances, 1);

    let page = h
        .ledger
        .list_runs(RunFilter::default(), Pagination::default(), RunSort::CreatedAtDesc)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn tick_with_nothing_due_does_nothing() {
    let h = harness();
    let service = service(&h);

    let summary = service.tick(Utc::now()).await;
    assert_eq!(summary.due, 0);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.errors, 0);

    let page = h
        .ledger
        .list_runs(RunFilter::default(), Pagination::default(), RunSort::CreatedAtDesc)
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}
