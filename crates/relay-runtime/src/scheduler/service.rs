//! Scheduler service: discover due schedules, lease, dispatch
//!
//! The tick takes `now` as a parameter so tests can drive a simulated clock;
//! the production loop passes `Utc::now()`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use relay_core::bus::EventBus;
use relay_core::event::{event_type, BusEvent, NewEvent};
use relay_core::schedule::{last_run_status, Cadence, Schedule, ScheduleRun};
use relay_core::spec::{trigger_source, WorkSpec};
use relay_core::RelayConfig;
use relay_storage::{Ledger, Pagination, RunFilter, RunSort};

use crate::dispatcher::{DispatchError, Dispatcher};

use super::backend::{SchedulerBackend, SchedulerError, TickFn};

/// Errors inside a single schedule's processing; counted and logged at the
/// tick boundary, never propagated out of `tick`.
#[derive(Debug, thiserror::Error)]
enum ScheduleDispatchError {
    #[error("ledger error: {0}")]
    Ledger(#[from] relay_storage::LedgerError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub dispatched: usize,
    pub skipped_misfire: usize,
    pub skipped_lease: usize,
    pub skipped_max_instances: usize,
    pub errors: usize,
}

/// Discovers due schedules each tick, leases them, and submits their targets
/// through the dispatcher.
pub struct SchedulerService {
    ledger: Arc<dyn Ledger>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<dyn EventBus>,
    instance_id: String,
    lease_seconds: u32,
}

impl SchedulerService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<dyn EventBus>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            dispatcher,
            bus,
            instance_id: config.scheduler_instance_id.clone(),
            lease_seconds: 60,
        })
    }

    /// Attach to a backend and start ticking on the configured cadence.
    pub async fn start(
        self: &Arc<Self>,
        backend: &dyn SchedulerBackend,
        interval: Duration,
    ) -> Result<(), SchedulerError> {
        let service = Arc::clone(self);
        let tick: TickFn = Arc::new(move || {
            let service = Arc::clone(&service);
            Box::pin(async move {
                service.tick(Utc::now()).await;
            })
        });
        backend.start(tick, interval).await
    }

    /// Process every schedule due at `now`, in `(next_run_at, schedule_id)`
    /// order.
    #[instrument(skip(self), fields(instance = %self.instance_id))]
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        let due = match self.ledger.list_due_schedules(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!(%e, "failed to list due schedules");
                summary.errors += 1;
                return summary;
            }
        };
        summary.due = due.len();

        for schedule in due {
            match self.process_schedule(&schedule, now).await {
                Ok(outcome) => match outcome {
                    ScheduleOutcome::Dispatched => summary.dispatched += 1,
                    ScheduleOutcome::SkippedMisfire => summary.skipped_misfire += 1,
                    ScheduleOutcome::SkippedLease => summary.skipped_lease += 1,
                    ScheduleOutcome::SkippedMaxInstances => summary.skipped_max_instances += 1,
                },
                Err(e) => {
                    warn!(schedule = %schedule.name, %e, "schedule dispatch failed");
                    summary.errors += 1;
                    let _ = self
                        .ledger
                        .mark_schedule_run(
                            schedule.schedule_id,
                            now,
                            schedule.compute_next_run(now),
                            last_run_status::ERROR,
                            schedule.enabled,
                        )
                        .await;
                }
            }
        }

        debug!(?summary, "tick complete");
        summary
    }

    async fn process_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, ScheduleDispatchError> {
        // One dispatcher per schedule per lease window.
        let leased = self
            .ledger
            .try_lease_schedule(schedule.schedule_id, &self.instance_id, self.lease_seconds)
            .await?;
        if !leased {
            debug!(schedule = %schedule.name, "lease held elsewhere, skipping");
            return Ok(ScheduleOutcome::SkippedLease);
        }

        let outcome = self.dispatch_leased(schedule, now).await;

        let _ = self
            .ledger
            .release_schedule_lease(schedule.schedule_id, &self.instance_id)
            .await;

        outcome
    }

    async fn dispatch_leased(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, ScheduleDispatchError> {
        let scheduled_at = schedule.next_run_at.unwrap_or(now);
        let next_run_at = schedule.compute_next_run(now);
        // One-shot schedules disable themselves after their moment passes.
        let still_enabled = match schedule.cadence {
            Cadence::OneShot { .. } => false,
            _ => schedule.enabled,
        };

        // Misfire policy: skip. The due time lagged past the grace window,
        // so we advance next_run_at without dispatching.
        if schedule.is_misfired(now) {
            info!(schedule = %schedule.name, "misfire, skipping");
            self.ledger
                .record_schedule_run(&ScheduleRun::skipped(
                    schedule.schedule_id,
                    scheduled_at,
                    last_run_status::SKIPPED_MISFIRE,
                ))
                .await?;
            self.ledger
                .mark_schedule_run(
                    schedule.schedule_id,
                    now,
                    next_run_at,
                    last_run_status::SKIPPED_MISFIRE,
                    still_enabled,
                )
                .await?;
            self.bus
                .publish(BusEvent::new(
                    event_type::SCHEDULE_SKIPPED_MISFIRE,
                    serde_json::json!({
                        "schedule": schedule.name,
                        "scheduled_at": scheduled_at,
                    }),
                ))
                .await;
            return Ok(ScheduleOutcome::SkippedMisfire);
        }

        if self.active_instances(schedule).await? >= schedule.max_instances as usize {
            debug!(schedule = %schedule.name, "max instances reached, skipping");
            self.ledger
                .record_schedule_run(&ScheduleRun::skipped(
                    schedule.schedule_id,
                    scheduled_at,
                    "skipped_max_instances",
                ))
                .await?;
            self.ledger
                .mark_schedule_run(
                    schedule.schedule_id,
                    now,
                    next_run_at,
                    "skipped_max_instances",
                    still_enabled,
                )
                .await?;
            return Ok(ScheduleOutcome::SkippedMaxInstances);
        }

        let spec = WorkSpec::new(
            schedule.target_kind,
            schedule.target_name.clone(),
            schedule.params.clone(),
        )
        .with_trigger_source(trigger_source::SCHEDULER)
        .with_metadata("schedule_id", schedule.schedule_id.to_string())
        .with_metadata("schedule_name", schedule.name.clone());

        let run_id = self.dispatcher.submit(spec).await?;

        self.ledger
            .record_schedule_run(&ScheduleRun::dispatched(
                schedule.schedule_id,
                scheduled_at,
                run_id,
            ))
            .await?;
        self.ledger
            .mark_schedule_run(
                schedule.schedule_id,
                now,
                next_run_at,
                last_run_status::DISPATCHED,
                still_enabled,
            )
            .await?;

        let _ = self
            .ledger
            .record_event(NewEvent::new(
                run_id,
                event_type::SCHEDULE_TRIGGERED,
                serde_json::json!({"schedule": schedule.name, "scheduled_at": scheduled_at}),
            ))
            .await;
        self.bus
            .publish(BusEvent::for_run(
                run_id,
                event_type::SCHEDULE_TRIGGERED,
                serde_json::json!({"schedule": schedule.name}),
            ))
            .await;

        info!(schedule = %schedule.name, %run_id, "dispatched scheduled run");
        Ok(ScheduleOutcome::Dispatched)
    }

    /// Active (pending or running) runs previously spawned by this schedule.
    async fn active_instances(&self, schedule: &Schedule) -> Result<usize, ScheduleDispatchError> {
        let mut active = 0;
        for status in [
            relay_core::RunStatus::Pending,
            relay_core::RunStatus::Running,
        ] {
            let filter = RunFilter {
                status: Some(status),
                name: Some(schedule.target_name.clone()),
                trigger_source: Some(trigger_source::SCHEDULER.to_string()),
                ..Default::default()
            };
            let page = self
                .ledger
                .list_runs(filter, Pagination::new(1, 0), RunSort::CreatedAtDesc)
                .await?;
            active += page.total as usize;
        }
        Ok(active)
    }
}

enum ScheduleOutcome {
    Dispatched,
    SkippedMisfire,
    SkippedLease,
    SkippedMaxInstances,
}

