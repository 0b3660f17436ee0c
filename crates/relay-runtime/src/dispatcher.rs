//! Dispatcher: the single canonical entry point for starting work
//!
//! Every submission goes through [`Dispatcher::submit`] — API, CLI,
//! scheduler ticks, retries, and DLQ replays alike. No other component
//! creates run records.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use relay_core::bus::EventBus;
use relay_core::error::CoreError;
use relay_core::event::{event_type, BusEvent, ExecutionEvent};
use relay_core::registry::Registry;
use relay_core::run::{RunRecord, RunStatus, StatusUpdate};
use relay_core::spec::{trigger_source, WorkSpec};
use relay_storage::{Ledger, LedgerError, Page, Pagination, RunFilter, RunSort};

use crate::executor::{Executor, ExecutorError};

/// Metadata key a spec may set to demand a concurrency-guard lease for the
/// duration of the run.
pub const LOCK_KEY_METADATA: &str = "lock_key";

/// Errors surfaced synchronously at submission.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Spec failed validation; no run was created.
    #[error("validation failed: {0}")]
    Validation(CoreError),

    /// The declared lock key is held by another execution.
    #[error("lock contention on '{lock_key}'")]
    LockContention { lock_key: String },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Validates specs, creates runs, and enqueues them to the executor.
pub struct Dispatcher {
    ledger: Arc<dyn Ledger>,
    registry: Arc<Registry>,
    executor: Arc<dyn Executor>,
    bus: Arc<dyn EventBus>,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<Registry>,
        executor: Arc<dyn Executor>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            registry,
            executor,
            bus,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Submit work for execution. Returns the run id immediately; execution
    /// is asynchronous.
    #[instrument(skip(self, spec), fields(kind = %spec.kind, name = %spec.name))]
    pub async fn submit(&self, spec: WorkSpec) -> Result<Uuid, DispatchError> {
        self.validate(&spec)?;

        // Idempotent submission: an active run with the same key wins.
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.ledger.find_active_run_by_idempotency_key(key).await? {
                debug!(run_id = %existing.run_id, %key, "returning existing active run");
                return Ok(existing.run_id);
            }
        }

        let record = RunRecord::pending(Uuid::now_v7(), spec);
        self.submit_record(record).await
    }

    /// Shared tail of submit/retry/replay: guard, persist, enqueue, publish.
    pub(crate) async fn submit_record(&self, record: RunRecord) -> Result<Uuid, DispatchError> {
        let run_id = record.run_id;
        let spec = record.spec.clone();

        if let Some(lock_key) = spec.metadata.get(LOCK_KEY_METADATA).and_then(|v| v.as_str()) {
            let lease_seconds = spec
                .timeout_seconds
                .unwrap_or(relay_core::spec::DEFAULT_RETRY_DELAY_SECONDS * 10);
            let acquired = self
                .ledger
                .acquire_lock(lock_key, run_id, lease_seconds)
                .await?;
            if !acquired {
                warn!(%lock_key, "submission rejected on lock contention");
                return Err(DispatchError::LockContention {
                    lock_key: lock_key.to_string(),
                });
            }
        }

        self.ledger.create_run(&record).await?;
        self.bus
            .publish(BusEvent::for_run(
                run_id,
                event_type::RUN_CREATED,
                serde_json::json!({
                    "kind": spec.kind.as_str(),
                    "name": spec.name,
                    "trigger_source": spec.trigger_source,
                }),
            ))
            .await;

        self.executor.submit(spec.clone(), run_id).await?;
        info!(%run_id, lane = %spec.lane, "submitted run");
        Ok(run_id)
    }

    /// Submit a leaf task.
    pub async fn submit_task(
        &self,
        name: impl Into<String>,
        params: serde_json::Value,
    ) -> Result<Uuid, DispatchError> {
        self.submit(WorkSpec::task(name, params)).await
    }

    /// Submit an operation.
    pub async fn submit_operation(
        &self,
        name: impl Into<String>,
        params: serde_json::Value,
    ) -> Result<Uuid, DispatchError> {
        self.submit(WorkSpec::operation(name, params)).await
    }

    /// Submit a workflow.
    pub async fn submit_workflow(
        &self,
        name: impl Into<String>,
        params: serde_json::Value,
    ) -> Result<Uuid, DispatchError> {
        self.submit(WorkSpec::workflow(name, params)).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, LedgerError> {
        self.ledger.get_run(run_id).await
    }

    pub async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
        sort: RunSort,
    ) -> Result<Page<RunRecord>, LedgerError> {
        self.ledger.list_runs(filter, pagination, sort).await
    }

    pub async fn get_run_events(
        &self,
        run_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<ExecutionEvent>, LedgerError> {
        self.ledger.get_events(run_id, pagination).await
    }

    /// Cancel a run. Only PENDING and RUNNING runs can be cancelled; cancel
    /// on a terminal run is a no-op returning false.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, LedgerError> {
        let record = match self.ledger.get_run(run_id).await {
            Ok(record) => record,
            Err(LedgerError::RunNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        match record.status {
            RunStatus::Pending => {
                self.ledger
                    .update_status(run_id, RunStatus::Cancelled, StatusUpdate::cancelled_now())
                    .await?;
                self.bus
                    .publish(BusEvent::for_run(
                        run_id,
                        event_type::RUN_CANCELLED,
                        serde_json::json!({"name": record.spec.name}),
                    ))
                    .await;
                Ok(true)
            }
            // The executor observes the token and records the transition.
            RunStatus::Running => Ok(self.executor.cancel(run_id).await),
            _ => Ok(false),
        }
    }

    /// Re-submit a failed or dead-lettered run as a new run with an
    /// incremented retry count and `parent_run_id` linking back.
    #[instrument(skip(self))]
    pub async fn retry(&self, run_id: Uuid) -> Result<Uuid, DispatchError> {
        let record = self.ledger.get_run(run_id).await?;

        if !matches!(
            record.status,
            RunStatus::Failed | RunStatus::DeadLettered
        ) {
            return Err(DispatchError::Validation(CoreError::validation(format!(
                "cannot retry run in status {}",
                record.status
            ))));
        }
        if !record.has_retry_budget() {
            return Err(DispatchError::Validation(CoreError::validation(format!(
                "retry budget exhausted ({}/{})",
                record.retry_count, record.spec.max_retries
            ))));
        }

        let mut spec = record.spec.clone();
        spec.parent_run_id = Some(run_id);
        spec.trigger_source = trigger_source::RETRY.to_string();
        spec.idempotency_key = None;

        let child =
            RunRecord::pending(Uuid::now_v7(), spec).with_retry_count(record.retry_count + 1);
        self.submit_record(child).await
    }

    /// Synchronous facade used by the workflow runner: submit an operation
    /// and poll until terminal.
    pub async fn submit_operation_sync(
        &self,
        name: &str,
        params: serde_json::Value,
        parent_run_id: Uuid,
        correlation_id: Option<Uuid>,
    ) -> Result<RunRecord, DispatchError> {
        let mut spec = WorkSpec::operation(name, params)
            .with_parent_run_id(parent_run_id)
            .with_trigger_source(trigger_source::WORKFLOW);
        spec.correlation_id = correlation_id;

        let run_id = self.submit(spec).await?;
        Ok(self.wait_for_terminal(run_id).await?)
    }

    /// Poll the ledger until the run reaches a terminal status.
    pub async fn wait_for_terminal(&self, run_id: Uuid) -> Result<RunRecord, LedgerError> {
        loop {
            let record = self.ledger.get_run(run_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Spec validation: `(kind, name)` must resolve and params must be a
    /// JSON object (or null).
    fn validate(&self, spec: &WorkSpec) -> Result<(), DispatchError> {
        if spec.name.trim().is_empty() {
            return Err(DispatchError::Validation(CoreError::validation(
                "work name must not be empty",
            )));
        }
        if !self.registry.has(spec.kind, &spec.name) {
            return Err(DispatchError::Validation(
                CoreError::validation(format!(
                    "no registered {} named '{}'",
                    spec.kind, spec.name
                ))
                .with_context("kind", spec.kind.as_str())
                .with_context("name", spec.name.clone()),
            ));
        }
        if !spec.params.is_object() && !spec.params.is_null() {
            return Err(DispatchError::Validation(CoreError::validation(
                "params must be a JSON object",
            )));
        }
        Ok(())
    }
}
