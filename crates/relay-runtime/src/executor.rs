//! Executor: runs one handler to completion against a WorkSpec
//!
//! The default in-process implementation keeps one FIFO queue and a fixed
//! worker pool per lane. Workers transition the run through the ledger,
//! enforce the wall-clock timeout, observe cooperative cancellation, and
//! hand exhausted failures to the dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use relay_core::bus::EventBus;
use relay_core::dlq::DeadLetter;
use relay_core::error::CoreError;
use relay_core::event::{event_type, BusEvent, NewEvent};
use relay_core::outcome::Outcome;
use relay_core::registry::{HandlerContext, Registry};
use relay_core::run::{RunStatus, StatusUpdate};
use relay_core::spec::WorkSpec;
use relay_core::RelayConfig;
use relay_storage::{Ledger, LedgerError};

/// Errors from executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("executor is shut down")]
    ShutDown,
}

/// Runs a single handler to completion, producing a terminal run record.
///
/// A single executor instance honours FIFO per lane; across lanes no
/// ordering is promised.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Enqueue a run for execution. Returns once the run is queued, not once
    /// it finishes.
    async fn submit(&self, spec: WorkSpec, run_id: Uuid) -> Result<(), ExecutorError>;

    /// Request cooperative cancellation of a running run. Returns false when
    /// the run is not currently executing (racing completion is a no-op).
    async fn cancel(&self, run_id: Uuid) -> bool;
}

enum HandlerOutcome {
    Completed(serde_json::Value),
    Cancelled,
    Failed(CoreError),
}

/// Handlers may return their payload wrapped in the explicit
/// success/failure envelope; the executor accepts either pattern.
fn unwrap_envelope(value: serde_json::Value) -> HandlerOutcome {
    if value.get("ok").is_some() {
        if let Ok(outcome) = serde_json::from_value::<Outcome<serde_json::Value>>(value.clone()) {
            return match outcome {
                Outcome::Ok { value } => HandlerOutcome::Completed(value),
                Outcome::Err { error } => HandlerOutcome::Failed(error),
            };
        }
    }
    HandlerOutcome::Completed(value)
}

struct ExecutorInner {
    ledger: Arc<dyn Ledger>,
    registry: Arc<Registry>,
    bus: Arc<dyn EventBus>,
    config: RelayConfig,
    lanes: DashMap<String, mpsc::UnboundedSender<(WorkSpec, Uuid)>>,
    running: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

/// In-process executor with per-lane worker pools.
///
/// Cheap to clone; clones share the same lanes and worker pools.
///
/// # Example
///
/// ```ignore
/// let executor = LocalExecutor::new(ledger, registry, bus, &config);
/// executor.submit(spec, run_id).await?;
/// ```
#[derive(Clone)]
pub struct LocalExecutor {
    inner: Arc<ExecutorInner>,
}

impl LocalExecutor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<Registry>,
        bus: Arc<dyn EventBus>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                ledger,
                registry,
                bus,
                config: config.clone(),
                lanes: DashMap::new(),
                running: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Number of runs currently executing (all lanes).
    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    /// Stop accepting work and cancel in-flight runs.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.running.iter() {
            entry.value().cancel();
        }
        self.inner.lanes.clear();
        info!("executor shut down");
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn submit(&self, spec: WorkSpec, run_id: Uuid) -> Result<(), ExecutorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ExecutorError::ShutDown);
        }

        let sender = self.inner.lane_sender(&spec.lane);
        sender
            .send((spec, run_id))
            .map_err(|_| ExecutorError::ShutDown)?;
        Ok(())
    }

    async fn cancel(&self, run_id: Uuid) -> bool {
        match self.inner.running.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl ExecutorInner {
    /// Ensure the lane's worker pool exists, spawning it on first use.
    fn lane_sender(self: &Arc<Self>, lane: &str) -> mpsc::UnboundedSender<(WorkSpec, Uuid)> {
        self.lanes
            .entry(lane.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel::<(WorkSpec, Uuid)>();
                let receiver = Arc::new(Mutex::new(receiver));
                let workers = self.config.lane_size(lane);

                for worker_index in 0..workers {
                    let inner = Arc::clone(self);
                    let receiver = Arc::clone(&receiver);
                    let lane_name = lane.to_string();
                    tokio::spawn(async move {
                        loop {
                            let next = {
                                let mut guard = receiver.lock().await;
                                tokio::select! {
                                    item = guard.recv() => item,
                                    _ = inner.shutdown.cancelled() => None,
                                }
                            };
                            let Some((spec, run_id)) = next else {
                                break;
                            };
                            inner.execute_one(spec, run_id).await;
                        }
                        debug!(lane = %lane_name, worker_index, "lane worker stopped");
                    });
                }

                debug!(%lane, workers, "started lane worker pool");
                sender
            })
            .clone()
    }

    /// Run one handler to a terminal state, recording everything on the way.
    #[instrument(skip(self, spec), fields(name = %spec.name, lane = %spec.lane))]
    async fn execute_one(&self, spec: WorkSpec, run_id: Uuid) {
        // The run may have been cancelled while queued.
        match self.ledger.get_run(run_id).await {
            Ok(record) if record.status == RunStatus::Pending => {}
            Ok(record) => {
                debug!(status = %record.status, "skipping non-pending run");
                return;
            }
            Err(e) => {
                error!(%e, "failed to load run before execution");
                return;
            }
        }

        if self
            .ledger
            .update_status(run_id, RunStatus::Running, StatusUpdate::started_now())
            .await
            .is_err()
        {
            // Lost the race against a cancel; nothing to execute.
            return;
        }
        self.bus
            .publish(BusEvent::for_run(
                run_id,
                event_type::RUN_STARTED,
                serde_json::json!({"name": spec.name}),
            ))
            .await;

        let token = CancellationToken::new();
        self.running.insert(run_id, token.clone());

        let outcome = self.invoke_handler(&spec, run_id, token).await;
        self.running.remove(&run_id);

        match outcome {
            HandlerOutcome::Completed(result) => {
                if let Err(e) = self
                    .ledger
                    .update_status(run_id, RunStatus::Completed, StatusUpdate::completed(result))
                    .await
                {
                    error!(%e, "failed to record completion");
                    return;
                }
                self.bus
                    .publish(BusEvent::for_run(
                        run_id,
                        event_type::RUN_COMPLETED,
                        serde_json::json!({"name": spec.name}),
                    ))
                    .await;
                self.release_guard_key(&spec, run_id).await;
            }
            HandlerOutcome::Cancelled => {
                if let Err(e) = self
                    .ledger
                    .update_status(run_id, RunStatus::Cancelled, StatusUpdate::cancelled_now())
                    .await
                {
                    warn!(%e, "failed to record cancellation");
                    return;
                }
                self.bus
                    .publish(BusEvent::for_run(
                        run_id,
                        event_type::RUN_CANCELLED,
                        serde_json::json!({"name": spec.name}),
                    ))
                    .await;
                self.release_guard_key(&spec, run_id).await;
            }
            HandlerOutcome::Failed(error) => {
                self.handle_failure(&spec, run_id, error).await;
                self.release_guard_key(&spec, run_id).await;
            }
        }
    }

    /// Invoke the handler under timeout and cancellation.
    async fn invoke_handler(
        &self,
        spec: &WorkSpec,
        run_id: Uuid,
        token: CancellationToken,
    ) -> HandlerOutcome {
        let Some(handler) = self.registry.get(spec.kind, &spec.name) else {
            // Validated at submission; losing the handler afterwards is an
            // invariant violation.
            return HandlerOutcome::Failed(
                CoreError::internal(format!(
                    "handler {}/{} disappeared from registry",
                    spec.kind, spec.name
                ))
                .with_context("run_id", run_id.to_string()),
            );
        };

        let ctx = HandlerContext::with_cancellation(run_id, token.clone());
        let invocation = handler.invoke_with_context(ctx, spec.params.clone());

        let timeout = spec
            .timeout_seconds
            .map(u64::from)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(u64::from(self.config.default_timeout_seconds)));

        tokio::select! {
            // Cancellation wins a race against simultaneous completion.
            biased;
            _ = token.cancelled() => HandlerOutcome::Cancelled,
            result = tokio::time::timeout(timeout, invocation) => match result {
                Ok(Ok(value)) => unwrap_envelope(value),
                Ok(Err(error)) => HandlerOutcome::Failed(error),
                Err(_elapsed) => HandlerOutcome::Failed(
                    CoreError::timeout(format!(
                        "run exceeded {}s wall-clock limit",
                        timeout.as_secs()
                    ))
                    .with_context("timeout_seconds", timeout.as_secs()),
                ),
            },
        }
    }

    /// Record a failure and dead-letter the run when the budget is spent.
    async fn handle_failure(&self, spec: &WorkSpec, run_id: Uuid, error: CoreError) {
        warn!(%run_id, category = %error.category, "run failed: {}", error.message);

        let record = match self
            .ledger
            .update_status(run_id, RunStatus::Failed, StatusUpdate::failed(&error))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(%e, "failed to record failure");
                return;
            }
        };
        self.bus
            .publish(BusEvent::for_run(
                run_id,
                event_type::RUN_FAILED,
                serde_json::json!({
                    "name": spec.name,
                    "error": error.message,
                    "category": error.category.as_str(),
                }),
            ))
            .await;

        if record.has_retry_budget() {
            // A retry sweeper (or an operator) re-submits; nothing more here.
            return;
        }

        let dead_letter = DeadLetter::capture(
            run_id,
            spec.name.clone(),
            spec.params.clone(),
            error.message.clone(),
            spec.max_retries,
        );
        match self.ledger.record_dead_letter(&dead_letter).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(%run_id, "dead letter already recorded");
                return;
            }
            Err(e) => {
                error!(%e, "failed to record dead letter");
                return;
            }
        }

        if let Err(e) = self
            .ledger
            .update_status(run_id, RunStatus::DeadLettered, StatusUpdate::none())
            .await
        {
            error!(%e, "failed to mark run dead-lettered");
        }
        let _ = self
            .ledger
            .record_event(NewEvent::new(
                run_id,
                event_type::DLQ_RECORDED,
                serde_json::json!({"dead_letter_id": dead_letter.id}),
            ))
            .await;
        self.bus
            .publish(BusEvent::for_run(
                run_id,
                event_type::RUN_DEAD_LETTERED,
                serde_json::json!({"name": spec.name, "dead_letter_id": dead_letter.id}),
            ))
            .await;
        self.bus
            .publish(BusEvent::for_run(
                run_id,
                event_type::DLQ_RECORDED,
                serde_json::json!({"dead_letter_id": dead_letter.id}),
            ))
            .await;
    }

    /// Release the guard key declared in metadata, if any.
    async fn release_guard_key(&self, spec: &WorkSpec, run_id: Uuid) {
        let Some(lock_key) = spec
            .metadata
            .get(crate::dispatcher::LOCK_KEY_METADATA)
            .and_then(|v| v.as_str())
        else {
            return;
        };
        if let Err(e) = self.ledger.release_lock(lock_key, Some(run_id)).await {
            warn!(%e, %lock_key, "failed to release concurrency lock");
        }
    }
}
