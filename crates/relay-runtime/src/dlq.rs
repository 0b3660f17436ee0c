//! Dead-letter queue service and the auto-retry sweeper
//!
//! The DLQ captures terminal failures beyond the retry budget (the executor
//! writes the rows); this service exposes inspection and controlled replay.
//! The sweeper re-submits failed runs that still have budget, and optionally
//! replays retriable dead letters, bounded per pass to avoid storms.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use relay_core::bus::EventBus;
use relay_core::dlq::DeadLetter;
use relay_core::event::{event_type, BusEvent, NewEvent};
use relay_storage::{Ledger, LedgerError, Page, Pagination};

use crate::dispatcher::{DispatchError, Dispatcher};

/// Errors from DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Replay refused: resolved, or replay budget exhausted.
    #[error("dead letter {0} cannot be replayed")]
    NotRetriable(Uuid),
}

/// Inspection and controlled replay of dead letters.
pub struct DeadLetterService {
    ledger: Arc<dyn Ledger>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<dyn EventBus>,
}

impl DeadLetterService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            bus,
        }
    }

    pub async fn list(
        &self,
        workflow: Option<&str>,
        include_resolved: bool,
        pagination: Pagination,
    ) -> Result<Page<DeadLetter>, DlqError> {
        Ok(self
            .ledger
            .list_dead_letters(workflow, include_resolved, pagination)
            .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<DeadLetter, DlqError> {
        Ok(self.ledger.get_dead_letter(id).await?)
    }

    /// Whether a replay is still allowed for this dead letter.
    pub async fn can_retry(&self, id: Uuid) -> Result<bool, DlqError> {
        Ok(self.ledger.get_dead_letter(id).await?.can_retry())
    }

    /// Replay: submit a new run with the original spec, linked by
    /// `parent_run_id`, and bump the dead letter's retry counter.
    #[instrument(skip(self))]
    pub async fn replay(&self, id: Uuid) -> Result<Uuid, DlqError> {
        let mut dead_letter = self.ledger.get_dead_letter(id).await?;
        if !dead_letter.can_retry() {
            return Err(DlqError::NotRetriable(id));
        }

        let original = self.ledger.get_run(dead_letter.run_id).await?;
        let mut spec = original.spec.clone();
        spec.parent_run_id = Some(dead_letter.run_id);
        spec.trigger_source = relay_core::spec::trigger_source::DLQ_REPLAY.to_string();
        spec.idempotency_key = None;

        let record = relay_core::RunRecord::pending(Uuid::now_v7(), spec)
            .with_retry_count(original.retry_count + 1);
        let new_run_id = self.dispatcher.submit_record(record).await?;

        dead_letter.retry_count += 1;
        dead_letter.last_retry_at = Some(Utc::now());
        self.ledger.update_dead_letter(&dead_letter).await?;

        let _ = self
            .ledger
            .record_event(NewEvent::new(
                new_run_id,
                event_type::DLQ_REPLAYED,
                serde_json::json!({
                    "dead_letter_id": id,
                    "original_run_id": dead_letter.run_id,
                }),
            ))
            .await;
        self.bus
            .publish(BusEvent::for_run(
                new_run_id,
                event_type::DLQ_REPLAYED,
                serde_json::json!({"dead_letter_id": id}),
            ))
            .await;

        info!(%id, %new_run_id, "replayed dead letter");
        Ok(new_run_id)
    }

    /// Mark a dead letter handled without replaying it.
    #[instrument(skip(self))]
    pub async fn resolve(&self, id: Uuid, resolved_by: &str) -> Result<(), DlqError> {
        let mut dead_letter = self.ledger.get_dead_letter(id).await?;
        if dead_letter.is_resolved() {
            return Ok(());
        }

        dead_letter.resolved_at = Some(Utc::now());
        dead_letter.resolved_by = Some(resolved_by.to_string());
        self.ledger.update_dead_letter(&dead_letter).await?;

        self.bus
            .publish(BusEvent::for_run(
                dead_letter.run_id,
                event_type::DLQ_RESOLVED,
                serde_json::json!({"dead_letter_id": id, "resolved_by": resolved_by}),
            ))
            .await;

        info!(%id, resolved_by, "resolved dead letter");
        Ok(())
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub runs_replayed: usize,
    pub dead_letters_replayed: usize,
    pub errors: usize,
}

/// Cadence-driven replays of failed runs with budget left, bounded per pass.
pub struct RetrySweeper {
    ledger: Arc<dyn Ledger>,
    dispatcher: Arc<Dispatcher>,
    dlq: Arc<DeadLetterService>,
    batch_size: u32,
    replay_dead_letters: bool,
}

impl RetrySweeper {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dispatcher: Arc<Dispatcher>,
        dlq: Arc<DeadLetterService>,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            dlq,
            batch_size: 10,
            replay_dead_letters: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Also replay retriable dead letters each sweep.
    pub fn with_dead_letter_replay(mut self, enabled: bool) -> Self {
        self.replay_dead_letters = enabled;
        self
    }

    /// One sweep: replay failed runs with budget and no successor, then
    /// (optionally) retriable dead letters.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        match self.ledger.list_retry_candidates(self.batch_size).await {
            Ok(candidates) => {
                for candidate in candidates {
                    match self.dispatcher.retry(candidate.run_id).await {
                        Ok(new_run_id) => {
                            debug!(original = %candidate.run_id, %new_run_id, "auto-retried run");
                            summary.runs_replayed += 1;
                        }
                        Err(DispatchError::Validation(e)) => {
                            // Budget raced away between listing and retry.
                            debug!(run_id = %candidate.run_id, %e, "retry no longer eligible");
                        }
                        Err(e) => {
                            warn!(run_id = %candidate.run_id, %e, "auto-retry failed");
                            summary.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%e, "failed to list retry candidates");
                summary.errors += 1;
            }
        }

        if self.replay_dead_letters {
            let page = self
                .ledger
                .list_dead_letters(None, false, Pagination::new(self.batch_size, 0))
                .await;
            match page {
                Ok(page) => {
                    for dead_letter in page.items.into_iter().filter(DeadLetter::can_retry) {
                        match self.dlq.replay(dead_letter.id).await {
                            Ok(_) => summary.dead_letters_replayed += 1,
                            Err(DlqError::NotRetriable(_)) => {}
                            Err(e) => {
                                warn!(id = %dead_letter.id, %e, "dead letter replay failed");
                                summary.errors += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(%e, "failed to list dead letters");
                    summary.errors += 1;
                }
            }
        }

        summary
    }
}
