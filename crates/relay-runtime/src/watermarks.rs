//! Watermark and backfill services
//!
//! Thin orchestration over the ledger's watermark and plan stores: every
//! mutation is persisted and announced on the bus.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use relay_core::backfill::{BackfillPlan, BackfillReason};
use relay_core::bus::EventBus;
use relay_core::error::CoreError;
use relay_core::event::{event_type, BusEvent};
use relay_core::watermark::{Watermark, WatermarkGap};
use relay_storage::{Ledger, LedgerError, Page, Pagination};

/// Errors from watermark/backfill operations.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Plan lifecycle violation (start twice, mark unknown partition, ...).
    #[error(transparent)]
    Plan(#[from] CoreError),
}

/// Forward-only progress markers per `(domain, source, partition_key)`.
pub struct WatermarkService {
    ledger: Arc<dyn Ledger>,
    bus: Arc<dyn EventBus>,
}

impl WatermarkService {
    pub fn new(ledger: Arc<dyn Ledger>, bus: Arc<dyn EventBus>) -> Self {
        Self { ledger, bus }
    }

    /// Advance the watermark; stale values leave it unchanged. Publishes
    /// `watermark.advanced` only when the high water actually moved.
    #[instrument(skip(self))]
    pub async fn advance(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        high_water: &str,
    ) -> Result<Watermark, ProgressError> {
        let watermark = self
            .ledger
            .advance_watermark(domain, source, partition_key, high_water)
            .await?;

        if watermark.high_water == high_water {
            self.bus
                .publish(BusEvent::new(
                    event_type::WATERMARK_ADVANCED,
                    serde_json::json!({
                        "domain": domain,
                        "source": source,
                        "partition_key": partition_key,
                        "high_water": high_water,
                    }),
                ))
                .await;
        }
        Ok(watermark)
    }

    pub async fn get(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, ProgressError> {
        Ok(self.ledger.get_watermark(domain, source, partition_key).await?)
    }

    pub async fn list_all(&self, domain: Option<&str>) -> Result<Vec<Watermark>, ProgressError> {
        Ok(self.ledger.list_watermarks(domain).await?)
    }

    pub async fn delete(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<bool, ProgressError> {
        Ok(self
            .ledger
            .delete_watermark(domain, source, partition_key)
            .await?)
    }

    /// Expected partitions with no watermark; feeds backfill planning.
    pub async fn list_gaps(
        &self,
        domain: &str,
        source: &str,
        expected_partitions: &[String],
    ) -> Result<Vec<WatermarkGap>, ProgressError> {
        Ok(self
            .ledger
            .list_watermark_gaps(domain, source, expected_partitions)
            .await?)
    }
}

/// Structured, resumable backfill plans persisted through the ledger.
pub struct BackfillService {
    ledger: Arc<dyn Ledger>,
    bus: Arc<dyn EventBus>,
}

impl BackfillService {
    pub fn new(ledger: Arc<dyn Ledger>, bus: Arc<dyn EventBus>) -> Self {
        Self { ledger, bus }
    }

    /// Create a PLANNED plan.
    #[instrument(skip(self, partition_keys))]
    pub async fn create(
        &self,
        domain: &str,
        source: &str,
        reason: BackfillReason,
        partition_keys: Vec<String>,
        created_by: &str,
    ) -> Result<BackfillPlan, ProgressError> {
        let plan = BackfillPlan::create(domain, source, reason, partition_keys, created_by);
        self.ledger.save_backfill_plan(&plan).await?;

        self.publish_plan_event(event_type::BACKFILL_PLANNED, &plan).await;
        info!(plan_id = %plan.plan_id, %domain, "created backfill plan");
        Ok(plan)
    }

    pub async fn get(&self, plan_id: Uuid) -> Result<BackfillPlan, ProgressError> {
        Ok(self.ledger.get_backfill_plan(plan_id).await?)
    }

    pub async fn list(
        &self,
        domain: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<BackfillPlan>, ProgressError> {
        Ok(self.ledger.list_backfill_plans(domain, pagination).await?)
    }

    /// PLANNED → RUNNING.
    #[instrument(skip(self))]
    pub async fn start(&self, plan_id: Uuid) -> Result<BackfillPlan, ProgressError> {
        let mut plan = self.ledger.get_backfill_plan(plan_id).await?;
        plan.start()?;
        self.ledger.save_backfill_plan(&plan).await?;

        self.publish_plan_event(event_type::BACKFILL_STARTED, &plan).await;
        Ok(plan)
    }

    /// Mark one partition done; settles the terminal status when it was the
    /// last open partition.
    #[instrument(skip(self))]
    pub async fn mark_partition_done(
        &self,
        plan_id: Uuid,
        partition_key: &str,
    ) -> Result<BackfillPlan, ProgressError> {
        let mut plan = self.ledger.get_backfill_plan(plan_id).await?;
        plan.mark_partition_done(partition_key)?;
        self.ledger.save_backfill_plan(&plan).await?;

        self.bus
            .publish(BusEvent::new(
                event_type::BACKFILL_PARTITION_DONE,
                serde_json::json!({
                    "plan_id": plan_id,
                    "partition_key": partition_key,
                    "progress_pct": plan.progress_pct(),
                }),
            ))
            .await;
        if plan.status == relay_core::BackfillStatus::Completed {
            self.publish_plan_event(event_type::BACKFILL_COMPLETED, &plan).await;
        }
        Ok(plan)
    }

    /// Mark one partition failed with an error message.
    #[instrument(skip(self))]
    pub async fn mark_partition_failed(
        &self,
        plan_id: Uuid,
        partition_key: &str,
        error: &str,
    ) -> Result<BackfillPlan, ProgressError> {
        let mut plan = self.ledger.get_backfill_plan(plan_id).await?;
        plan.mark_partition_failed(partition_key, error)?;
        self.ledger.save_backfill_plan(&plan).await?;
        Ok(plan)
    }

    /// Save an opaque resume token on the plan.
    #[instrument(skip(self, token))]
    pub async fn save_checkpoint(
        &self,
        plan_id: Uuid,
        token: &str,
    ) -> Result<BackfillPlan, ProgressError> {
        let mut plan = self.ledger.get_backfill_plan(plan_id).await?;
        plan.save_checkpoint(token);
        self.ledger.save_backfill_plan(&plan).await?;
        Ok(plan)
    }

    /// Resume an interrupted plan.
    #[instrument(skip(self))]
    pub async fn resume(&self, plan_id: Uuid) -> Result<BackfillPlan, ProgressError> {
        let mut plan = self.ledger.get_backfill_plan(plan_id).await?;
        plan.resume()?;
        self.ledger.save_backfill_plan(&plan).await?;
        Ok(plan)
    }

    /// Cancel a non-terminal plan.
    #[instrument(skip(self))]
    pub async fn cancel(&self, plan_id: Uuid) -> Result<BackfillPlan, ProgressError> {
        let mut plan = self.ledger.get_backfill_plan(plan_id).await?;
        plan.cancel()?;
        self.ledger.save_backfill_plan(&plan).await?;

        self.publish_plan_event(event_type::BACKFILL_CANCELLED, &plan).await;
        Ok(plan)
    }

    async fn publish_plan_event(&self, event: &str, plan: &BackfillPlan) {
        self.bus
            .publish(BusEvent::new(
                event,
                serde_json::json!({
                    "plan_id": plan.plan_id,
                    "domain": plan.domain,
                    "source": plan.source,
                    "status": plan.status.as_str(),
                }),
            ))
            .await;
    }
}
