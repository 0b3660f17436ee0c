//! Ledger trait definition
//!
//! The ledger is the persisted source of truth for runs, events, schedules,
//! locks, dead letters, watermarks, backfill plans, and sources.
//! Implementations must be thread-safe; row-level writes are atomic and
//! multi-row transitions use transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use relay_core::dlq::DeadLetter;
use relay_core::event::{ExecutionEvent, NewEvent};
use relay_core::lock::ConcurrencyLock;
use relay_core::run::{RunRecord, RunStatus, StatusUpdate};
use relay_core::schedule::{Schedule, ScheduleRun};
use relay_core::source::{Source, SourceFetch};
use relay_core::spec::WorkKind;
use relay_core::watermark::{Watermark, WatermarkGap};
use relay_core::BackfillPlan;

/// Error type for ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    #[error("backfill plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("source not found: {0}")]
    SourceNotFound(Uuid),

    /// Status change violates the run state machine.
    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    /// Unique-name constraint violated (schedules, sources).
    #[error("name already exists: {0}")]
    DuplicateName(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}

/// One page of results with the total count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        Self {
            items,
            total,
            limit: pagination.limit,
            offset: pagination.offset,
        }
    }

    /// Whether rows exist beyond this page.
    pub fn has_more(&self) -> bool {
        u64::from(self.offset) + (self.items.len() as u64) < self.total
    }
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub kind: Option<WorkKind>,
    pub name: Option<String>,
    pub lane: Option<String>,
    pub trigger_source: Option<String>,
    pub parent_run_id: Option<Uuid>,
}

impl RunFilter {
    pub fn by_status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Whether a record passes the filter.
    pub fn matches(&self, record: &RunRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.kind.is_none_or(|k| record.spec.kind == k)
            && self
                .name
                .as_deref()
                .is_none_or(|n| record.spec.name == n)
            && self
                .lane
                .as_deref()
                .is_none_or(|l| record.spec.lane == l)
            && self
                .trigger_source
                .as_deref()
                .is_none_or(|t| record.spec.trigger_source == t)
            && self
                .parent_run_id
                .is_none_or(|p| record.spec.parent_run_id == Some(p))
    }
}

/// Sort order for run listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunSort {
    /// Newest first (default).
    #[default]
    CreatedAtDesc,
    Status,
    Name,
}

/// Persisted source of truth for all execution state.
///
/// Every status change on a run appends a matching execution event in the
/// same logical transaction, so the event stream is a complete audit trail.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    // =========================================================================
    // Runs
    // =========================================================================

    /// Persist a new PENDING run.
    async fn create_run(&self, record: &RunRecord) -> Result<(), LedgerError>;

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, LedgerError>;

    /// Apply a status transition.
    ///
    /// Illegal transitions fail with [`LedgerError::InvalidTransition`]. The
    /// matching lifecycle event (`run.started`, `run.completed`, ...) is
    /// recorded atomically with the change.
    async fn update_status(
        &self,
        run_id: Uuid,
        new_status: RunStatus,
        update: StatusUpdate,
    ) -> Result<RunRecord, LedgerError>;

    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
        sort: RunSort,
    ) -> Result<Page<RunRecord>, LedgerError>;

    /// An active (PENDING or RUNNING) run with this idempotency key, if any.
    async fn find_active_run_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RunRecord>, LedgerError>;

    /// FAILED runs with retry budget left and no successor run, oldest
    /// first. Budget is the only gate: an explicit `max_retries` on the spec
    /// opts the run into replay regardless of error category.
    async fn list_retry_candidates(&self, limit: u32) -> Result<Vec<RunRecord>, LedgerError>;

    /// Delete terminal runs (and their events, by cascade) older than the
    /// cutoff. Active runs are never touched.
    async fn purge_old_data(&self, older_than_days: u32) -> Result<u64, LedgerError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Append an event. Returns `None` when the idempotency key was already
    /// recorded (silent dedupe).
    async fn record_event(&self, event: NewEvent) -> Result<Option<ExecutionEvent>, LedgerError>;

    /// Events for a run, ordered by `event_id`.
    async fn get_events(
        &self,
        run_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<ExecutionEvent>, LedgerError>;

    // =========================================================================
    // Schedules
    // =========================================================================

    /// Create a schedule; names are unique.
    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), LedgerError>;

    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule, LedgerError>;

    async fn get_schedule_by_name(&self, name: &str) -> Result<Option<Schedule>, LedgerError>;

    /// Replace a schedule row, bumping its version.
    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule, LedgerError>;

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, LedgerError>;

    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<Schedule>, LedgerError>;

    /// Enabled schedules due at `now`, ordered `(next_run_at ASC, schedule_id
    /// ASC)` with never-run schedules first.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, LedgerError>;

    /// Record a dispatch on the schedule row. `next_run_at` only moves
    /// forward; a stale value is ignored in favour of the stored one.
    async fn mark_schedule_run(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        last_run_status: &str,
        enabled: bool,
    ) -> Result<Schedule, LedgerError>;

    async fn record_schedule_run(&self, run: &ScheduleRun) -> Result<(), LedgerError>;

    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<ScheduleRun>, LedgerError>;

    // =========================================================================
    // Schedule leases
    // =========================================================================

    /// Take (or refresh, for the same holder) the dispatch lease on a
    /// schedule. Returns false when another holder has a valid lease.
    async fn try_lease_schedule(
        &self,
        schedule_id: Uuid,
        holder: &str,
        lease_seconds: u32,
    ) -> Result<bool, LedgerError>;

    /// Release a lease held by `holder`. Returns whether a row was removed.
    async fn release_schedule_lease(
        &self,
        schedule_id: Uuid,
        holder: &str,
    ) -> Result<bool, LedgerError>;

    // =========================================================================
    // Concurrency locks
    // =========================================================================

    /// Atomically acquire the lock: insert when absent, steal when expired,
    /// reenter when held by the same execution.
    async fn acquire_lock(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError>;

    /// Release; `execution_id = None` force-releases any holder.
    async fn release_lock(
        &self,
        lock_key: &str,
        execution_id: Option<Uuid>,
    ) -> Result<bool, LedgerError>;

    /// Extend a lock held by `execution_id`.
    async fn extend_lock(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError>;

    /// Batch-delete expired lock rows.
    async fn cleanup_expired_locks(&self) -> Result<u64, LedgerError>;

    async fn get_lock(&self, lock_key: &str) -> Result<Option<ConcurrencyLock>, LedgerError>;

    // =========================================================================
    // Dead letters
    // =========================================================================

    /// Capture a dead letter. Idempotent on `run_id`: returns false when the
    /// run is already captured.
    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<bool, LedgerError>;

    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, LedgerError>;

    async fn list_dead_letters(
        &self,
        workflow: Option<&str>,
        include_resolved: bool,
        pagination: Pagination,
    ) -> Result<Page<DeadLetter>, LedgerError>;

    /// Persist retry-count / resolution changes.
    async fn update_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), LedgerError>;

    // =========================================================================
    // Watermarks
    // =========================================================================

    /// Forward-only advance (creates the row when missing). When the new
    /// value is at or below the current high water, the stored watermark is
    /// returned unchanged.
    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        high_water: &str,
    ) -> Result<Watermark, LedgerError>;

    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, LedgerError>;

    async fn list_watermarks(&self, domain: Option<&str>) -> Result<Vec<Watermark>, LedgerError>;

    async fn delete_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<bool, LedgerError>;

    /// Expected partitions with no watermark under `(domain, source)`.
    async fn list_watermark_gaps(
        &self,
        domain: &str,
        source: &str,
        expected_partitions: &[String],
    ) -> Result<Vec<WatermarkGap>, LedgerError>;

    // =========================================================================
    // Backfill plans
    // =========================================================================

    /// Insert or replace a plan (plans are saved whole after each mutation).
    async fn save_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), LedgerError>;

    async fn get_backfill_plan(&self, plan_id: Uuid) -> Result<BackfillPlan, LedgerError>;

    async fn list_backfill_plans(
        &self,
        domain: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<BackfillPlan>, LedgerError>;

    // =========================================================================
    // Sources
    // =========================================================================

    /// Create a source; names are unique.
    async fn create_source(&self, source: &Source) -> Result<(), LedgerError>;

    async fn get_source(&self, id: Uuid) -> Result<Source, LedgerError>;

    async fn get_source_by_name(&self, name: &str) -> Result<Option<Source>, LedgerError>;

    async fn list_sources(&self, domain: Option<&str>) -> Result<Vec<Source>, LedgerError>;

    async fn set_source_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, LedgerError>;

    async fn record_source_fetch(&self, fetch: &SourceFetch) -> Result<(), LedgerError>;

    /// Fetch history for a source, newest first.
    async fn list_source_fetches(
        &self,
        source_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<SourceFetch>, LedgerError>;

    /// Last successful content hash for a source, if any.
    async fn get_cached_content_hash(
        &self,
        source_id: Uuid,
    ) -> Result<Option<String>, LedgerError>;

    /// Upsert the cached content hash for a source.
    async fn put_cached_content_hash(
        &self,
        source_id: Uuid,
        content_hash: &str,
    ) -> Result<(), LedgerError>;
}

/// Lifecycle event type for a status transition, used by implementations to
/// keep the event stream in lock-step with status changes.
pub fn event_type_for_status(status: RunStatus) -> &'static str {
    use relay_core::event::event_type;
    match status {
        RunStatus::Pending => event_type::RUN_CREATED,
        RunStatus::Running => event_type::RUN_STARTED,
        RunStatus::Completed => event_type::RUN_COMPLETED,
        RunStatus::Failed => event_type::RUN_FAILED,
        RunStatus::Cancelled => event_type::RUN_CANCELLED,
        RunStatus::DeadLettered => event_type::RUN_DEAD_LETTERED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::spec::WorkSpec;
    use serde_json::json;

    #[test]
    fn test_page_has_more() {
        let page = Page::new(vec![1, 2, 3], 10, Pagination::new(3, 0));
        assert!(page.has_more());

        let page = Page::new(vec![1], 10, Pagination::new(3, 9));
        assert!(!page.has_more());

        let empty: Page<i32> = Page::new(vec![], 0, Pagination::default());
        assert!(!empty.has_more());
    }

    #[test]
    fn test_run_filter_matches() {
        let spec = WorkSpec::task("add", json!({})).with_lane("math");
        let record = RunRecord::pending(Uuid::now_v7(), spec);

        assert!(RunFilter::default().matches(&record));
        assert!(RunFilter::by_name("add").matches(&record));
        assert!(!RunFilter::by_name("sub").matches(&record));
        assert!(RunFilter::by_status(RunStatus::Pending).matches(&record));
        assert!(!RunFilter::by_status(RunStatus::Failed).matches(&record));

        let filter = RunFilter {
            lane: Some("math".to_string()),
            kind: Some(WorkKind::Task),
            ..Default::default()
        };
        assert!(filter.matches(&record));
    }

    #[test]
    fn test_event_type_mapping() {
        assert_eq!(event_type_for_status(RunStatus::Completed), "run.completed");
        assert_eq!(
            event_type_for_status(RunStatus::DeadLettered),
            "run.dead_lettered"
        );
    }
}
