//! PostgreSQL implementation of the Ledger
//!
//! Production persistence with:
//! - Status transitions checked under row locks
//! - Conditional single-row writes as the locking primitive (locks, leases,
//!   watermark advances)
//! - Event streams appended in the same transaction as their status change

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use relay_core::backfill::{BackfillPlan, BackfillReason, BackfillStatus};
use relay_core::dlq::DeadLetter;
use relay_core::error::ErrorCategory;
use relay_core::event::{ExecutionEvent, NewEvent};
use relay_core::lock::ConcurrencyLock;
use relay_core::run::{RunRecord, RunStatus, StatusUpdate};
use relay_core::schedule::{Cadence, Schedule, ScheduleRun};
use relay_core::source::{FetchStatus, Source, SourceFetch};
use relay_core::spec::{Priority, WorkKind, WorkSpec};
use relay_core::watermark::{find_gaps, Watermark, WatermarkGap};

use crate::ledger::{
    event_type_for_status, Ledger, LedgerError, Page, Pagination, RunFilter, RunSort,
};

/// PostgreSQL-backed ledger.
///
/// # Example
///
/// ```ignore
/// use relay_storage::{run_migrations, PostgresLedger};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/relay").await?;
/// run_migrations(&pool).await?;
/// let ledger = PostgresLedger::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        crate::migrations::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Database(e.to_string())
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, LedgerError> {
    let kind_str: String = row.get("kind");
    let kind = WorkKind::parse(&kind_str)
        .ok_or_else(|| LedgerError::Serialization(format!("unknown work kind: {kind_str}")))?;
    let priority_str: String = row.get("priority");
    let status_str: String = row.get("status");
    let status = RunStatus::parse(&status_str)
        .ok_or_else(|| LedgerError::Serialization(format!("unknown run status: {status_str}")))?;
    let metadata: serde_json::Value = row.get("metadata");
    let error_category: Option<String> = row.get("error_category");

    let spec = WorkSpec {
        kind,
        name: row.get("name"),
        params: row.get("params"),
        priority: Priority::parse(&priority_str).unwrap_or_default(),
        lane: row.get("lane"),
        idempotency_key: row.get("idempotency_key"),
        max_retries: row.get::<i32, _>("max_retries") as u32,
        retry_delay_seconds: row.get::<i32, _>("retry_delay_seconds") as u32,
        timeout_seconds: row.get::<Option<i32>, _>("timeout_seconds").map(|t| t as u32),
        trigger_source: row.get("trigger_source"),
        correlation_id: row.get("correlation_id"),
        parent_run_id: row.get("parent_run_id"),
        metadata: serde_json::from_value(metadata)
            .map_err(|e| LedgerError::Serialization(e.to_string()))?,
    };

    Ok(RunRecord {
        run_id: row.get("run_id"),
        spec,
        status,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        result: row.get("result"),
        error: row.get("error"),
        error_type: row.get("error_type"),
        error_category: error_category.as_deref().and_then(ErrorCategory::parse),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        capture_id: row.get("capture_id"),
    })
}

const RUN_COLUMNS: &str = "run_id, kind, name, params, priority, lane, idempotency_key, \
     max_retries, retry_delay_seconds, timeout_seconds, trigger_source, correlation_id, \
     parent_run_id, metadata, status, created_at, started_at, completed_at, result, error, \
     error_type, error_category, retry_count, capture_id";

fn event_from_row(row: &PgRow) -> ExecutionEvent {
    ExecutionEvent {
        event_id: row.get("event_id"),
        run_id: row.get("run_id"),
        step_id: row.get("step_id"),
        event_type: row.get("event_type"),
        timestamp: row.get("timestamp"),
        payload: row.get("payload"),
        idempotency_key: row.get("idempotency_key"),
    }
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, LedgerError> {
    let kind_str: String = row.get("target_kind");
    let target_kind = WorkKind::parse(&kind_str)
        .ok_or_else(|| LedgerError::Serialization(format!("unknown target kind: {kind_str}")))?;
    let schedule_type: String = row.get("schedule_type");

    let cadence = Cadence::from_columns(
        &schedule_type,
        row.get("cron_expression"),
        row.get("interval_seconds"),
        row.get("run_at"),
    )
    .map_err(|e| LedgerError::Serialization(e.to_string()))?;

    Ok(Schedule {
        schedule_id: row.get("schedule_id"),
        name: row.get("name"),
        target_kind,
        target_name: row.get("target_name"),
        params: row.get("params"),
        cadence,
        timezone: row.get("timezone"),
        enabled: row.get("enabled"),
        max_instances: row.get::<i32, _>("max_instances") as u32,
        misfire_grace_seconds: row.get::<i32, _>("misfire_grace_seconds") as u32,
        last_run_at: row.get("last_run_at"),
        next_run_at: row.get("next_run_at"),
        last_run_status: row.get("last_run_status"),
        version: row.get::<i32, _>("version") as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const SCHEDULE_COLUMNS: &str = "schedule_id, name, target_kind, target_name, params, \
     schedule_type, cron_expression, interval_seconds, run_at, timezone, enabled, \
     max_instances, misfire_grace_seconds, last_run_at, next_run_at, last_run_status, \
     version, created_at, updated_at";

fn dead_letter_from_row(row: &PgRow) -> DeadLetter {
    DeadLetter {
        id: row.get("id"),
        run_id: row.get("run_id"),
        workflow_name: row.get("workflow_name"),
        params: row.get("params"),
        error: row.get("error"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        created_at: row.get("created_at"),
        last_retry_at: row.get("last_retry_at"),
        resolved_at: row.get("resolved_at"),
        resolved_by: row.get("resolved_by"),
    }
}

fn watermark_from_row(row: &PgRow) -> Watermark {
    Watermark {
        domain: row.get("domain"),
        source: row.get("source"),
        partition_key: row.get("partition_key"),
        high_water: row.get("high_water"),
        low_water: row.get("low_water"),
        updated_at: row.get("updated_at"),
    }
}

fn plan_from_row(row: &PgRow) -> Result<BackfillPlan, LedgerError> {
    let reason_str: String = row.get("reason");
    let status_str: String = row.get("status");
    let ser = |e: serde_json::Error| LedgerError::Serialization(e.to_string());

    Ok(BackfillPlan {
        plan_id: row.get("plan_id"),
        domain: row.get("domain"),
        source: row.get("source"),
        reason: BackfillReason::parse(&reason_str).ok_or_else(|| {
            LedgerError::Serialization(format!("unknown backfill reason: {reason_str}"))
        })?,
        partition_keys: serde_json::from_value(row.get("partition_keys")).map_err(ser)?,
        status: BackfillStatus::parse(&status_str).ok_or_else(|| {
            LedgerError::Serialization(format!("unknown backfill status: {status_str}"))
        })?,
        completed_keys: serde_json::from_value(row.get("completed_keys")).map_err(ser)?,
        failed_keys: serde_json::from_value(row.get("failed_keys")).map_err(ser)?,
        checkpoint: row.get("checkpoint"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn source_from_row(row: &PgRow) -> Source {
    Source {
        id: row.get("id"),
        name: row.get("name"),
        kind: row.get("kind"),
        config: row.get("config"),
        domain: row.get("domain"),
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
    }
}

fn fetch_from_row(row: &PgRow) -> Result<SourceFetch, LedgerError> {
    let status_str: String = row.get("status");
    Ok(SourceFetch {
        id: row.get("id"),
        source_id: row.get("source_id"),
        status: FetchStatus::parse(&status_str).ok_or_else(|| {
            LedgerError::Serialization(format!("unknown fetch status: {status_str}"))
        })?,
        record_count: row.get::<Option<i64>, _>("record_count").map(|v| v as u64),
        byte_count: row.get::<Option<i64>, _>("byte_count").map(|v| v as u64),
        content_hash: row.get("content_hash"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration_ms: row.get::<i64, _>("duration_ms") as u64,
        error: row.get("error"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        capture_id: row.get("capture_id"),
    })
}

/// Append an event inside a transaction, assigning the next per-run id.
async fn append_event_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: Uuid,
    step_id: Option<&str>,
    event_type: &str,
    payload: &serde_json::Value,
    idempotency_key: Option<&str>,
) -> Result<ExecutionEvent, LedgerError> {
    let row = sqlx::query(
        r#"
        INSERT INTO core_events (run_id, event_id, step_id, event_type, payload, idempotency_key)
        SELECT $1, COALESCE(MAX(event_id), 0) + 1, $2, $3, $4, $5
        FROM core_events WHERE run_id = $1
        RETURNING run_id, event_id, step_id, event_type, timestamp, payload, idempotency_key
        "#,
    )
    .bind(run_id)
    .bind(step_id)
    .bind(event_type)
    .bind(payload)
    .bind(idempotency_key)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(event_from_row(&row))
}

#[async_trait]
impl Ledger for PostgresLedger {
    // =========================================================================
    // Runs
    // =========================================================================

    #[instrument(skip(self, record), fields(run_id = %record.run_id))]
    async fn create_run(&self, record: &RunRecord) -> Result<(), LedgerError> {
        let metadata = serde_json::to_value(&record.spec.metadata)
            .map_err(|e| LedgerError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO core_runs (
                run_id, kind, name, params, priority, lane, idempotency_key,
                max_retries, retry_delay_seconds, timeout_seconds, trigger_source,
                correlation_id, parent_run_id, metadata, status, created_at, retry_count,
                capture_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(record.run_id)
        .bind(record.spec.kind.as_str())
        .bind(&record.spec.name)
        .bind(&record.spec.params)
        .bind(record.spec.priority.as_str())
        .bind(&record.spec.lane)
        .bind(&record.spec.idempotency_key)
        .bind(record.spec.max_retries as i32)
        .bind(record.spec.retry_delay_seconds as i32)
        .bind(record.spec.timeout_seconds.map(|t| t as i32))
        .bind(&record.spec.trigger_source)
        .bind(record.spec.correlation_id)
        .bind(record.spec.parent_run_id)
        .bind(&metadata)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.retry_count as i32)
        .bind(record.capture_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("failed to create run: {}", e);
            db_err(e)
        })?;

        append_event_tx(
            &mut tx,
            record.run_id,
            None,
            event_type_for_status(RunStatus::Pending),
            &serde_json::json!({
                "kind": record.spec.kind.as_str(),
                "name": record.spec.name,
                "trigger_source": record.spec.trigger_source,
            }),
            None,
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        debug!("created run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM core_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::RunNotFound(run_id))?;

        run_from_row(&row)
    }

    #[instrument(skip(self, update))]
    async fn update_status(
        &self,
        run_id: Uuid,
        new_status: RunStatus,
        update: StatusUpdate,
    ) -> Result<RunRecord, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT status FROM core_runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(LedgerError::RunNotFound(run_id))?;

        let current_str: String = row.get("status");
        let current = RunStatus::parse(&current_str).ok_or_else(|| {
            LedgerError::Serialization(format!("unknown run status: {current_str}"))
        })?;

        if !current.can_transition_to(new_status) {
            return Err(LedgerError::InvalidTransition {
                run_id,
                from: current,
                to: new_status,
            });
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE core_runs
            SET
                status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                error_type = COALESCE($5, error_type),
                error_category = COALESCE($6, error_category),
                started_at = COALESCE($7, started_at),
                completed_at = COALESCE($8, completed_at)
            WHERE run_id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(new_status.as_str())
        .bind(&update.result)
        .bind(&update.error)
        .bind(&update.error_type)
        .bind(update.error_category.map(|c| c.as_str()))
        .bind(update.started_at)
        .bind(update.completed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let record = run_from_row(&row)?;

        append_event_tx(
            &mut tx,
            run_id,
            None,
            event_type_for_status(new_status),
            &serde_json::json!({
                "status": new_status.as_str(),
                "error": record.error,
                "error_category": record.error_category.map(|c| c.as_str()),
            }),
            None,
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        debug!(status = %new_status, "updated run status");
        Ok(record)
    }

    #[instrument(skip(self, filter))]
    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
        sort: RunSort,
    ) -> Result<Page<RunRecord>, LedgerError> {
        fn apply_filter<'a>(builder: &mut QueryBuilder<'a, sqlx::Postgres>, filter: &'a RunFilter) {
            builder.push(" WHERE TRUE");
            if let Some(status) = filter.status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(kind) = filter.kind {
                builder.push(" AND kind = ").push_bind(kind.as_str());
            }
            if let Some(name) = &filter.name {
                builder.push(" AND name = ").push_bind(name);
            }
            if let Some(lane) = &filter.lane {
                builder.push(" AND lane = ").push_bind(lane);
            }
            if let Some(trigger) = &filter.trigger_source {
                builder.push(" AND trigger_source = ").push_bind(trigger);
            }
            if let Some(parent) = filter.parent_run_id {
                builder.push(" AND parent_run_id = ").push_bind(parent);
            }
        }

        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) AS total FROM core_runs");
        apply_filter(&mut count_builder, &filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get("total");

        let mut builder =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM core_runs"));
        apply_filter(&mut builder, &filter);
        builder.push(match sort {
            RunSort::CreatedAtDesc => " ORDER BY created_at DESC",
            RunSort::Status => " ORDER BY status ASC, created_at DESC",
            RunSort::Name => " ORDER BY name ASC, created_at DESC",
        });
        builder.push(" LIMIT ").push_bind(pagination.limit as i64);
        builder.push(" OFFSET ").push_bind(pagination.offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let items = rows
            .iter()
            .map(run_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(items, total as u64, pagination))
    }

    #[instrument(skip(self))]
    async fn find_active_run_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RunRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM core_runs
            WHERE idempotency_key = $1 AND status IN ('pending', 'running')
            "#
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_retry_candidates(&self, limit: u32) -> Result<Vec<RunRecord>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM core_runs r
            WHERE r.status = 'failed'
              AND r.retry_count < r.max_retries
              AND NOT EXISTS (
                  SELECT 1 FROM core_runs c WHERE c.parent_run_id = r.run_id
              )
            ORDER BY r.created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn purge_old_data(&self, older_than_days: u32) -> Result<u64, LedgerError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));

        let result = sqlx::query(
            r#"
            DELETE FROM core_runs
            WHERE status IN ('completed', 'failed', 'cancelled', 'dead_lettered')
              AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[instrument(skip(self, event), fields(run_id = %event.run_id, event_type = %event.event_type))]
    async fn record_event(&self, event: NewEvent) -> Result<Option<ExecutionEvent>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(key) = &event.idempotency_key {
            let exists = sqlx::query("SELECT 1 AS one FROM core_events WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if exists.is_some() {
                return Ok(None);
            }
        }

        let recorded = append_event_tx(
            &mut tx,
            event.run_id,
            event.step_id.as_deref(),
            &event.event_type,
            &event.payload,
            event.idempotency_key.as_deref(),
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(recorded))
    }

    #[instrument(skip(self))]
    async fn get_events(
        &self,
        run_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<ExecutionEvent>, LedgerError> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS total FROM core_events WHERE run_id = $1")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
                .get("total");

        let rows = sqlx::query(
            r#"
            SELECT run_id, event_id, step_id, event_type, timestamp, payload, idempotency_key
            FROM core_events
            WHERE run_id = $1
            ORDER BY event_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(run_id)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows.iter().map(event_from_row).collect();
        Ok(Page::new(items, total as u64, pagination))
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    #[instrument(skip(self, schedule), fields(name = %schedule.name))]
    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_schedules (
                schedule_id, name, target_kind, target_name, params, schedule_type,
                cron_expression, interval_seconds, run_at, timezone, enabled, max_instances,
                misfire_grace_seconds, last_run_at, next_run_at, last_run_status, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(schedule.schedule_id)
        .bind(&schedule.name)
        .bind(schedule.target_kind.as_str())
        .bind(&schedule.target_name)
        .bind(&schedule.params)
        .bind(schedule.cadence.schedule_type())
        .bind(schedule.cadence.cron_expression())
        .bind(schedule.cadence.interval_seconds().map(i64::from))
        .bind(schedule.cadence.run_at())
        .bind(&schedule.timezone)
        .bind(schedule.enabled)
        .bind(schedule.max_instances as i32)
        .bind(schedule.misfire_grace_seconds as i32)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(&schedule.last_run_status)
        .bind(schedule.version as i32)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::DuplicateName(schedule.name.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM core_schedules WHERE schedule_id = $1"
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::ScheduleNotFound(schedule_id))?;

        schedule_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_schedule_by_name(&self, name: &str) -> Result<Option<Schedule>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM core_schedules WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.schedule_id))]
    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE core_schedules
            SET
                target_kind = $2,
                target_name = $3,
                params = $4,
                schedule_type = $5,
                cron_expression = $6,
                interval_seconds = $7,
                run_at = $8,
                timezone = $9,
                enabled = $10,
                max_instances = $11,
                misfire_grace_seconds = $12,
                version = version + 1,
                updated_at = NOW()
            WHERE schedule_id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule.schedule_id)
        .bind(schedule.target_kind.as_str())
        .bind(&schedule.target_name)
        .bind(&schedule.params)
        .bind(schedule.cadence.schedule_type())
        .bind(schedule.cadence.cron_expression())
        .bind(schedule.cadence.interval_seconds().map(i64::from))
        .bind(schedule.cadence.run_at())
        .bind(&schedule.timezone)
        .bind(schedule.enabled)
        .bind(schedule.max_instances as i32)
        .bind(schedule.misfire_grace_seconds as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::ScheduleNotFound(schedule.schedule_id))?;

        schedule_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, LedgerError> {
        sqlx::query("DELETE FROM core_schedule_locks WHERE schedule_id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let result = sqlx::query("DELETE FROM core_schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<Schedule>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM core_schedules
            WHERE ($1 = FALSE OR enabled)
            ORDER BY name
            "#
        ))
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM core_schedules
            WHERE enabled AND (next_run_at IS NULL OR next_run_at <= $1)
            ORDER BY next_run_at ASC NULLS FIRST, schedule_id ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn mark_schedule_run(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        last_run_status: &str,
        enabled: bool,
    ) -> Result<Schedule, LedgerError> {
        // Forward-only: GREATEST keeps the stored next_run_at when the new
        // value is not later.
        let row = sqlx::query(&format!(
            r#"
            UPDATE core_schedules
            SET
                last_run_at = $2,
                next_run_at = CASE
                    WHEN $3::timestamptz IS NULL THEN NULL
                    ELSE GREATEST(COALESCE(next_run_at, $3::timestamptz), $3::timestamptz)
                END,
                last_run_status = $4,
                enabled = $5,
                version = version + 1,
                updated_at = NOW()
            WHERE schedule_id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(last_run_status)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::ScheduleNotFound(schedule_id))?;

        schedule_from_row(&row)
    }

    #[instrument(skip(self, run), fields(schedule_id = %run.schedule_id))]
    async fn record_schedule_run(&self, run: &ScheduleRun) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO core_schedule_runs (id, schedule_id, scheduled_at, run_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(run.schedule_id)
        .bind(run.scheduled_at)
        .bind(run.run_id)
        .bind(&run.status)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<ScheduleRun>, LedgerError> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS total FROM core_schedule_runs WHERE schedule_id = $1")
                .bind(schedule_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
                .get("total");

        let rows = sqlx::query(
            r#"
            SELECT id, schedule_id, scheduled_at, run_id, status, created_at
            FROM core_schedule_runs
            WHERE schedule_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(schedule_id)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows
            .iter()
            .map(|row| ScheduleRun {
                id: row.get("id"),
                schedule_id: row.get("schedule_id"),
                scheduled_at: row.get("scheduled_at"),
                run_id: row.get("run_id"),
                status: row.get("status"),
                created_at: row.get("created_at"),
            })
            .collect();

        Ok(Page::new(items, total as u64, pagination))
    }

    // =========================================================================
    // Schedule leases
    // =========================================================================

    #[instrument(skip(self))]
    async fn try_lease_schedule(
        &self,
        schedule_id: Uuid,
        holder: &str,
        lease_seconds: u32,
    ) -> Result<bool, LedgerError> {
        let expires_at = Utc::now() + ChronoDuration::seconds(i64::from(lease_seconds));

        let result = sqlx::query(
            r#"
            INSERT INTO core_schedule_locks (schedule_id, locked_by, locked_at, expires_at)
            VALUES ($1, $2, NOW(), $3)
            ON CONFLICT (schedule_id) DO UPDATE SET
                locked_by = EXCLUDED.locked_by,
                locked_at = NOW(),
                expires_at = EXCLUDED.expires_at
            WHERE core_schedule_locks.expires_at < NOW()
               OR core_schedule_locks.locked_by = EXCLUDED.locked_by
            "#,
        )
        .bind(schedule_id)
        .bind(holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn release_schedule_lease(
        &self,
        schedule_id: Uuid,
        holder: &str,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "DELETE FROM core_schedule_locks WHERE schedule_id = $1 AND locked_by = $2",
        )
        .bind(schedule_id)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Concurrency locks
    // =========================================================================

    #[instrument(skip(self))]
    async fn acquire_lock(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError> {
        let expires_at = Utc::now() + ChronoDuration::seconds(i64::from(timeout_seconds));

        let result = sqlx::query(
            r#"
            INSERT INTO core_concurrency_locks (lock_key, execution_id, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), $3)
            ON CONFLICT (lock_key) DO UPDATE SET
                execution_id = EXCLUDED.execution_id,
                acquired_at = NOW(),
                expires_at = EXCLUDED.expires_at
            WHERE core_concurrency_locks.expires_at < NOW()
               OR core_concurrency_locks.execution_id = EXCLUDED.execution_id
            "#,
        )
        .bind(lock_key)
        .bind(execution_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn release_lock(
        &self,
        lock_key: &str,
        execution_id: Option<Uuid>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            DELETE FROM core_concurrency_locks
            WHERE lock_key = $1 AND ($2::uuid IS NULL OR execution_id = $2)
            "#,
        )
        .bind(lock_key)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn extend_lock(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError> {
        let expires_at = Utc::now() + ChronoDuration::seconds(i64::from(timeout_seconds));

        let result = sqlx::query(
            r#"
            UPDATE core_concurrency_locks
            SET expires_at = $3
            WHERE lock_key = $1 AND execution_id = $2 AND expires_at >= NOW()
            "#,
        )
        .bind(lock_key)
        .bind(execution_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn cleanup_expired_locks(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM core_concurrency_locks WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn get_lock(&self, lock_key: &str) -> Result<Option<ConcurrencyLock>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT lock_key, execution_id, acquired_at, expires_at
            FROM core_concurrency_locks
            WHERE lock_key = $1
            "#,
        )
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| ConcurrencyLock {
            lock_key: row.get("lock_key"),
            execution_id: row.get("execution_id"),
            acquired_at: row.get("acquired_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    // =========================================================================
    // Dead letters
    // =========================================================================

    #[instrument(skip(self, dead_letter), fields(run_id = %dead_letter.run_id))]
    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_dead_letters (
                id, run_id, workflow_name, params, error, retry_count, max_retries,
                created_at, last_retry_at, resolved_at, resolved_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(dead_letter.id)
        .bind(dead_letter.run_id)
        .bind(&dead_letter.workflow_name)
        .bind(&dead_letter.params)
        .bind(&dead_letter.error)
        .bind(dead_letter.retry_count as i32)
        .bind(dead_letter.max_retries as i32)
        .bind(dead_letter.created_at)
        .bind(dead_letter.last_retry_at)
        .bind(dead_letter.resolved_at)
        .bind(&dead_letter.resolved_by)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, workflow_name, params, error, retry_count, max_retries,
                   created_at, last_retry_at, resolved_at, resolved_by
            FROM core_dead_letters
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::DeadLetterNotFound(id))?;

        Ok(dead_letter_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        workflow: Option<&str>,
        include_resolved: bool,
        pagination: Pagination,
    ) -> Result<Page<DeadLetter>, LedgerError> {
        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM core_dead_letters
            WHERE ($1::text IS NULL OR workflow_name = $1)
              AND ($2 OR resolved_at IS NULL)
            "#,
        )
        .bind(workflow)
        .bind(include_resolved)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get("total");

        let rows = sqlx::query(
            r#"
            SELECT id, run_id, workflow_name, params, error, retry_count, max_retries,
                   created_at, last_retry_at, resolved_at, resolved_by
            FROM core_dead_letters
            WHERE ($1::text IS NULL OR workflow_name = $1)
              AND ($2 OR resolved_at IS NULL)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(workflow)
        .bind(include_resolved)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows.iter().map(dead_letter_from_row).collect();
        Ok(Page::new(items, total as u64, pagination))
    }

    #[instrument(skip(self, dead_letter), fields(id = %dead_letter.id))]
    async fn update_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE core_dead_letters
            SET retry_count = $2, last_retry_at = $3, resolved_at = $4, resolved_by = $5
            WHERE id = $1
            "#,
        )
        .bind(dead_letter.id)
        .bind(dead_letter.retry_count as i32)
        .bind(dead_letter.last_retry_at)
        .bind(dead_letter.resolved_at)
        .bind(&dead_letter.resolved_by)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::DeadLetterNotFound(dead_letter.id));
        }
        Ok(())
    }

    // =========================================================================
    // Watermarks
    // =========================================================================

    #[instrument(skip(self))]
    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        high_water: &str,
    ) -> Result<Watermark, LedgerError> {
        // Conditional update: only a strictly greater value wins.
        let row = sqlx::query(
            r#"
            INSERT INTO core_watermarks (domain, source, partition_key, high_water, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (domain, source, partition_key) DO UPDATE SET
                high_water = EXCLUDED.high_water,
                updated_at = NOW()
            WHERE core_watermarks.high_water < EXCLUDED.high_water
            RETURNING domain, source, partition_key, high_water, low_water, updated_at
            "#,
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .bind(high_water)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(watermark_from_row(&row)),
            // Stale advance: the row was kept; return it.
            None => self
                .get_watermark(domain, source, partition_key)
                .await?
                .ok_or_else(|| {
                    LedgerError::Database("watermark vanished during advance".to_string())
                }),
        }
    }

    #[instrument(skip(self))]
    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT domain, source, partition_key, high_water, low_water, updated_at
            FROM core_watermarks
            WHERE domain = $1 AND source = $2 AND partition_key = $3
            "#,
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(watermark_from_row))
    }

    #[instrument(skip(self))]
    async fn list_watermarks(&self, domain: Option<&str>) -> Result<Vec<Watermark>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT domain, source, partition_key, high_water, low_water, updated_at
            FROM core_watermarks
            WHERE ($1::text IS NULL OR domain = $1)
            ORDER BY domain, source, partition_key
            "#,
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(watermark_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn delete_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "DELETE FROM core_watermarks WHERE domain = $1 AND source = $2 AND partition_key = $3",
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, expected_partitions))]
    async fn list_watermark_gaps(
        &self,
        domain: &str,
        source: &str,
        expected_partitions: &[String],
    ) -> Result<Vec<WatermarkGap>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT domain, source, partition_key, high_water, low_water, updated_at
            FROM core_watermarks
            WHERE domain = $1 AND source = $2
            "#,
        )
        .bind(domain)
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let existing: Vec<Watermark> = rows.iter().map(watermark_from_row).collect();
        Ok(find_gaps(&existing, expected_partitions))
    }

    // =========================================================================
    // Backfill plans
    // =========================================================================

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn save_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), LedgerError> {
        let ser = |e: serde_json::Error| LedgerError::Serialization(e.to_string());
        let partition_keys = serde_json::to_value(&plan.partition_keys).map_err(ser)?;
        let completed_keys = serde_json::to_value(&plan.completed_keys).map_err(ser)?;
        let failed_keys = serde_json::to_value(&plan.failed_keys).map_err(ser)?;

        sqlx::query(
            r#"
            INSERT INTO core_backfill_plans (
                plan_id, domain, source, reason, partition_keys, status, completed_keys,
                failed_keys, checkpoint, created_by, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (plan_id) DO UPDATE SET
                status = EXCLUDED.status,
                completed_keys = EXCLUDED.completed_keys,
                failed_keys = EXCLUDED.failed_keys,
                checkpoint = EXCLUDED.checkpoint,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.domain)
        .bind(&plan.source)
        .bind(plan.reason.as_str())
        .bind(&partition_keys)
        .bind(plan.status.as_str())
        .bind(&completed_keys)
        .bind(&failed_keys)
        .bind(&plan.checkpoint)
        .bind(&plan.created_by)
        .bind(plan.created_at)
        .bind(plan.started_at)
        .bind(plan.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_backfill_plan(&self, plan_id: Uuid) -> Result<BackfillPlan, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT plan_id, domain, source, reason, partition_keys, status, completed_keys,
                   failed_keys, checkpoint, created_by, created_at, started_at, completed_at
            FROM core_backfill_plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::PlanNotFound(plan_id))?;

        plan_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_backfill_plans(
        &self,
        domain: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<BackfillPlan>, LedgerError> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM core_backfill_plans WHERE ($1::text IS NULL OR domain = $1)",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get("total");

        let rows = sqlx::query(
            r#"
            SELECT plan_id, domain, source, reason, partition_keys, status, completed_keys,
                   failed_keys, checkpoint, created_by, created_at, started_at, completed_at
            FROM core_backfill_plans
            WHERE ($1::text IS NULL OR domain = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(domain)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows.iter().map(plan_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total as u64, pagination))
    }

    // =========================================================================
    // Sources
    // =========================================================================

    #[instrument(skip(self, source), fields(name = %source.name))]
    async fn create_source(&self, source: &Source) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_sources (id, name, kind, config, domain, enabled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(&source.kind)
        .bind(&source.config)
        .bind(&source.domain)
        .bind(source.enabled)
        .bind(source.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::DuplicateName(source.name.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_source(&self, id: Uuid) -> Result<Source, LedgerError> {
        let row = sqlx::query(
            "SELECT id, name, kind, config, domain, enabled, created_at FROM core_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::SourceNotFound(id))?;

        Ok(source_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn get_source_by_name(&self, name: &str) -> Result<Option<Source>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, name, kind, config, domain, enabled, created_at FROM core_sources WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(source_from_row))
    }

    #[instrument(skip(self))]
    async fn list_sources(&self, domain: Option<&str>) -> Result<Vec<Source>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, kind, config, domain, enabled, created_at
            FROM core_sources
            WHERE ($1::text IS NULL OR domain = $1)
            ORDER BY name
            "#,
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(source_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn set_source_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, LedgerError> {
        let result = sqlx::query("UPDATE core_sources SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, fetch), fields(source_id = %fetch.source_id))]
    async fn record_source_fetch(&self, fetch: &SourceFetch) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO core_source_fetches (
                id, source_id, status, record_count, byte_count, content_hash, etag,
                last_modified, started_at, completed_at, duration_ms, error, retry_count,
                capture_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(fetch.id)
        .bind(fetch.source_id)
        .bind(fetch.status.as_str())
        .bind(fetch.record_count.map(|v| v as i64))
        .bind(fetch.byte_count.map(|v| v as i64))
        .bind(&fetch.content_hash)
        .bind(&fetch.etag)
        .bind(&fetch.last_modified)
        .bind(fetch.started_at)
        .bind(fetch.completed_at)
        .bind(fetch.duration_ms as i64)
        .bind(&fetch.error)
        .bind(fetch.retry_count as i32)
        .bind(fetch.capture_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_source_fetches(
        &self,
        source_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<SourceFetch>, LedgerError> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS total FROM core_source_fetches WHERE source_id = $1")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
                .get("total");

        let rows = sqlx::query(
            r#"
            SELECT id, source_id, status, record_count, byte_count, content_hash, etag,
                   last_modified, started_at, completed_at, duration_ms, error, retry_count,
                   capture_id
            FROM core_source_fetches
            WHERE source_id = $1
            ORDER BY started_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(source_id)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows
            .iter()
            .map(fetch_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total as u64, pagination))
    }

    #[instrument(skip(self))]
    async fn get_cached_content_hash(
        &self,
        source_id: Uuid,
    ) -> Result<Option<String>, LedgerError> {
        let row = sqlx::query("SELECT content_hash FROM core_source_cache WHERE source_id = $1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| r.get("content_hash")))
    }

    #[instrument(skip(self))]
    async fn put_cached_content_hash(
        &self,
        source_id: Uuid,
        content_hash: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO core_source_cache (source_id, content_hash, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (source_id) DO UPDATE SET
                content_hash = EXCLUDED.content_hash,
                updated_at = NOW()
            "#,
        )
        .bind(source_id)
        .bind(content_hash)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
