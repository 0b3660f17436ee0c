//! In-memory implementation of the Ledger
//!
//! Primarily for tests and single-process deployments. It provides the same
//! semantics as the PostgreSQL implementation, including transition
//! enforcement and event dedupe.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use relay_core::dlq::DeadLetter;
use relay_core::event::{ExecutionEvent, NewEvent};
use relay_core::lock::ConcurrencyLock;
use relay_core::run::{RunRecord, RunStatus, StatusUpdate};
use relay_core::schedule::{Schedule, ScheduleLock, ScheduleRun};
use relay_core::source::{Source, SourceFetch};
use relay_core::watermark::{find_gaps, Watermark, WatermarkGap};
use relay_core::BackfillPlan;

use crate::ledger::{
    event_type_for_status, Ledger, LedgerError, Page, Pagination, RunFilter, RunSort,
};

/// In-memory ledger.
///
/// # Example
///
/// ```
/// use relay_storage::InMemoryLedger;
///
/// let ledger = InMemoryLedger::new();
/// ```
pub struct InMemoryLedger {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
    events: RwLock<HashMap<Uuid, Vec<ExecutionEvent>>>,
    event_keys: RwLock<HashSet<String>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    schedule_runs: RwLock<Vec<ScheduleRun>>,
    schedule_locks: RwLock<HashMap<Uuid, ScheduleLock>>,
    locks: RwLock<HashMap<String, ConcurrencyLock>>,
    dead_letters: RwLock<HashMap<Uuid, DeadLetter>>,
    watermarks: RwLock<HashMap<(String, String, String), Watermark>>,
    plans: RwLock<HashMap<Uuid, BackfillPlan>>,
    sources: RwLock<HashMap<Uuid, Source>>,
    source_fetches: RwLock<Vec<SourceFetch>>,
    content_hashes: RwLock<HashMap<Uuid, String>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            event_keys: RwLock::new(HashSet::new()),
            schedules: RwLock::new(HashMap::new()),
            schedule_runs: RwLock::new(Vec::new()),
            schedule_locks: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            watermarks: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            source_fetches: RwLock::new(Vec::new()),
            content_hashes: RwLock::new(HashMap::new()),
        }
    }

    /// Number of runs (for tests).
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Number of dead letters (for tests).
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().len()
    }

    /// Clear all data (for tests).
    pub fn clear(&self) {
        self.runs.write().clear();
        self.events.write().clear();
        self.event_keys.write().clear();
        self.schedules.write().clear();
        self.schedule_runs.write().clear();
        self.schedule_locks.write().clear();
        self.locks.write().clear();
        self.dead_letters.write().clear();
        self.watermarks.write().clear();
        self.plans.write().clear();
        self.sources.write().clear();
        self.source_fetches.write().clear();
        self.content_hashes.write().clear();
    }

    /// Append an event while holding the events map; assigns the per-run
    /// monotonic id.
    fn append_event(
        events: &mut HashMap<Uuid, Vec<ExecutionEvent>>,
        run_id: Uuid,
        step_id: Option<String>,
        event_type: &str,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> ExecutionEvent {
        let stream = events.entry(run_id).or_default();
        let event = ExecutionEvent {
            event_id: stream.len() as i64 + 1,
            run_id,
            step_id,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
            idempotency_key,
        };
        stream.push(event.clone());
        event
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, record: &RunRecord) -> Result<(), LedgerError> {
        let mut runs = self.runs.write();
        runs.insert(record.run_id, record.clone());

        let mut events = self.events.write();
        Self::append_event(
            &mut events,
            record.run_id,
            None,
            event_type_for_status(RunStatus::Pending),
            serde_json::json!({
                "kind": record.spec.kind.as_str(),
                "name": record.spec.name,
                "trigger_source": record.spec.trigger_source,
            }),
            None,
        );
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, LedgerError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(LedgerError::RunNotFound(run_id))
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        new_status: RunStatus,
        update: StatusUpdate,
    ) -> Result<RunRecord, LedgerError> {
        let mut runs = self.runs.write();
        let record = runs
            .get_mut(&run_id)
            .ok_or(LedgerError::RunNotFound(run_id))?;

        if !record.status.can_transition_to(new_status) {
            return Err(LedgerError::InvalidTransition {
                run_id,
                from: record.status,
                to: new_status,
            });
        }

        record.status = new_status;
        if let Some(result) = update.result {
            record.result = Some(result);
        }
        if let Some(error) = update.error {
            record.error = Some(error);
        }
        if let Some(error_type) = update.error_type {
            record.error_type = Some(error_type);
        }
        if let Some(category) = update.error_category {
            record.error_category = Some(category);
        }
        if let Some(started_at) = update.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            record.completed_at = Some(completed_at);
        }

        let snapshot = record.clone();
        drop(runs);

        let mut events = self.events.write();
        Self::append_event(
            &mut events,
            run_id,
            None,
            event_type_for_status(new_status),
            serde_json::json!({
                "status": new_status.as_str(),
                "error": snapshot.error,
                "error_category": snapshot.error_category.map(|c| c.as_str()),
            }),
            None,
        );

        Ok(snapshot)
    }

    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
        sort: RunSort,
    ) -> Result<Page<RunRecord>, LedgerError> {
        let runs = self.runs.read();
        let mut matching: Vec<RunRecord> = runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        match sort {
            RunSort::CreatedAtDesc => {
                matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            RunSort::Status => {
                matching.sort_by(|a, b| {
                    a.status
                        .as_str()
                        .cmp(b.status.as_str())
                        .then(b.created_at.cmp(&a.created_at))
                });
            }
            RunSort::Name => {
                matching.sort_by(|a, b| {
                    a.spec
                        .name
                        .cmp(&b.spec.name)
                        .then(b.created_at.cmp(&a.created_at))
                });
            }
        }

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(Page::new(items, total, pagination))
    }

    async fn find_active_run_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RunRecord>, LedgerError> {
        let runs = self.runs.read();
        Ok(runs
            .values()
            .find(|r| r.is_active() && r.spec.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_retry_candidates(&self, limit: u32) -> Result<Vec<RunRecord>, LedgerError> {
        let runs = self.runs.read();

        let retried: HashSet<Uuid> = runs
            .values()
            .filter_map(|r| r.spec.parent_run_id)
            .collect();

        let mut candidates: Vec<RunRecord> = runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Failed
                    && r.has_retry_budget()
                    && !retried.contains(&r.run_id)
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn purge_old_data(&self, older_than_days: u32) -> Result<u64, LedgerError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));

        let mut runs = self.runs.write();
        let purgeable: Vec<Uuid> = runs
            .values()
            .filter(|r| r.status.is_terminal() && r.created_at < cutoff)
            .map(|r| r.run_id)
            .collect();

        let mut events = self.events.write();
        for run_id in &purgeable {
            runs.remove(run_id);
            events.remove(run_id);
        }

        Ok(purgeable.len() as u64)
    }

    // =========================================================================
    // Events
    // =========================================================================

    async fn record_event(&self, event: NewEvent) -> Result<Option<ExecutionEvent>, LedgerError> {
        if let Some(key) = &event.idempotency_key {
            let mut keys = self.event_keys.write();
            if !keys.insert(key.clone()) {
                return Ok(None);
            }
        }

        let mut events = self.events.write();
        Ok(Some(Self::append_event(
            &mut events,
            event.run_id,
            event.step_id,
            &event.event_type,
            event.payload,
            event.idempotency_key,
        )))
    }

    async fn get_events(
        &self,
        run_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<ExecutionEvent>, LedgerError> {
        let events = self.events.read();
        let stream = events.get(&run_id).cloned().unwrap_or_default();

        let total = stream.len() as u64;
        let items = stream
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(Page::new(items, total, pagination))
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), LedgerError> {
        let mut schedules = self.schedules.write();
        if schedules.values().any(|s| s.name == schedule.name) {
            return Err(LedgerError::DuplicateName(schedule.name.clone()));
        }
        schedules.insert(schedule.schedule_id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule, LedgerError> {
        self.schedules
            .read()
            .get(&schedule_id)
            .cloned()
            .ok_or(LedgerError::ScheduleNotFound(schedule_id))
    }

    async fn get_schedule_by_name(&self, name: &str) -> Result<Option<Schedule>, LedgerError> {
        Ok(self
            .schedules
            .read()
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule, LedgerError> {
        let mut schedules = self.schedules.write();
        let existing = schedules
            .get_mut(&schedule.schedule_id)
            .ok_or(LedgerError::ScheduleNotFound(schedule.schedule_id))?;

        let mut updated = schedule.clone();
        updated.version = existing.version + 1;
        updated.updated_at = Utc::now();
        *existing = updated.clone();
        Ok(updated)
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, LedgerError> {
        self.schedule_locks.write().remove(&schedule_id);
        Ok(self.schedules.write().remove(&schedule_id).is_some())
    }

    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<Schedule>, LedgerError> {
        let mut schedules: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| !enabled_only || s.enabled)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, LedgerError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();

        // next_run_at ASC with never-run schedules first, then schedule_id.
        due.sort_by(|a, b| match (a.next_run_at, b.next_run_at) {
            (None, None) => a.schedule_id.cmp(&b.schedule_id),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y).then(a.schedule_id.cmp(&b.schedule_id)),
        });
        Ok(due)
    }

    async fn mark_schedule_run(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        last_run_status: &str,
        enabled: bool,
    ) -> Result<Schedule, LedgerError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or(LedgerError::ScheduleNotFound(schedule_id))?;

        schedule.last_run_at = Some(last_run_at);
        schedule.last_run_status = Some(last_run_status.to_string());
        // Forward-only: keep the stored value when the new one is not later.
        schedule.next_run_at = match (schedule.next_run_at, next_run_at) {
            (Some(current), Some(new)) if new <= current => Some(current),
            (_, new) => new,
        };
        schedule.enabled = enabled;
        schedule.version += 1;
        schedule.updated_at = Utc::now();

        Ok(schedule.clone())
    }

    async fn record_schedule_run(&self, run: &ScheduleRun) -> Result<(), LedgerError> {
        self.schedule_runs.write().push(run.clone());
        Ok(())
    }

    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<ScheduleRun>, LedgerError> {
        let runs = self.schedule_runs.read();
        let mut matching: Vec<ScheduleRun> = runs
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(Page::new(items, total, pagination))
    }

    // =========================================================================
    // Schedule leases
    // =========================================================================

    async fn try_lease_schedule(
        &self,
        schedule_id: Uuid,
        holder: &str,
        lease_seconds: u32,
    ) -> Result<bool, LedgerError> {
        let now = Utc::now();
        let mut locks = self.schedule_locks.write();

        if let Some(existing) = locks.get(&schedule_id) {
            if !existing.is_expired(now) && existing.locked_by != holder {
                return Ok(false);
            }
        }

        locks.insert(
            schedule_id,
            ScheduleLock {
                schedule_id,
                locked_by: holder.to_string(),
                locked_at: now,
                expires_at: now + ChronoDuration::seconds(i64::from(lease_seconds)),
            },
        );
        Ok(true)
    }

    async fn release_schedule_lease(
        &self,
        schedule_id: Uuid,
        holder: &str,
    ) -> Result<bool, LedgerError> {
        let mut locks = self.schedule_locks.write();
        match locks.get(&schedule_id) {
            Some(lock) if lock.locked_by == holder => {
                locks.remove(&schedule_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // =========================================================================
    // Concurrency locks
    // =========================================================================

    async fn acquire_lock(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError> {
        let now = Utc::now();
        let mut locks = self.locks.write();

        if let Some(existing) = locks.get(lock_key) {
            if !existing.is_expired(now) && existing.execution_id != execution_id {
                return Ok(false);
            }
        }

        locks.insert(
            lock_key.to_string(),
            ConcurrencyLock::acquire(lock_key, execution_id, timeout_seconds),
        );
        Ok(true)
    }

    async fn release_lock(
        &self,
        lock_key: &str,
        execution_id: Option<Uuid>,
    ) -> Result<bool, LedgerError> {
        let mut locks = self.locks.write();
        match (locks.get(lock_key), execution_id) {
            (Some(lock), Some(id)) if lock.execution_id != id => Ok(false),
            (Some(_), _) => {
                locks.remove(lock_key);
                Ok(true)
            }
            (None, _) => Ok(false),
        }
    }

    async fn extend_lock(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError> {
        let now = Utc::now();
        let mut locks = self.locks.write();
        match locks.get_mut(lock_key) {
            Some(lock) if lock.execution_id == execution_id && !lock.is_expired(now) => {
                lock.expires_at = now + ChronoDuration::seconds(i64::from(timeout_seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cleanup_expired_locks(&self) -> Result<u64, LedgerError> {
        let now = Utc::now();
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_expired(now));
        Ok((before - locks.len()) as u64)
    }

    async fn get_lock(&self, lock_key: &str) -> Result<Option<ConcurrencyLock>, LedgerError> {
        Ok(self.locks.read().get(lock_key).cloned())
    }

    // =========================================================================
    // Dead letters
    // =========================================================================

    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<bool, LedgerError> {
        let mut dead_letters = self.dead_letters.write();
        if dead_letters.values().any(|d| d.run_id == dead_letter.run_id) {
            return Ok(false);
        }
        dead_letters.insert(dead_letter.id, dead_letter.clone());
        Ok(true)
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, LedgerError> {
        self.dead_letters
            .read()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::DeadLetterNotFound(id))
    }

    async fn list_dead_letters(
        &self,
        workflow: Option<&str>,
        include_resolved: bool,
        pagination: Pagination,
    ) -> Result<Page<DeadLetter>, LedgerError> {
        let dead_letters = self.dead_letters.read();
        let mut matching: Vec<DeadLetter> = dead_letters
            .values()
            .filter(|d| workflow.is_none_or(|w| d.workflow_name == w))
            .filter(|d| include_resolved || !d.is_resolved())
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(Page::new(items, total, pagination))
    }

    async fn update_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), LedgerError> {
        let mut dead_letters = self.dead_letters.write();
        if !dead_letters.contains_key(&dead_letter.id) {
            return Err(LedgerError::DeadLetterNotFound(dead_letter.id));
        }
        dead_letters.insert(dead_letter.id, dead_letter.clone());
        Ok(())
    }

    // =========================================================================
    // Watermarks
    // =========================================================================

    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        high_water: &str,
    ) -> Result<Watermark, LedgerError> {
        let key = (
            domain.to_string(),
            source.to_string(),
            partition_key.to_string(),
        );
        let mut watermarks = self.watermarks.write();

        let watermark = watermarks
            .entry(key)
            .and_modify(|w| {
                w.advance_to(high_water);
            })
            .or_insert_with(|| Watermark::new(domain, source, partition_key, high_water));

        Ok(watermark.clone())
    }

    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, LedgerError> {
        let key = (
            domain.to_string(),
            source.to_string(),
            partition_key.to_string(),
        );
        Ok(self.watermarks.read().get(&key).cloned())
    }

    async fn list_watermarks(&self, domain: Option<&str>) -> Result<Vec<Watermark>, LedgerError> {
        let mut marks: Vec<Watermark> = self
            .watermarks
            .read()
            .values()
            .filter(|w| domain.is_none_or(|d| w.domain == d))
            .cloned()
            .collect();
        marks.sort_by(|a, b| {
            (&a.domain, &a.source, &a.partition_key).cmp(&(&b.domain, &b.source, &b.partition_key))
        });
        Ok(marks)
    }

    async fn delete_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<bool, LedgerError> {
        let key = (
            domain.to_string(),
            source.to_string(),
            partition_key.to_string(),
        );
        Ok(self.watermarks.write().remove(&key).is_some())
    }

    async fn list_watermark_gaps(
        &self,
        domain: &str,
        source: &str,
        expected_partitions: &[String],
    ) -> Result<Vec<WatermarkGap>, LedgerError> {
        let watermarks = self.watermarks.read();
        let existing: Vec<&Watermark> = watermarks
            .values()
            .filter(|w| w.domain == domain && w.source == source)
            .collect();
        Ok(find_gaps(existing, expected_partitions))
    }

    // =========================================================================
    // Backfill plans
    // =========================================================================

    async fn save_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), LedgerError> {
        self.plans.write().insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn get_backfill_plan(&self, plan_id: Uuid) -> Result<BackfillPlan, LedgerError> {
        self.plans
            .read()
            .get(&plan_id)
            .cloned()
            .ok_or(LedgerError::PlanNotFound(plan_id))
    }

    async fn list_backfill_plans(
        &self,
        domain: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<BackfillPlan>, LedgerError> {
        let plans = self.plans.read();
        let mut matching: Vec<BackfillPlan> = plans
            .values()
            .filter(|p| domain.is_none_or(|d| p.domain == d))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(Page::new(items, total, pagination))
    }

    // =========================================================================
    // Sources
    // =========================================================================

    async fn create_source(&self, source: &Source) -> Result<(), LedgerError> {
        let mut sources = self.sources.write();
        if sources.values().any(|s| s.name == source.name) {
            return Err(LedgerError::DuplicateName(source.name.clone()));
        }
        sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn get_source(&self, id: Uuid) -> Result<Source, LedgerError> {
        self.sources
            .read()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::SourceNotFound(id))
    }

    async fn get_source_by_name(&self, name: &str) -> Result<Option<Source>, LedgerError> {
        Ok(self
            .sources
            .read()
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_sources(&self, domain: Option<&str>) -> Result<Vec<Source>, LedgerError> {
        let mut sources: Vec<Source> = self
            .sources
            .read()
            .values()
            .filter(|s| domain.is_none_or(|d| s.domain == d))
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn set_source_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, LedgerError> {
        let mut sources = self.sources.write();
        match sources.get_mut(&id) {
            Some(source) => {
                source.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_source_fetch(&self, fetch: &SourceFetch) -> Result<(), LedgerError> {
        self.source_fetches.write().push(fetch.clone());
        Ok(())
    }

    async fn list_source_fetches(
        &self,
        source_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<SourceFetch>, LedgerError> {
        let fetches = self.source_fetches.read();
        let mut matching: Vec<SourceFetch> = fetches
            .iter()
            .filter(|f| f.source_id == source_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(Page::new(items, total, pagination))
    }

    async fn get_cached_content_hash(
        &self,
        source_id: Uuid,
    ) -> Result<Option<String>, LedgerError> {
        Ok(self.content_hashes.read().get(&source_id).cloned())
    }

    async fn put_cached_content_hash(
        &self,
        source_id: Uuid,
        content_hash: &str,
    ) -> Result<(), LedgerError> {
        self.content_hashes
            .write()
            .insert(source_id, content_hash.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::error::CoreError;
    use relay_core::spec::WorkSpec;
    use serde_json::json;

    fn pending_run(name: &str) -> RunRecord {
        RunRecord::pending(Uuid::now_v7(), WorkSpec::task(name, json!({})))
    }

    #[tokio::test]
    async fn test_run_lifecycle_and_events() {
        let ledger = InMemoryLedger::new();
        let record = pending_run("add");
        let run_id = record.run_id;

        ledger.create_run(&record).await.unwrap();
        ledger
            .update_status(run_id, RunStatus::Running, StatusUpdate::started_now())
            .await
            .unwrap();
        let completed = ledger
            .update_status(
                run_id,
                RunStatus::Completed,
                StatusUpdate::completed(json!({"result": 10})),
            )
            .await
            .unwrap();

        assert_eq!(completed.status, RunStatus::Completed);
        assert_eq!(completed.result, Some(json!({"result": 10})));

        let events = ledger.get_events(run_id, Pagination::default()).await.unwrap();
        let types: Vec<&str> = events.items.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["run.created", "run.started", "run.completed"]);

        // Event ids are monotonic within the run.
        let ids: Vec<i64> = events.items.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let ledger = InMemoryLedger::new();
        let record = pending_run("add");
        ledger.create_run(&record).await.unwrap();

        let result = ledger
            .update_status(
                record.run_id,
                RunStatus::Completed,
                StatusUpdate::completed(json!({})),
            )
            .await;

        assert!(matches!(
            result,
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_event_idempotency_key_dedupe() {
        let ledger = InMemoryLedger::new();
        let record = pending_run("add");
        ledger.create_run(&record).await.unwrap();

        let event = NewEvent::new(record.run_id, "step.completed", json!({}))
            .with_idempotency_key("step-1-done");

        assert!(ledger.record_event(event.clone()).await.unwrap().is_some());
        assert!(ledger.record_event(event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotency_key_lookup_only_sees_active() {
        let ledger = InMemoryLedger::new();
        let record = RunRecord::pending(
            Uuid::now_v7(),
            WorkSpec::task("add", json!({})).with_idempotency_key("k1"),
        );
        ledger.create_run(&record).await.unwrap();

        let found = ledger
            .find_active_run_by_idempotency_key("k1")
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.run_id), Some(record.run_id));

        ledger
            .update_status(record.run_id, RunStatus::Cancelled, StatusUpdate::cancelled_now())
            .await
            .unwrap();
        assert!(ledger
            .find_active_run_by_idempotency_key("k1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_retry_candidates_exclude_retried_runs() {
        let ledger = InMemoryLedger::new();

        let failed = pending_run("flaky");
        ledger.create_run(&failed).await.unwrap();
        ledger
            .update_status(failed.run_id, RunStatus::Running, StatusUpdate::started_now())
            .await
            .unwrap();
        ledger
            .update_status(
                failed.run_id,
                RunStatus::Failed,
                StatusUpdate::failed(&CoreError::transient("blip")),
            )
            .await
            .unwrap();

        let candidates = ledger.list_retry_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 1);

        // A successor run removes the candidate.
        let child = RunRecord::pending(
            Uuid::now_v7(),
            WorkSpec::task("flaky", json!({})).with_parent_run_id(failed.run_id),
        );
        ledger.create_run(&child).await.unwrap();

        assert!(ledger.list_retry_candidates(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_candidates_gate_on_budget_only() {
        let ledger = InMemoryLedger::new();

        // A non-retryable category still qualifies while budget remains.
        let failed = pending_run("broken");
        ledger.create_run(&failed).await.unwrap();
        ledger
            .update_status(failed.run_id, RunStatus::Running, StatusUpdate::started_now())
            .await
            .unwrap();
        ledger
            .update_status(
                failed.run_id,
                RunStatus::Failed,
                StatusUpdate::failed(&CoreError::internal("boom")),
            )
            .await
            .unwrap();
        assert_eq!(ledger.list_retry_candidates(10).await.unwrap().len(), 1);

        // An exhausted budget disqualifies.
        let spent = RunRecord::pending(
            Uuid::now_v7(),
            WorkSpec::task("spent", json!({})).with_max_retries(1),
        )
        .with_retry_count(1);
        ledger.create_run(&spent).await.unwrap();
        ledger
            .update_status(spent.run_id, RunStatus::Running, StatusUpdate::started_now())
            .await
            .unwrap();
        ledger
            .update_status(
                spent.run_id,
                RunStatus::Failed,
                StatusUpdate::failed(&CoreError::transient("blip")),
            )
            .await
            .unwrap();

        let candidates = ledger.list_retry_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].run_id, failed.run_id);
    }

    #[tokio::test]
    async fn test_purge_spares_active_and_recent() {
        let ledger = InMemoryLedger::new();

        let mut old_terminal = pending_run("old");
        old_terminal.created_at = Utc::now() - ChronoDuration::days(40);
        old_terminal.status = RunStatus::Completed;
        ledger.runs.write().insert(old_terminal.run_id, old_terminal.clone());

        let mut old_active = pending_run("active");
        old_active.created_at = Utc::now() - ChronoDuration::days(40);
        ledger.runs.write().insert(old_active.run_id, old_active.clone());

        let recent = pending_run("recent");
        ledger.create_run(&recent).await.unwrap();

        let purged = ledger.purge_old_data(30).await.unwrap();
        assert_eq!(purged, 1);
        assert!(ledger.get_run(old_terminal.run_id).await.is_err());
        assert!(ledger.get_run(old_active.run_id).await.is_ok());
        assert!(ledger.get_run(recent.run_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_schedule_lease_contention() {
        let ledger = InMemoryLedger::new();
        let schedule_id = Uuid::now_v7();

        assert!(ledger
            .try_lease_schedule(schedule_id, "instance-a", 30)
            .await
            .unwrap());
        // Another holder is rejected while the lease is valid.
        assert!(!ledger
            .try_lease_schedule(schedule_id, "instance-b", 30)
            .await
            .unwrap());
        // The same holder refreshes.
        assert!(ledger
            .try_lease_schedule(schedule_id, "instance-a", 30)
            .await
            .unwrap());

        assert!(ledger
            .release_schedule_lease(schedule_id, "instance-a")
            .await
            .unwrap());
        assert!(ledger
            .try_lease_schedule(schedule_id, "instance-b", 30)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_concurrency_lock_reentrancy_and_steal() {
        let ledger = InMemoryLedger::new();
        let holder = Uuid::now_v7();
        let other = Uuid::now_v7();

        assert!(ledger.acquire_lock("etl:daily", holder, 60).await.unwrap());
        assert!(!ledger.acquire_lock("etl:daily", other, 60).await.unwrap());
        // Reentrant for the same execution.
        assert!(ledger.acquire_lock("etl:daily", holder, 60).await.unwrap());

        // Expire the lock, then the other execution can steal it.
        ledger.locks.write().get_mut("etl:daily").unwrap().expires_at =
            Utc::now() - ChronoDuration::seconds(1);
        assert!(ledger.acquire_lock("etl:daily", other, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_lock_owner_check() {
        let ledger = InMemoryLedger::new();
        let holder = Uuid::now_v7();

        ledger.acquire_lock("k", holder, 60).await.unwrap();
        assert!(!ledger
            .release_lock("k", Some(Uuid::now_v7()))
            .await
            .unwrap());
        assert!(ledger.release_lock("k", Some(holder)).await.unwrap());
        assert!(!ledger.release_lock("k", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_expired_locks() {
        let ledger = InMemoryLedger::new();
        ledger.acquire_lock("live", Uuid::now_v7(), 60).await.unwrap();
        ledger.acquire_lock("dead", Uuid::now_v7(), 60).await.unwrap();
        ledger.locks.write().get_mut("dead").unwrap().expires_at =
            Utc::now() - ChronoDuration::seconds(1);

        assert_eq!(ledger.cleanup_expired_locks().await.unwrap(), 1);
        assert!(ledger.get_lock("live").await.unwrap().is_some());
        assert!(ledger.get_lock("dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_idempotent_on_run() {
        let ledger = InMemoryLedger::new();
        let run_id = Uuid::now_v7();

        let first = DeadLetter::capture(run_id, "fail", json!({}), "x", 3);
        let second = DeadLetter::capture(run_id, "fail", json!({}), "x again", 3);

        assert!(ledger.record_dead_letter(&first).await.unwrap());
        assert!(!ledger.record_dead_letter(&second).await.unwrap());
        assert_eq!(ledger.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn test_watermark_advance_is_forward_only() {
        let ledger = InMemoryLedger::new();

        let w = ledger
            .advance_watermark("sec_filings", "edgar", "10-K", "2025-06-15")
            .await
            .unwrap();
        assert_eq!(w.high_water, "2025-06-15");

        let w = ledger
            .advance_watermark("sec_filings", "edgar", "10-K", "2025-09-30")
            .await
            .unwrap();
        assert_eq!(w.high_water, "2025-09-30");

        // Stale advance returns the kept value.
        let w = ledger
            .advance_watermark("sec_filings", "edgar", "10-K", "2025-01-01")
            .await
            .unwrap();
        assert_eq!(w.high_water, "2025-09-30");
    }

    #[tokio::test]
    async fn test_watermark_gaps() {
        let ledger = InMemoryLedger::new();
        for p in ["10-K", "10-Q", "8-K"] {
            ledger
                .advance_watermark("sec_filings", "edgar", p, "2025-09-30")
                .await
                .unwrap();
        }

        let expected: Vec<String> = ["10-K", "10-Q", "8-K", "20-F"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let gaps = ledger
            .list_watermark_gaps("sec_filings", "edgar", &expected)
            .await
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].partition_key, "20-F");
    }

    #[tokio::test]
    async fn test_backfill_plan_save_load() {
        let ledger = InMemoryLedger::new();
        let mut plan = BackfillPlan::create(
            "sec_filings",
            "edgar",
            relay_core::BackfillReason::Gap,
            vec!["2024-Q1".to_string(), "2024-Q2".to_string()],
            "gap_detector",
        );
        plan.start().unwrap();
        plan.mark_partition_done("2024-Q1").unwrap();
        plan.save_checkpoint("after_Q1");

        ledger.save_backfill_plan(&plan).await.unwrap();
        let loaded = ledger.get_backfill_plan(plan.plan_id).await.unwrap();

        assert_eq!(loaded, plan);
        assert_eq!(loaded.checkpoint.as_deref(), Some("after_Q1"));
    }

    #[tokio::test]
    async fn test_source_and_content_hash_cache() {
        let ledger = InMemoryLedger::new();
        let source = Source::new("edgar", "http", "sec_filings");
        ledger.create_source(&source).await.unwrap();

        assert!(ledger
            .get_cached_content_hash(source.id)
            .await
            .unwrap()
            .is_none());
        ledger
            .put_cached_content_hash(source.id, "abc123")
            .await
            .unwrap();
        assert_eq!(
            ledger.get_cached_content_hash(source.id).await.unwrap(),
            Some("abc123".to_string())
        );

        // Duplicate source name rejected.
        let dup = Source::new("edgar", "http", "sec_filings");
        assert!(matches!(
            ledger.create_source(&dup).await,
            Err(LedgerError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_list_runs_pagination_and_sort() {
        let ledger = InMemoryLedger::new();
        for i in 0..5 {
            let mut record = pending_run(&format!("task-{i}"));
            record.created_at = Utc::now() - ChronoDuration::seconds(10 - i);
            ledger.runs.write().insert(record.run_id, record);
        }

        let page = ledger
            .list_runs(
                RunFilter::default(),
                Pagination::new(2, 0),
                RunSort::CreatedAtDesc,
            )
            .await
            .unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 5);
        assert!(page.has_more());
        // Newest first.
        assert_eq!(page.items[0].spec.name, "task-4");

        let by_name = ledger
            .list_runs(RunFilter::default(), Pagination::new(10, 0), RunSort::Name)
            .await
            .unwrap();
        assert_eq!(by_name.items[0].spec.name, "task-0");
    }

    #[tokio::test]
    async fn test_mark_schedule_run_forward_only() {
        let ledger = InMemoryLedger::new();
        let schedule = Schedule::new(
            "s1",
            relay_core::WorkKind::Operation,
            "etl",
            relay_core::Cadence::Interval { seconds: 60 },
        );
        ledger.create_schedule(&schedule).await.unwrap();

        let now = Utc::now();
        let updated = ledger
            .mark_schedule_run(
                schedule.schedule_id,
                now,
                Some(now + ChronoDuration::seconds(60)),
                "dispatched",
                true,
            )
            .await
            .unwrap();
        let next = updated.next_run_at.unwrap();

        // A stale next_run_at does not move the schedule backwards.
        let updated = ledger
            .mark_schedule_run(
                schedule.schedule_id,
                now,
                Some(now - ChronoDuration::seconds(60)),
                "dispatched",
                true,
            )
            .await
            .unwrap();
        assert_eq!(updated.next_run_at.unwrap(), next);
        assert!(updated.version > schedule.version);
    }
}
