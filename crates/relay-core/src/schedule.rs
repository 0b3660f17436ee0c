//! Schedules: when-to-run records and next-run computation
//!
//! Cadence is a sum type, so exactly one of cron expression, interval, or
//! one-shot instant exists per schedule by construction. Next-run arithmetic
//! always starts from the scheduled time, never the actual run time, so
//! schedules do not drift.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::spec::WorkKind;

/// Outcome of the most recent dispatch, recorded on the schedule row.
pub mod last_run_status {
    pub const DISPATCHED: &str = "dispatched";
    pub const SKIPPED_MISFIRE: &str = "skipped_misfire";
    pub const SKIPPED_LEASE: &str = "skipped_lease";
    pub const ERROR: &str = "error";
}

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cadence {
    /// Cron expression (seconds-resolution, `sec min hour dom month dow [year]`).
    Cron { expression: String },

    /// Fixed interval between runs.
    Interval { seconds: u32 },

    /// Fires once at the given instant, then disables itself.
    OneShot { run_at: DateTime<Utc> },
}

impl Cadence {
    pub fn schedule_type(&self) -> &'static str {
        match self {
            Self::Cron { .. } => "cron",
            Self::Interval { .. } => "interval",
            Self::OneShot { .. } => "one_shot",
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Self::Cron { expression } => Some(expression),
            _ => None,
        }
    }

    pub fn interval_seconds(&self) -> Option<u32> {
        match self {
            Self::Interval { seconds } => Some(*seconds),
            _ => None,
        }
    }

    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::OneShot { run_at } => Some(*run_at),
            _ => None,
        }
    }

    /// Rebuild from storage columns; exactly one cadence column must be set.
    pub fn from_columns(
        schedule_type: &str,
        cron_expression: Option<String>,
        interval_seconds: Option<i64>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Self, CoreError> {
        match schedule_type {
            "cron" => cron_expression
                .map(|expression| Self::Cron { expression })
                .ok_or_else(|| CoreError::internal("cron schedule missing expression")),
            "interval" => interval_seconds
                .map(|seconds| Self::Interval {
                    seconds: seconds.max(0) as u32,
                })
                .ok_or_else(|| CoreError::internal("interval schedule missing seconds")),
            "one_shot" => run_at
                .map(|run_at| Self::OneShot { run_at })
                .ok_or_else(|| CoreError::internal("one-shot schedule missing run_at")),
            other => Err(CoreError::internal(format!(
                "unknown schedule type: {other}"
            ))),
        }
    }

    /// Validate the cadence; cron expressions must parse and intervals must
    /// be positive.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::Cron { expression } => {
                cron::Schedule::from_str(expression).map_err(|e| {
                    CoreError::validation(format!("invalid cron expression '{expression}'"))
                        .with_cause(e)
                })?;
                Ok(())
            }
            Self::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(CoreError::validation("interval must be positive"));
                }
                Ok(())
            }
            Self::OneShot { .. } => Ok(()),
        }
    }

    /// The first fire time strictly after `from`, or `None` when the cadence
    /// is exhausted (one-shot in the past, cron with no future occurrence).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { expression } => {
                let schedule = cron::Schedule::from_str(expression).ok()?;
                schedule.after(&from).next()
            }
            Self::Interval { seconds } => {
                Some(from + ChronoDuration::seconds(i64::from(*seconds)))
            }
            Self::OneShot { run_at } => (*run_at > from).then_some(*run_at),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression } => write!(f, "cron({expression})"),
            Self::Interval { seconds } => write!(f, "interval({seconds}s)"),
            Self::OneShot { run_at } => write!(f, "one_shot({run_at})"),
        }
    }
}

/// A when-to-run record. Dispatch happens through the scheduler service,
/// which builds a `WorkSpec` from the target fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: Uuid,

    /// Unique human-readable name.
    pub name: String,

    pub target_kind: WorkKind,
    pub target_name: String,

    #[serde(default)]
    pub params: serde_json::Value,

    pub cadence: Cadence,

    /// IANA timezone name; only `UTC` is supported by the default backend.
    pub timezone: String,

    pub enabled: bool,

    /// Maximum concurrently active runs spawned from this schedule.
    pub max_instances: u32,

    /// Due times lagging by more than this are misfires.
    pub misfire_grace_seconds: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<String>,

    /// Bumped on every update.
    pub version: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        target_kind: WorkKind,
        target_name: impl Into<String>,
        cadence: Cadence,
    ) -> Self {
        let now = Utc::now();
        Self {
            schedule_id: Uuid::now_v7(),
            name: name.into(),
            target_kind,
            target_name: target_name.into(),
            params: serde_json::Value::Null,
            cadence,
            timezone: "UTC".to_string(),
            enabled: true,
            max_instances: 1,
            misfire_grace_seconds: 300,
            last_run_at: None,
            next_run_at: None,
            last_run_status: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_misfire_grace_seconds(mut self, seconds: u32) -> Self {
        self.misfire_grace_seconds = seconds;
        self
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    /// Whether the schedule is due at `now`. A schedule with no computed
    /// `next_run_at` yet is considered due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_none_or(|next| next <= now)
    }

    /// Whether the due time has lagged past the misfire grace.
    pub fn is_misfired(&self, now: DateTime<Utc>) -> bool {
        match self.next_run_at {
            Some(due) => {
                now.signed_duration_since(due)
                    > ChronoDuration::seconds(i64::from(self.misfire_grace_seconds))
            }
            None => false,
        }
    }

    /// Compute the next fire time from the scheduled (not actual) time.
    ///
    /// Forward-only: the result is never earlier than the current
    /// `next_run_at`.
    pub fn compute_next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let base = self.next_run_at.unwrap_or(now);
        let mut next = self.cadence.next_after(base)?;
        // Catch up in one jump when several periods were missed.
        while next <= now {
            next = self.cadence.next_after(next)?;
        }
        if let Some(current) = self.next_run_at {
            if next <= current {
                return Some(current);
            }
        }
        Some(next)
    }
}

/// A record of one dispatch from a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ScheduleRun {
    pub fn dispatched(schedule_id: Uuid, scheduled_at: DateTime<Utc>, run_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            schedule_id,
            scheduled_at,
            run_id: Some(run_id),
            status: last_run_status::DISPATCHED.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn skipped(schedule_id: Uuid, scheduled_at: DateTime<Utc>, status: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            schedule_id,
            scheduled_at,
            run_id: None,
            status: status.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Lease row granting one scheduler instance the right to dispatch a
/// schedule. Valid iff `now < expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleLock {
    pub schedule_id: Uuid,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ScheduleLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
