//! Run records and the run lifecycle state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::spec::WorkSpec;

/// Lifecycle status of a run.
///
/// ```text
/// PENDING ──► RUNNING ──► COMPLETED
///    │            │
///    │            └─► FAILED ──► DEAD_LETTERED
///    └─► CANCELLED (from PENDING or RUNNING)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting for a worker.
    Pending,

    /// A worker is executing the handler.
    Running,

    /// Handler returned successfully.
    Completed,

    /// Handler failed; may still be retried as a new run.
    Failed,

    /// Cancelled before completion.
    Cancelled,

    /// Failed with the retry budget exhausted; captured in the DLQ.
    DeadLettered,
}

impl RunStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::DeadLettered
        )
    }

    /// Whether `next` is a legal transition from this status.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Cancelled) => true,
            (Self::Failed, Self::DeadLettered) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry for one execution attempt.
///
/// The spec is denormalised onto the record so the audit trail survives
/// handler re-registration and spec evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub spec: WorkSpec,
    pub status: RunStatus,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Only set when COMPLETED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Only set when FAILED or DEAD_LETTERED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,

    /// How many prior runs this lineage has already consumed.
    pub retry_count: u32,

    /// Links the run to the source fetch that produced its input, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<Uuid>,
}

impl RunRecord {
    /// Create a fresh PENDING record for a spec.
    pub fn pending(run_id: Uuid, spec: WorkSpec) -> Self {
        Self {
            run_id,
            spec,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_type: None,
            error_category: None,
            retry_count: 0,
            capture_id: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_capture_id(mut self, capture_id: Uuid) -> Self {
        self.capture_id = Some(capture_id);
        self
    }

    /// Whether the run can still be cancelled.
    pub fn is_active(&self) -> bool {
        matches!(self.status, RunStatus::Pending | RunStatus::Running)
    }

    /// Whether the retry budget allows another attempt.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.spec.max_retries
    }
}

/// Fields applied alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    /// Update for a RUNNING transition.
    pub fn started_now() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Update for a COMPLETED transition.
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Update for a FAILED transition.
    pub fn failed(error: &crate::error::CoreError) -> Self {
        Self {
            error: Some(error.message.clone()),
            error_type: Some(error.error_type().to_string()),
            error_category: Some(error.category),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Update for a CANCELLED transition.
    pub fn cancelled_now() -> Self {
        Self {
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legal_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Failed.can_transition_to(RunStatus::DeadLettered));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::DeadLettered.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::DeadLettered.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::DeadLettered,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_pending_record() {
        let spec = WorkSpec::task("add", json!({"a": 1}));
        let record = RunRecord::pending(Uuid::now_v7(), spec);

        assert_eq!(record.status, RunStatus::Pending);
        assert!(record.is_active());
        assert!(record.has_retry_budget());
        assert!(record.result.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_retry_budget() {
        let spec = WorkSpec::task("add", json!({})).with_max_retries(1);
        let record = RunRecord::pending(Uuid::now_v7(), spec).with_retry_count(1);
        assert!(!record.has_retry_budget());
    }

    #[test]
    fn test_record_serde_round_trip() {
        let spec = WorkSpec::task("add", json!({"a": 1, "b": 2}));
        let record = RunRecord::pending(Uuid::now_v7(), spec);

        let json = serde_json::to_string(&record).unwrap();
        let parsed: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, parsed);
    }
}
