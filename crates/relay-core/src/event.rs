//! Execution events
//!
//! Every state transition in the core appends an event. Events are immutable
//! once written and totally ordered per run by `event_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable event-type names emitted by the core.
pub mod event_type {
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_CANCELLED: &str = "run.cancelled";
    pub const RUN_DEAD_LETTERED: &str = "run.dead_lettered";

    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_SKIPPED: &str = "step.skipped";

    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_PARTIAL: &str = "workflow.partial";

    pub const SCHEDULE_TRIGGERED: &str = "schedule.triggered";
    pub const SCHEDULE_SKIPPED_MISFIRE: &str = "schedule.skipped_misfire";

    pub const DLQ_RECORDED: &str = "dlq.recorded";
    pub const DLQ_REPLAYED: &str = "dlq.replayed";
    pub const DLQ_RESOLVED: &str = "dlq.resolved";

    pub const WATERMARK_ADVANCED: &str = "watermark.advanced";
    pub const BACKFILL_PLANNED: &str = "backfill.planned";
    pub const BACKFILL_STARTED: &str = "backfill.started";
    pub const BACKFILL_PARTITION_DONE: &str = "backfill.partition_done";
    pub const BACKFILL_COMPLETED: &str = "backfill.completed";
    pub const BACKFILL_CANCELLED: &str = "backfill.cancelled";
}

/// Append-only record of one state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Monotonic within a run; assigned by the ledger.
    pub event_id: i64,

    pub run_id: Uuid,

    /// Workflow step this event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    pub event_type: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Unique dedupe key; a duplicate record is silently skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// An event to be appended; the ledger assigns `event_id` and `timestamp`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub run_id: Uuid,
    pub step_id: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(run_id: Uuid, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            run_id,
            step_id: None,
            event_type: event_type.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Event published on the bus: the execution event plus its type for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_type: String,

    /// Run the event belongs to, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,

    #[serde(default)]
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            run_id: None,
            payload,
            timestamp: Utc::now(),
            idempotency_key: None,
        }
    }

    pub fn for_run(run_id: Uuid, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            run_id: Some(run_id),
            payload,
            timestamp: Utc::now(),
            idempotency_key: None,
        }
    }

    /// Whether this event matches a subscription pattern.
    ///
    /// Patterns are exact (`run.completed`), the single wildcard `*`, or a
    /// prefix wildcard (`run.*`).
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return self
                .event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
        }
        self.event_type == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_matching() {
        let event = BusEvent::new(event_type::RUN_COMPLETED, json!({}));

        assert!(event.matches("*"));
        assert!(event.matches("run.completed"));
        assert!(event.matches("run.*"));
        assert!(!event.matches("run.failed"));
        assert!(!event.matches("step.*"));
        assert!(!event.matches("run"));
    }

    #[test]
    fn test_prefix_match_requires_separator() {
        // "run.*" must not match an event type that merely starts with "run".
        let event = BusEvent::new("runaway.completed", json!({}));
        assert!(!event.matches("run.*"));
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = ExecutionEvent {
            event_id: 42,
            run_id: Uuid::now_v7(),
            step_id: Some("classify".to_string()),
            event_type: event_type::STEP_COMPLETED.to_string(),
            timestamp: Utc::now(),
            payload: json!({"output": {"is_annual": true}}),
            idempotency_key: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
