//! Dead letters
//!
//! A dead letter captures a run that failed with its retry budget exhausted.
//! The row is the dedupe anchor for replays: replaying creates a new run and
//! bumps the row's retry counter, never a second row for the same run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A terminal failure beyond the retry budget, captured for inspection and
/// controlled replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,

    /// The run that exhausted its budget.
    pub run_id: Uuid,

    /// Handler name of the failed work (task, operation, or workflow).
    pub workflow_name: String,

    #[serde(default)]
    pub params: serde_json::Value,

    pub error: String,

    /// Replays consumed so far.
    pub retry_count: u32,

    /// Replay budget for this dead letter.
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl DeadLetter {
    pub fn capture(
        run_id: Uuid,
        workflow_name: impl Into<String>,
        params: serde_json::Value,
        error: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            workflow_name: workflow_name.into(),
            params,
            error: error.into(),
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            last_retry_at: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// Whether a replay is still allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries && self.resolved_at.is_none()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_can_retry() {
        let mut dl = DeadLetter::capture(Uuid::now_v7(), "fail", json!({}), "boom", 2);
        assert!(dl.can_retry());

        dl.retry_count = 2;
        assert!(!dl.can_retry());

        dl.retry_count = 1;
        dl.resolved_at = Some(Utc::now());
        assert!(!dl.can_retry());
    }

    #[test]
    fn test_serde_round_trip() {
        let dl = DeadLetter::capture(Uuid::now_v7(), "ingest", json!({"cik": "320193"}), "429", 3);
        let json = serde_json::to_string(&dl).unwrap();
        let parsed: DeadLetter = serde_json::from_str(&json).unwrap();
        assert_eq!(dl, parsed);
    }
}
