//! Structured, resumable backfill plans
//!
//! A plan tracks per-partition progress through a gap-filling or correction
//! replay. Progress is monotonic per partition; a completed partition never
//! reverts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Why a backfill exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillReason {
    Gap,
    Correction,
    SchemaChange,
    QualityFailure,
    Manual,
}

impl BackfillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gap => "gap",
            Self::Correction => "correction",
            Self::SchemaChange => "schema_change",
            Self::QualityFailure => "quality_failure",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gap" => Some(Self::Gap),
            "correction" => Some(Self::Correction),
            "schema_change" => Some(Self::SchemaChange),
            "quality_failure" => Some(Self::QualityFailure),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for BackfillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Planned,
    Running,
    Completed,
    Failed,
    /// Finished with a mix of completed and failed partitions.
    Partial,
    Cancelled,
}

impl BackfillStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Partial | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured replay over a set of partitions.
///
/// Lifecycle: PLANNED → `start()` → RUNNING → per-partition marks →
/// COMPLETED | PARTIAL | FAILED; `cancel()` from any non-terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub plan_id: Uuid,
    pub domain: String,
    pub source: String,
    pub reason: BackfillReason,
    pub partition_keys: Vec<String>,
    pub status: BackfillStatus,

    pub completed_keys: BTreeSet<String>,

    /// Failed partitions with their error messages.
    pub failed_keys: BTreeMap<String, String>,

    /// Opaque resume token saved by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,

    pub created_by: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackfillPlan {
    pub fn create(
        domain: impl Into<String>,
        source: impl Into<String>,
        reason: BackfillReason,
        partition_keys: Vec<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: Uuid::now_v7(),
            domain: domain.into(),
            source: source.into(),
            reason,
            partition_keys,
            status: BackfillStatus::Planned,
            completed_keys: BTreeSet::new(),
            failed_keys: BTreeMap::new(),
            checkpoint: None,
            created_by: created_by.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// PLANNED → RUNNING.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != BackfillStatus::Planned {
            return Err(CoreError::validation(format!(
                "cannot start plan in status {}",
                self.status
            )));
        }
        self.status = BackfillStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark one partition done. Completing the last open partition settles
    /// the terminal status.
    pub fn mark_partition_done(&mut self, partition_key: &str) -> Result<(), CoreError> {
        self.check_partition(partition_key)?;
        self.check_running()?;
        self.failed_keys.remove(partition_key);
        self.completed_keys.insert(partition_key.to_string());
        self.settle_if_finished();
        Ok(())
    }

    /// Mark one partition failed with an error message.
    pub fn mark_partition_failed(
        &mut self,
        partition_key: &str,
        error: impl Into<String>,
    ) -> Result<(), CoreError> {
        self.check_partition(partition_key)?;
        self.check_running()?;
        // Completed partitions never revert.
        if self.completed_keys.contains(partition_key) {
            return Ok(());
        }
        self.failed_keys
            .insert(partition_key.to_string(), error.into());
        self.settle_if_finished();
        Ok(())
    }

    /// Save an opaque resume token.
    pub fn save_checkpoint(&mut self, token: impl Into<String>) {
        self.checkpoint = Some(token.into());
    }

    /// Whether the plan can be resumed after interruption.
    pub fn is_resumable(&self) -> bool {
        self.checkpoint.is_some() && !self.status.is_terminal()
    }

    /// Re-enter RUNNING from an interrupted (still RUNNING) plan; no-op if
    /// already running.
    pub fn resume(&mut self) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::validation(format!(
                "cannot resume plan in terminal status {}",
                self.status
            )));
        }
        self.status = BackfillStatus::Running;
        Ok(())
    }

    /// Cancel from any non-terminal state.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::validation(format!(
                "cannot cancel plan in terminal status {}",
                self.status
            )));
        }
        self.status = BackfillStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Partitions not yet completed or failed.
    pub fn remaining_keys(&self) -> Vec<&str> {
        self.partition_keys
            .iter()
            .filter(|k| !self.completed_keys.contains(*k) && !self.failed_keys.contains_key(*k))
            .map(String::as_str)
            .collect()
    }

    /// Completed share in percent (0–100).
    pub fn progress_pct(&self) -> u32 {
        if self.partition_keys.is_empty() {
            return 100;
        }
        (self.completed_keys.len() * 100 / self.partition_keys.len()) as u32
    }

    fn check_partition(&self, partition_key: &str) -> Result<(), CoreError> {
        if !self.partition_keys.iter().any(|k| k == partition_key) {
            return Err(CoreError::validation(format!(
                "unknown partition '{partition_key}'"
            )));
        }
        Ok(())
    }

    fn check_running(&self) -> Result<(), CoreError> {
        if self.status != BackfillStatus::Running {
            return Err(CoreError::validation(format!(
                "plan is not running (status {})",
                self.status
            )));
        }
        Ok(())
    }

    /// Derive terminal status once every partition has been marked.
    fn settle_if_finished(&mut self) {
        if self.remaining_keys().is_empty() {
            self.status = if self.failed_keys.is_empty() {
                BackfillStatus::Completed
            } else if self.completed_keys.is_empty() {
                BackfillStatus::Failed
            } else {
                BackfillStatus::Partial
            };
            self.completed_at = Some(Utc::now());
        }
    }
}
