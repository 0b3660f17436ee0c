//! Per-run workflow scratch space and step results

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Terminal (and running) status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    /// All required steps succeeded.
    Completed,
    /// CONTINUE mode with at least one failed and one completed step.
    Partial,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Fail,
    Skipped,
}

/// What a step produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreError>,

    /// Dynamic routing: jump to this step next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,

    /// Why the step was skipped, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepResult {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Ok,
            output: Some(output),
            error: None,
            next_step: None,
            skip_reason: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            status: StepStatus::Ok,
            output: None,
            error: None,
            next_step: None,
            skip_reason: None,
        }
    }

    pub fn fail(error: CoreError) -> Self {
        Self {
            status: StepStatus::Fail,
            output: None,
            error: Some(error),
            next_step: None,
            skip_reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            output: None,
            error: None,
            next_step: None,
            skip_reason: Some(reason.into()),
        }
    }

    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_step = Some(step.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }

    pub fn is_fail(&self) -> bool {
        self.status == StepStatus::Fail
    }
}

/// Mutable per-run scratch space the runner threads through the steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub run_id: Uuid,

    /// Submission params, read-only for steps.
    pub params: serde_json::Value,

    /// Step outputs merged under each step's name, plus anything steps set.
    pub state: BTreeMap<String, serde_json::Value>,

    pub step_results: BTreeMap<String, StepResult>,
}

impl WorkflowContext {
    pub fn new(run_id: Uuid, params: serde_json::Value) -> Self {
        Self {
            run_id,
            params,
            state: BTreeMap::new(),
            step_results: BTreeMap::new(),
        }
    }

    /// Record a step result, merging its output into `state` under the step
    /// name.
    pub fn record_step(&mut self, step_name: &str, result: StepResult) {
        if let Some(output) = &result.output {
            self.state.insert(step_name.to_string(), output.clone());
        }
        self.step_results.insert(step_name.to_string(), result);
    }

    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps_with_status(StepStatus::Ok)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps_with_status(StepStatus::Fail)
    }

    pub fn skipped_steps(&self) -> Vec<&str> {
        self.steps_with_status(StepStatus::Skipped)
    }

    fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.step_results
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
