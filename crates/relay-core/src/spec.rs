//! The uniform work contract
//!
//! A [`WorkSpec`] describes every kind of work the core can run — leaf tasks,
//! composable operations, and whole workflows — so the dispatcher, executor,
//! ledger, and DLQ can treat all of them uniformly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of work a spec describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Leaf compute unit.
    Task,
    /// Composable unit, typically dispatched by workflows.
    Operation,
    /// DAG-shaped composition of steps.
    Workflow,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Operation => "operation",
            Self::Workflow => "workflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "operation" => Some(Self::Operation),
            "workflow" => Some(Self::Workflow),
            _ => None,
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Affects lane selection, not queue reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Realtime,
    High,
    #[default]
    Default,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::High => "high",
            Self::Default => "default",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "realtime" => Some(Self::Realtime),
            "high" => Some(Self::High),
            "default" => Some(Self::Default),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a submission.
pub mod trigger_source {
    pub const CLI: &str = "cli";
    pub const API: &str = "api";
    pub const SCHEDULER: &str = "scheduler";
    pub const WEBHOOK: &str = "webhook";
    pub const RETRY: &str = "retry";
    pub const DLQ_REPLAY: &str = "dlq_replay";
    pub const WORKFLOW: &str = "workflow";
}

/// The default lane when a spec does not name one.
pub const DEFAULT_LANE: &str = "default";

/// Default retry budget for a spec.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retries, in seconds.
pub const DEFAULT_RETRY_DELAY_SECONDS: u32 = 30;

/// Uniform description of one unit of work.
///
/// `(kind, name)` must resolve in the registry at submission time; everything
/// else has defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    pub kind: WorkKind,

    /// Handler name; matches a registry entry of the same kind.
    pub name: String,

    /// Handler inputs.
    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default)]
    pub priority: Priority,

    /// Logical queue; maps to an executor worker pool.
    #[serde(default = "default_lane")]
    pub lane: String,

    /// When set, a submission while a run with the same key is active
    /// returns the existing run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u32,

    /// Wall-clock bound for a single execution attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,

    /// Provenance (cli, api, scheduler, webhook, retry, dlq_replay).
    #[serde(default = "default_trigger_source")]
    pub trigger_source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Causal parent when this run is a retry or a workflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,

    /// Opaque labels for filtering and routing.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_lane() -> String {
    DEFAULT_LANE.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> u32 {
    DEFAULT_RETRY_DELAY_SECONDS
}

fn default_trigger_source() -> String {
    trigger_source::API.to_string()
}

impl WorkSpec {
    /// Create a spec with defaults for everything but kind, name, and params.
    pub fn new(kind: WorkKind, name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind,
            name: name.into(),
            params,
            priority: Priority::Default,
            lane: default_lane(),
            idempotency_key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECONDS,
            timeout_seconds: None,
            trigger_source: default_trigger_source(),
            correlation_id: None,
            parent_run_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A leaf task spec.
    pub fn task(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self::new(WorkKind::Task, name, params)
    }

    /// An operation spec.
    pub fn operation(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self::new(WorkKind::Operation, name, params)
    }

    /// A workflow spec.
    pub fn workflow(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self::new(WorkKind::Workflow, name, params)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_seconds(mut self, seconds: u32) -> Self {
        self.retry_delay_seconds = seconds;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_trigger_source(mut self, source: impl Into<String>) -> Self {
        self.trigger_source = source.into();
        self
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_parent_run_id(mut self, id: Uuid) -> Self {
        self.parent_run_id = Some(id);
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builders() {
        let spec = WorkSpec::operation("ingest_filings", json!({"form": "10-K"}))
            .with_priority(Priority::High)
            .with_lane("ingestion")
            .with_idempotency_key("ingest-10k-2026-02-02")
            .with_timeout_seconds(120);

        assert_eq!(spec.kind, WorkKind::Operation);
        assert_eq!(spec.name, "ingest_filings");
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.lane, "ingestion");
        assert_eq!(spec.idempotency_key.as_deref(), Some("ingest-10k-2026-02-02"));
        assert_eq!(spec.timeout_seconds, Some(120));
        assert_eq!(spec.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_serde_round_trip() {
        let spec = WorkSpec::workflow("daily_etl", json!({"date": "2026-02-02"}))
            .with_trigger_source(trigger_source::SCHEDULER)
            .with_metadata("tenant", "acme");

        let json = serde_json::to_string(&spec).unwrap();
        let parsed: WorkSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let spec: WorkSpec =
            serde_json::from_value(json!({"kind": "task", "name": "add"})).unwrap();

        assert_eq!(spec.lane, DEFAULT_LANE);
        assert_eq!(spec.priority, Priority::Default);
        assert_eq!(spec.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(spec.trigger_source, trigger_source::API);
        assert!(spec.params.is_null());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(WorkKind::parse("task"), Some(WorkKind::Task));
        assert_eq!(WorkKind::parse("operation"), Some(WorkKind::Operation));
        assert_eq!(WorkKind::parse("workflow"), Some(WorkKind::Workflow));
        assert_eq!(WorkKind::parse("step"), None);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("realtime"), Some(Priority::Realtime));
        assert_eq!(Priority::parse("bogus"), None);
    }
}
