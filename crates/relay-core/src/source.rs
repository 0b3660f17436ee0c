//! Sources and fetch history
//!
//! A source is an upstream a pipeline pulls from; each pull is recorded as a
//! fetch. Fetches carry a content hash so an unchanged upstream can be
//! skipped idempotently.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An upstream data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,

    /// Kind of source (http, file, sftp, vendor-specific, ...). Opaque to
    /// the core; interpreted by the fetcher.
    pub kind: String,

    #[serde(default)]
    pub config: serde_json::Value,

    pub domain: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            kind: kind.into(),
            config: serde_json::Value::Null,
            domain: domain.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Outcome of a fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    Failed,
    NotFound,
    /// Content hash matched the cached hash; nothing to process.
    Unchanged,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
            Self::Unchanged => "unchanged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "not_found" => Some(Self::NotFound),
            "unchanged" => Some(Self::Unchanged),
            _ => None,
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded pull from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFetch {
    pub id: Uuid,
    pub source_id: Uuid,
    pub status: FetchStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_count: Option<u64>,

    /// sha-256 of the fetched content, hex-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub retry_count: u32,

    /// Point-in-time identifier linking downstream runs to this fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<Uuid>,
}

impl SourceFetch {
    /// Start a fetch record; completion fields are filled by the fetch
    /// service.
    pub fn started(source_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            source_id,
            status: FetchStatus::Failed,
            record_count: None,
            byte_count: None,
            content_hash: None,
            etag: None,
            last_modified: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            error: None,
            retry_count: 0,
            capture_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_status_round_trip() {
        for status in [
            FetchStatus::Success,
            FetchStatus::Failed,
            FetchStatus::NotFound,
            FetchStatus::Unchanged,
        ] {
            assert_eq!(FetchStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_source_builder() {
        let source = Source::new("edgar", "http", "sec_filings")
            .with_config(serde_json::json!({"base_url": "https://example.test"}));

        assert!(source.enabled);
        assert_eq!(source.domain, "sec_filings");
        assert_eq!(source.config["base_url"], "https://example.test");
    }
}
