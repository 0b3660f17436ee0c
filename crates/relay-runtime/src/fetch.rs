//! Source fetch layer
//!
//! Cursor-resumable fetching with fetch history and a content-hash cache:
//! when an upstream's content hash matches the last successful fetch, the
//! pull is recorded as UNCHANGED and downstream processing is skipped.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use relay_core::error::CoreError;
use relay_core::source::{FetchStatus, Source, SourceFetch};
use relay_storage::{Ledger, LedgerError, Page, Pagination};

/// Raw content pulled from a source.
#[derive(Debug, Clone)]
pub struct FetchPayload {
    pub body: Vec<u8>,
    pub record_count: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,

    /// Cursor to resume from on the next fetch, if the source paginates.
    pub next_cursor: Option<String>,
}

/// What a fetcher found upstream.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(FetchPayload),
    NotFound,
}

/// Pulls content from a source, optionally resuming from a cursor.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &Source,
        cursor: Option<&str>,
    ) -> Result<FetchOutcome, CoreError>;
}

/// Errors from the fetch service.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("source '{0}' is disabled")]
    SourceDisabled(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),
}

/// Result of one fetch pass, with the recorded history row.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub fetch: SourceFetch,

    /// Present only for SUCCESS fetches; unchanged and failed pulls carry no
    /// new content.
    pub body: Option<Vec<u8>>,

    pub next_cursor: Option<String>,
}

/// Records fetch attempts and skips unchanged upstream content by hash.
pub struct FetchService {
    ledger: Arc<dyn Ledger>,
    cache_enabled: bool,
}

impl FetchService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            cache_enabled: true,
        }
    }

    /// Disable the content-hash cache (`cache_backend = none`): every pull
    /// is treated as new content.
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Fetch a source by name and record the attempt.
    #[instrument(skip(self, fetcher))]
    pub async fn fetch_source(
        &self,
        fetcher: &dyn SourceFetcher,
        source_name: &str,
        cursor: Option<&str>,
    ) -> Result<FetchReport, FetchError> {
        let source = self
            .ledger
            .get_source_by_name(source_name)
            .await?
            .ok_or_else(|| FetchError::UnknownSource(source_name.to_string()))?;
        if !source.enabled {
            return Err(FetchError::SourceDisabled(source.name));
        }

        let started = Instant::now();
        let mut fetch = SourceFetch::started(source.id);

        let report = match fetcher.fetch(&source, cursor).await {
            Ok(FetchOutcome::Found(payload)) => {
                let content_hash = hash_content(&payload.body);
                let cached = if self.cache_enabled {
                    self.ledger.get_cached_content_hash(source.id).await?
                } else {
                    None
                };

                fetch.byte_count = Some(payload.body.len() as u64);
                fetch.record_count = payload.record_count;
                fetch.etag = payload.etag.clone();
                fetch.last_modified = payload.last_modified.clone();
                fetch.content_hash = Some(content_hash.clone());

                if cached.as_deref() == Some(content_hash.as_str()) {
                    debug!(source = %source.name, "content unchanged, skipping");
                    fetch.status = FetchStatus::Unchanged;
                    FetchReport {
                        fetch: fetch.clone(),
                        body: None,
                        next_cursor: payload.next_cursor,
                    }
                } else {
                    self.ledger
                        .put_cached_content_hash(source.id, &content_hash)
                        .await?;
                    fetch.status = FetchStatus::Success;
                    fetch.capture_id = Some(Uuid::now_v7());
                    info!(
                        source = %source.name,
                        bytes = payload.body.len(),
                        "fetched new content"
                    );
                    FetchReport {
                        fetch: fetch.clone(),
                        body: Some(payload.body),
                        next_cursor: payload.next_cursor,
                    }
                }
            }
            Ok(FetchOutcome::NotFound) => {
                fetch.status = FetchStatus::NotFound;
                FetchReport {
                    fetch: fetch.clone(),
                    body: None,
                    next_cursor: None,
                }
            }
            Err(error) => {
                warn!(source = %source.name, %error, "fetch failed");
                fetch.status = FetchStatus::Failed;
                fetch.error = Some(error.message.clone());
                FetchReport {
                    fetch: fetch.clone(),
                    body: None,
                    next_cursor: None,
                }
            }
        };

        let mut recorded = report.fetch.clone();
        recorded.duration_ms = started.elapsed().as_millis() as u64;
        recorded.completed_at = Some(chrono::Utc::now());
        self.ledger.record_source_fetch(&recorded).await?;

        Ok(FetchReport {
            fetch: recorded,
            ..report
        })
    }

    /// Fetch history for a source, newest first.
    pub async fn history(
        &self,
        source_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<SourceFetch>, FetchError> {
        Ok(self.ledger.list_source_fetches(source_id, pagination).await?)
    }
}

/// Hex-encoded sha-256 of fetched content.
pub fn hash_content(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = hash_content(b"hello");
        let b = hash_content(b"hello");
        let c = hash_content(b"world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
