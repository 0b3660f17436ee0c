//! Concurrency lock rows
//!
//! Per-key mutual exclusion backed by single ledger rows. A lock is valid
//! iff `now < expires_at`; expired rows are stealable and cleaned lazily.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A DB-backed lease on a logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyLock {
    pub lock_key: String,

    /// Holder; re-acquisition by the same execution is reentrant.
    pub execution_id: Uuid,

    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConcurrencyLock {
    pub fn acquire(lock_key: impl Into<String>, execution_id: Uuid, timeout_seconds: u32) -> Self {
        let now = Utc::now();
        Self {
            lock_key: lock_key.into(),
            execution_id,
            acquired_at: now,
            expires_at: now + ChronoDuration::seconds(i64::from(timeout_seconds)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
