//! Concurrency guard: per-key mutual exclusion over ledger lock rows
//!
//! The single conditional row write in the ledger is the synchronisation
//! primitive; this service only adds logging and a typed surface.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use relay_core::lock::ConcurrencyLock;
use relay_storage::{Ledger, LedgerError};

/// DB-backed mutual exclusion by logical key with lease expiry.
pub struct ConcurrencyGuard {
    ledger: Arc<dyn Ledger>,
}

impl ConcurrencyGuard {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Acquire the lock for `execution_id`. Succeeds when the key is free,
    /// the current lease is expired, or the same execution already holds it.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError> {
        let acquired = self
            .ledger
            .acquire_lock(lock_key, execution_id, timeout_seconds)
            .await?;
        debug!(%lock_key, acquired, "lock acquisition attempt");
        Ok(acquired)
    }

    /// Release the lock. `execution_id = None` force-releases any holder.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        lock_key: &str,
        execution_id: Option<Uuid>,
    ) -> Result<bool, LedgerError> {
        self.ledger.release_lock(lock_key, execution_id).await
    }

    /// Extend a lease held by `execution_id`.
    #[instrument(skip(self))]
    pub async fn extend(
        &self,
        lock_key: &str,
        execution_id: Uuid,
        timeout_seconds: u32,
    ) -> Result<bool, LedgerError> {
        self.ledger
            .extend_lock(lock_key, execution_id, timeout_seconds)
            .await
    }

    /// Batch-delete expired lock rows; returns how many were removed.
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> Result<u64, LedgerError> {
        let removed = self.ledger.cleanup_expired_locks().await?;
        if removed > 0 {
            debug!(removed, "cleaned up expired locks");
        }
        Ok(removed)
    }

    pub async fn get(&self, lock_key: &str) -> Result<Option<ConcurrencyLock>, LedgerError> {
        self.ledger.get_lock(lock_key).await
    }
}
