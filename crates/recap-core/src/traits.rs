//! Store and collaborator traits
//!
//! The orchestrator is composed from these seams; concrete implementations
//! live in `recap-db` (primary store) and `recap-cache` (cache tier).

use crate::error::AppError;
use crate::models::{RecapEvent, RecapInput, RecapKey, RecapRecord, UpsertMode, UpsertReport};
use async_trait::async_trait;
use std::time::Duration;

/// Durable source of truth for recap records
///
/// Errors are never swallowed here: connection, query and transaction
/// failures propagate to the caller.
#[async_trait]
pub trait RecapRepository: Send + Sync {
    /// Single-row lookup; `Ok(None)` when no record exists for `key`
    async fn fetch(&self, key: RecapKey) -> Result<Option<RecapRecord>, AppError>;

    /// Insert-or-update each input keyed by its user id
    ///
    /// In [`UpsertMode::Transactional`] any row failure rolls back the whole
    /// batch and returns an error. In [`UpsertMode::PerRow`] failures are
    /// counted in the report and the remaining rows are still written.
    async fn upsert(
        &self,
        records: &[RecapInput],
        mode: UpsertMode,
    ) -> Result<UpsertReport, AppError>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), AppError>;
}

/// Volatile key/value tier with TTL and lock-by-key
///
/// Every method fails soft: transport failures and timeouts are logged by
/// the implementation and reported as a miss, `false`, or a no-op. Payload
/// validation is the caller's job.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Raw payload stored at `key`, or `None` on miss or failure
    async fn get(&self, key: &str) -> Option<String>;

    /// Store `value` with an expiry; `false` when the write did not happen
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool;

    /// Remove `key` (best-effort)
    async fn delete(&self, key: &str);

    /// Set-if-absent with expiry; `true` only if this call created the lock
    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> bool;

    /// Release a lock by deleting it (best-effort, no ownership check)
    async fn release_lock(&self, key: &str);

    /// `false` when the store runs permanently degraded (cache disabled)
    fn is_available(&self) -> bool {
        true
    }
}

/// Fire-and-forget sink for read-path events
///
/// Implementations must not panic and must not block; `record` has no way
/// to report failure back to the read path.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: RecapEvent);
}
