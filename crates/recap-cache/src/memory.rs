//! In-process cache tier
//!
//! Same contract as the Redis tier, backed by a bounded moka cache. Every
//! entry carries its own TTL; expired entries are never served and are
//! reclaimed by moka's housekeeping, and the capacity bound evicts the
//! least valuable entries once it is reached.

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use recap_core::traits::CacheStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default bound on live entries, locks included
pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;

/// Value stored under lock keys
const LOCK_VALUE: &str = "1";

#[derive(Clone)]
struct Slot {
    value: Arc<str>,
    ttl: Duration,
}

impl Slot {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: Arc::from(value),
            ttl,
        }
    }
}

/// Applies each slot's own TTL, restarting it on overwrite
struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        slot: &Slot,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(slot.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        slot: &Slot,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        Some(slot.ttl)
    }
}

/// Bounded TTL key/value store local to this process
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<String, Slot>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Cache holding at most `max_entries` live keys
    pub fn with_capacity(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(SlotExpiry)
            .build();
        Self { entries }
    }

    /// Whether a live entry exists at `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Entries still held once pending evictions have been applied
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    /// Store a raw payload with no validation; used to seed corrupt entries
    pub async fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .insert(key.to_string(), Slot::new(value, ttl))
            .await;
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).await.map(|slot| slot.value.to_string())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        self.insert_raw(key, value, ttl).await;
        true
    }

    async fn delete(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> bool {
        let entry = self
            .entries
            .entry_by_ref(key)
            .or_insert_with(async { Slot::new(LOCK_VALUE, ttl) })
            .await;

        if !entry.is_fresh() {
            debug!("Lock {} already held", key);
        }
        entry.is_fresh()
    }

    async fn release_lock(&self, key: &str) {
        self.delete(key).await;
    }
}
