//! Read-through recap orchestrator
//!
//! A read goes cache first. On a miss one caller wins the per-key
//! repopulation lock, fetches from the primary store and writes the cache;
//! the others back off once, re-read, and fetch directly if the entry is
//! still missing. With [`StampedeStrategy::Coalesce`] callers in this
//! process additionally share a single in-flight fetch per key.
//!
//! Cache failures never reach the caller. Primary failures always do.

use crate::policy::ReadPolicy;
use parking_lot::Mutex;
use recap_core::config::StampedeStrategy;
use recap_core::models::{
    payload_preview, FetchOutcome, RecapEvent, RecapInput, RecapKey, RecapRecord, UpsertMode,
    UpsertReport,
};
use recap_core::traits::{CacheStore, MetricsSink, RecapRepository};
use recap_core::{AppError, AppResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

type FetchResult = AppResult<Option<RecapRecord>>;

/// Orchestrator over trait objects, for backends chosen at runtime
pub type DynRecapOrchestrator = RecapOrchestrator<dyn RecapRepository, dyn CacheStore>;

/// Per-key in-flight fetches shared between coalesced callers
type InFlight = Mutex<HashMap<RecapKey, watch::Receiver<Option<FetchResult>>>>;

enum Flight {
    Leader(watch::Sender<Option<FetchResult>>),
    Follower(watch::Receiver<Option<FetchResult>>),
}

/// Removes the leader's in-flight entry however the leader finishes
struct FlightGuard<'a> {
    in_flight: &'a InFlight,
    key: RecapKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Read-through cache-aside access to recap records
pub struct RecapOrchestrator<P: ?Sized, C: ?Sized> {
    primary: Arc<P>,
    cache: Arc<C>,
    metrics: Arc<dyn MetricsSink>,
    policy: ReadPolicy,
    in_flight: InFlight,
}

impl<P, C> RecapOrchestrator<P, C>
where
    P: RecapRepository + ?Sized,
    C: CacheStore + ?Sized,
{
    pub fn new(
        primary: Arc<P>,
        cache: Arc<C>,
        metrics: Arc<dyn MetricsSink>,
        policy: ReadPolicy,
    ) -> Self {
        Self {
            primary,
            cache,
            metrics,
            policy,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ReadPolicy {
        &self.policy
    }

    /// Fetch one recap, serving from the cache when possible
    ///
    /// Returns `Ok(None)` when the primary store has no record for `key`.
    ///
    /// # Errors
    ///
    /// Primary store failures propagate unchanged. A primary fetch or the
    /// whole read running past its budget yields `AppError::Timeout`.
    #[instrument(skip(self))]
    pub async fn get_recap(&self, key: RecapKey) -> FetchResult {
        match timeout(self.policy.request_deadline, self.read(key)).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record(RecapEvent::DeadlineExceeded);
                warn!(
                    deadline_ms = self.policy.request_deadline.as_millis() as u64,
                    "Recap read exceeded its deadline"
                );
                Err(AppError::Timeout(format!(
                    "recap {} not served within {}ms",
                    key,
                    self.policy.request_deadline.as_millis()
                )))
            }
        }
    }

    /// Drop the cached entry for `key` (best-effort)
    pub async fn invalidate(&self, key: RecapKey) {
        let entry_key = self.policy.keys.entry(key);
        self.cache.delete(&entry_key).await;
        info!("Invalidated cache entry {}", entry_key);
    }

    /// Write records to the primary store, then invalidate their cache entries
    ///
    /// # Errors
    ///
    /// Propagates the primary store error; nothing is invalidated then.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn upsert_and_invalidate(
        &self,
        records: &[RecapInput],
        mode: UpsertMode,
    ) -> AppResult<UpsertReport> {
        let report = self.primary.upsert(records, mode).await?;

        let keys: BTreeSet<RecapKey> = records.iter().map(RecapInput::key).collect();
        for key in keys {
            self.invalidate(key).await;
        }

        Ok(report)
    }

    /// Check that the primary store is reachable
    pub async fn ping_primary(&self) -> AppResult<()> {
        self.primary.ping().await
    }

    pub fn cache_available(&self) -> bool {
        self.cache.is_available()
    }

    async fn read(&self, key: RecapKey) -> FetchResult {
        if let Some(record) = self.read_cache(key).await {
            self.metrics.record(RecapEvent::CacheHit);
            debug!("Recap cache HIT");
            return Ok(Some(record));
        }
        self.metrics.record(RecapEvent::CacheMiss);
        debug!("Recap cache MISS");

        match self.policy.strategy {
            StampedeStrategy::PollOnce => self.repopulate(key).await,
            StampedeStrategy::Coalesce => self.coalesced(key).await,
        }
    }

    /// Valid cached record, purging the entry if it is corrupt
    async fn read_cache(&self, key: RecapKey) -> Option<RecapRecord> {
        let entry_key = self.policy.keys.entry(key);
        let raw = self.cache.get(&entry_key).await?;

        match RecapRecord::decode_cached(&raw, key) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    key = %entry_key,
                    len = raw.len(),
                    preview = %payload_preview(&raw),
                    error = %e,
                    "Corrupt cache entry, purging"
                );
                self.metrics.record(RecapEvent::CacheCorrupt);
                self.cache.delete(&entry_key).await;
                None
            }
        }
    }

    /// Miss path guarded by the cross-process repopulation lock
    async fn repopulate(&self, key: RecapKey) -> FetchResult {
        if !self.cache.is_available() {
            return self.fetch_primary(key).await;
        }

        let lock_key = self.policy.keys.lock(key);
        if self
            .cache
            .try_acquire_lock(&lock_key, self.policy.lock_ttl)
            .await
        {
            self.metrics.record(RecapEvent::LockAcquired);
            return self.fetch_and_store(key, Some(&lock_key)).await;
        }

        self.metrics.record(RecapEvent::LockContended);
        debug!(
            backoff_ms = self.policy.contention_backoff.as_millis() as u64,
            "Repopulation lock held elsewhere, backing off"
        );
        sleep(self.policy.contention_backoff).await;

        if let Some(record) = self.read_cache(key).await {
            self.metrics.record(RecapEvent::ContentionResolved);
            return Ok(Some(record));
        }

        self.metrics.record(RecapEvent::ContentionFallback);
        debug!("Entry still missing after backoff, fetching directly");
        self.fetch_and_store(key, None).await
    }

    /// Single-flight per key within this process
    ///
    /// If the leader is dropped before finishing, its followers fall back to
    /// the lock-based path on their own.
    async fn coalesced(&self, key: RecapKey) -> FetchResult {
        let flight = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(rx) => Flight::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key, rx);
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Leader(tx) => {
                let _guard = FlightGuard {
                    in_flight: &self.in_flight,
                    key,
                };
                let result = self.repopulate(key).await;
                tx.send_replace(Some(result.clone()));
                result
            }
            Flight::Follower(mut rx) => {
                self.metrics.record(RecapEvent::Coalesced);
                let shared = match rx.wait_for(Option::is_some).await {
                    Ok(value) => value.clone(),
                    Err(_) => None,
                };
                match shared {
                    Some(result) => result,
                    None => {
                        debug!("In-flight fetch abandoned, repopulating");
                        self.repopulate(key).await
                    }
                }
            }
        }
    }

    /// Fetch from the primary, cache a found record, then release the lock
    ///
    /// The lock is released on every outcome that returns here; a caller
    /// dropped mid-fetch leaves it to expire with its TTL.
    async fn fetch_and_store(&self, key: RecapKey, lock_key: Option<&str>) -> FetchResult {
        let result = self.fetch_primary(key).await;

        if let Ok(Some(record)) = &result {
            self.store(key, record).await;
        }

        if let Some(lock_key) = lock_key {
            self.cache.release_lock(lock_key).await;
        }

        result
    }

    async fn fetch_primary(&self, key: RecapKey) -> FetchResult {
        let started = Instant::now();

        let result = match timeout(self.policy.primary_timeout, self.primary.fetch(key)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "primary fetch for {} exceeded {}ms",
                key,
                self.policy.primary_timeout.as_millis()
            ))),
        };

        let outcome = match &result {
            Ok(Some(_)) => FetchOutcome::Found,
            Ok(None) => FetchOutcome::NotFound,
            Err(AppError::Timeout(_)) => FetchOutcome::TimedOut,
            Err(_) => FetchOutcome::Failed,
        };
        self.metrics.record(RecapEvent::PrimaryFetch {
            outcome,
            elapsed: started.elapsed(),
        });

        if let Err(e) = &result {
            error!("Primary fetch failed: {}", e);
        }

        result
    }

    /// Best-effort cache write
    async fn store(&self, key: RecapKey, record: &RecapRecord) {
        let payload = match record.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode recap {} for caching: {}", key, e);
                self.metrics.record(RecapEvent::CacheWriteFailed);
                return;
            }
        };

        let entry_key = self.policy.keys.entry(key);
        if self
            .cache
            .set_with_ttl(&entry_key, &payload, self.policy.entry_ttl)
            .await
        {
            self.metrics.record(RecapEvent::CacheWrite);
        } else {
            warn!("Failed to cache recap at {}", entry_key);
            self.metrics.record(RecapEvent::CacheWriteFailed);
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CacheCounters;
    use async_trait::async_trait;
    use recap_cache::{MemoryCache, RedisCache};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Primary store double that counts fetches
    #[derive(Default)]
    struct CountingRepo {
        records: Mutex<HashMap<RecapKey, RecapRecord>>,
        fetches: AtomicUsize,
        delay: Duration,
        failure: Option<AppError>,
    }

    impl CountingRepo {
        fn with(records: Vec<RecapRecord>) -> Self {
            Self {
                records: Mutex::new(records.into_iter().map(|r| (r.user_id, r)).collect()),
                ..Self::default()
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self, failure: AppError) -> Self {
            self.failure = Some(failure);
            self
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecapRepository for CountingRepo {
        async fn fetch(&self, key: RecapKey) -> AppResult<Option<RecapRecord>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if let Some(failure) = &self.failure {
                return Err(failure.clone());
            }
            Ok(self.records.lock().get(&key).cloned())
        }

        async fn upsert(
            &self,
            records: &[RecapInput],
            _mode: UpsertMode,
        ) -> AppResult<UpsertReport> {
            let mut stored = self.records.lock();
            for input in records {
                stored.insert(input.key(), input.to_record());
            }
            Ok(UpsertReport {
                inserted: records.len(),
                failed: 0,
            })
        }

        async fn ping(&self) -> AppResult<()> {
            Ok(())
        }
    }

    /// Cache double whose every operation fails the way a dead transport does
    #[derive(Default)]
    struct FailingCache {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for FailingCache {
        async fn get(&self, _key: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            None
        }

        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }

        async fn delete(&self, _key: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn try_acquire_lock(&self, _key: &str, _ttl: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }

        async fn release_lock(&self, _key: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ada() -> RecapRecord {
        RecapRecord::new(RecapKey(42), "Ada", 7)
    }

    fn orchestrator<P, C>(
        primary: Arc<P>,
        cache: Arc<C>,
        policy: ReadPolicy,
    ) -> (RecapOrchestrator<P, C>, Arc<CacheCounters>)
    where
        P: RecapRepository,
        C: CacheStore,
    {
        let counters = Arc::new(CacheCounters::new());
        let orchestrator = RecapOrchestrator::new(primary, cache, counters.clone(), policy);
        (orchestrator, counters)
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_primary() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]));
        let cache = Arc::new(MemoryCache::new());
        let mut cached = ada();
        cached.user_name = "Ada (cached)".to_string();
        cache
            .set_with_ttl("recap:42", &cached.encode().unwrap(), Duration::from_secs(60))
            .await;

        let (orchestrator, counters) = orchestrator(repo.clone(), cache, ReadPolicy::default());

        let record = orchestrator.get_recap(RecapKey(42)).await.unwrap().unwrap();
        assert_eq!(record, cached);
        assert_eq!(repo.fetches(), 0);
        assert_eq!(counters.snapshot().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_read_then_hit_then_corruption_heals() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]));
        let cache = Arc::new(MemoryCache::new());
        let (orchestrator, counters) =
            orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());

        // Cold cache
        let first = orchestrator.get_recap(RecapKey(42)).await.unwrap();
        assert_eq!(first, Some(ada()));
        assert_eq!(repo.fetches(), 1);
        assert!(cache.contains("recap:42"));
        assert!(!cache.contains("recap:42:lock"));

        // Within TTL
        let second = orchestrator.get_recap(RecapKey(42)).await.unwrap();
        assert_eq!(second, Some(ada()));
        assert_eq!(repo.fetches(), 1);

        // Corrupted entry
        cache
            .insert_raw("recap:42", "not json", Duration::from_secs(60))
            .await;
        let third = orchestrator.get_recap(RecapKey(42)).await.unwrap();
        assert_eq!(third, Some(ada()));
        assert_eq!(repo.fetches(), 2);

        let rewritten = cache.get("recap:42").await.unwrap();
        assert_eq!(RecapRecord::decode_cached(&rewritten, RecapKey(42)).unwrap(), ada());
        assert_eq!(counters.snapshot().corrupt, 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_deleted_even_when_record_is_gone() {
        let repo = Arc::new(CountingRepo::default());
        let cache = Arc::new(MemoryCache::new());
        cache
            .insert_raw("recap:7", "{\"userId\": \"seven\"", Duration::from_secs(60))
            .await;

        let (orchestrator, _) = orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());

        assert_eq!(orchestrator.get_recap(RecapKey(7)).await.unwrap(), None);
        assert!(!cache.contains("recap:7"));
        assert_eq!(repo.fetches(), 1);
    }

    #[tokio::test]
    async fn test_entry_for_another_key_is_treated_as_corrupt() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]));
        let cache = Arc::new(MemoryCache::new());
        let stranger = RecapRecord::new(RecapKey(99), "Mallory", 1);
        cache
            .insert_raw(
                "recap:42",
                &stranger.encode().unwrap(),
                Duration::from_secs(60),
            )
            .await;

        let (orchestrator, _) = orchestrator(repo.clone(), cache, ReadPolicy::default());

        assert_eq!(orchestrator.get_recap(RecapKey(42)).await.unwrap(), Some(ada()));
        assert_eq!(repo.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]).delayed(Duration::from_millis(50)));
        let cache = Arc::new(MemoryCache::new());
        let (orchestrator, counters) =
            orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());
        let orchestrator = Arc::new(orchestrator);

        let callers: Vec<_> = (0..50)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.get_recap(RecapKey(42)).await })
            })
            .collect();

        for result in futures::future::join_all(callers).await {
            assert_eq!(result.unwrap().unwrap(), Some(ada()));
        }

        assert_eq!(repo.fetches(), 1);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.locks_acquired, 1);
        assert_eq!(snapshot.lock_contention, 49);
        assert_eq!(snapshot.contention_resolved, 49);
        assert!(!cache.contains("recap:42:lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_holder_lets_losers_fetch_directly() {
        // Lock holder outlives the backoff, so every loser falls back once
        let repo = Arc::new(CountingRepo::with(vec![ada()]).delayed(Duration::from_millis(500)));
        let cache = Arc::new(MemoryCache::new());
        let (orchestrator, counters) =
            orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());
        let orchestrator = Arc::new(orchestrator);

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.get_recap(RecapKey(42)).await })
            })
            .collect();

        for result in futures::future::join_all(callers).await {
            assert_eq!(result.unwrap().unwrap(), Some(ada()));
        }

        assert_eq!(repo.fetches(), 5);
        assert_eq!(counters.snapshot().contention_fallback, 4);
        assert!(cache.contains("recap:42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_cache_still_serves_from_primary() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]));
        let cache = Arc::new(FailingCache::default());
        let (orchestrator, _) = orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());

        assert_eq!(orchestrator.get_recap(RecapKey(42)).await.unwrap(), Some(ada()));
        assert_eq!(orchestrator.get_recap(RecapKey(42)).await.unwrap(), Some(ada()));
        assert_eq!(orchestrator.get_recap(RecapKey(404)).await.unwrap(), None);

        assert_eq!(repo.fetches(), 3);
        assert!(cache.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_skips_lock_and_backoff() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]));
        let cache = Arc::new(RedisCache::disabled(Duration::from_millis(10)));
        let (orchestrator, counters) = orchestrator(repo.clone(), cache, ReadPolicy::default());

        assert_eq!(orchestrator.get_recap(RecapKey(42)).await.unwrap(), Some(ada()));
        assert_eq!(orchestrator.get_recap(RecapKey(1)).await.unwrap(), None);
        assert!(!orchestrator.cache_available());

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.lock_contention, 0);
        assert_eq!(snapshot.locks_acquired, 0);
        assert_eq!(repo.fetches(), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_fetched_again_once() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]));
        let cache = Arc::new(MemoryCache::new());
        let policy = ReadPolicy {
            entry_ttl: Duration::from_millis(300),
            ..ReadPolicy::default()
        };
        let (orchestrator, _) = orchestrator(repo.clone(), cache, policy);

        orchestrator.get_recap(RecapKey(42)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        orchestrator.get_recap(RecapKey(42)).await.unwrap();
        assert_eq!(repo.fetches(), 1);

        sleep(Duration::from_millis(300)).await;
        orchestrator.get_recap(RecapKey(42)).await.unwrap();
        orchestrator.get_recap(RecapKey(42)).await.unwrap();
        assert_eq!(repo.fetches(), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached_and_lock_is_released() {
        let repo = Arc::new(CountingRepo::default());
        let cache = Arc::new(MemoryCache::new());
        let (orchestrator, _) = orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());

        assert_eq!(orchestrator.get_recap(RecapKey(42)).await.unwrap(), None);
        assert_eq!(orchestrator.get_recap(RecapKey(42)).await.unwrap(), None);

        assert_eq!(repo.fetches(), 2);
        assert!(!cache.contains("recap:42"));
        assert!(!cache.contains("recap:42:lock"));
    }

    #[tokio::test]
    async fn test_primary_error_propagates_and_releases_lock() {
        let repo = Arc::new(
            CountingRepo::with(vec![ada()])
                .failing(AppError::Database("connection reset".to_string())),
        );
        let cache = Arc::new(MemoryCache::new());
        let (orchestrator, counters) =
            orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());

        let err = orchestrator.get_recap(RecapKey(42)).await.unwrap_err();
        assert_eq!(err, AppError::Database("connection reset".to_string()));
        assert!(!cache.contains("recap:42"));
        assert!(!cache.contains("recap:42:lock"));
        assert_eq!(counters.snapshot().primary_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_primary_times_out() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]).delayed(Duration::from_secs(10)));
        let cache = Arc::new(MemoryCache::new());
        let policy = ReadPolicy {
            primary_timeout: Duration::from_secs(1),
            ..ReadPolicy::default()
        };
        let (orchestrator, _) = orchestrator(repo, cache.clone(), policy);

        let err = orchestrator.get_recap(RecapKey(42)).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(!cache.contains("recap:42:lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_bounds_the_whole_read() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]).delayed(Duration::from_secs(10)));
        let cache = Arc::new(MemoryCache::new());
        let policy = ReadPolicy {
            primary_timeout: Duration::from_secs(30),
            request_deadline: Duration::from_secs(2),
            ..ReadPolicy::default()
        };
        let (orchestrator, counters) = orchestrator(repo, cache, policy);

        let err = orchestrator.get_recap(RecapKey(42)).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(msg) if msg.contains("2000ms")));
        assert_eq!(counters.snapshot().deadline_exceeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_shares_one_fetch_in_process() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]).delayed(Duration::from_millis(500)));
        let cache = Arc::new(MemoryCache::new());
        let policy = ReadPolicy::default().with_strategy(StampedeStrategy::Coalesce);
        let (orchestrator, counters) = orchestrator(repo.clone(), cache, policy);
        let orchestrator = Arc::new(orchestrator);

        let callers: Vec<_> = (0..20)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.get_recap(RecapKey(42)).await })
            })
            .collect();

        for result in futures::future::join_all(callers).await {
            assert_eq!(result.unwrap().unwrap(), Some(ada()));
        }

        assert_eq!(repo.fetches(), 1);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.coalesced, 19);
        assert_eq!(snapshot.lock_contention, 0);
        assert_eq!(orchestrator.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_followers_share_leader_error() {
        let repo = Arc::new(
            CountingRepo::default()
                .delayed(Duration::from_millis(100))
                .failing(AppError::Pool("saturated".to_string())),
        );
        let cache = Arc::new(MemoryCache::new());
        let policy = ReadPolicy::default().with_strategy(StampedeStrategy::Coalesce);
        let (orchestrator, _) = orchestrator(repo.clone(), cache, policy);
        let orchestrator = Arc::new(orchestrator);

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.get_recap(RecapKey(42)).await })
            })
            .collect();

        for result in futures::future::join_all(callers).await {
            assert_eq!(
                result.unwrap(),
                Err(AppError::Pool("saturated".to_string()))
            );
        }
        assert_eq!(repo.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_follower_recovers_from_cancelled_leader() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]).delayed(Duration::from_millis(500)));
        let cache = Arc::new(MemoryCache::new());
        let policy = ReadPolicy::default().with_strategy(StampedeStrategy::Coalesce);
        let (orchestrator, _) = orchestrator(repo.clone(), cache, policy);
        let orchestrator = Arc::new(orchestrator);

        let leader = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.get_recap(RecapKey(42)).await })
        };
        tokio::task::yield_now().await;

        let follower = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.get_recap(RecapKey(42)).await })
        };
        tokio::task::yield_now().await;

        leader.abort();

        assert_eq!(follower.await.unwrap().unwrap(), Some(ada()));
        assert_eq!(repo.fetches(), 2);
        assert_eq!(orchestrator.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_upsert_invalidates_written_keys() {
        let repo = Arc::new(CountingRepo::with(vec![ada()]));
        let cache = Arc::new(MemoryCache::new());
        let (orchestrator, _) = orchestrator(repo.clone(), cache.clone(), ReadPolicy::default());

        orchestrator.get_recap(RecapKey(42)).await.unwrap();
        assert!(cache.contains("recap:42"));

        let input: RecapInput = serde_json::from_value(serde_json::json!({
            "user_id": 42,
            "user_name": "Ada Lovelace",
            "trx_count": 8
        }))
        .unwrap();
        let report = orchestrator
            .upsert_and_invalidate(&[input.clone(), input], UpsertMode::PerRow)
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert!(!cache.contains("recap:42"));

        let record = orchestrator.get_recap(RecapKey(42)).await.unwrap().unwrap();
        assert_eq!(record.user_name, "Ada Lovelace");
        assert_eq!(record.trx_count, 8);
    }

    #[tokio::test]
    async fn test_invalidate_missing_entry_is_noop() {
        let repo = Arc::new(CountingRepo::default());
        let cache = Arc::new(MemoryCache::new());
        let (orchestrator, _) = orchestrator(repo, cache.clone(), ReadPolicy::default());

        orchestrator.invalidate(RecapKey(5)).await;
        assert!(!cache.contains("recap:5"));
        assert_eq!(cache.entry_count().await, 0);
    }
}
