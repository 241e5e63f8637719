//! Read policy for the recap orchestrator

use recap_cache::RecapKeys;
use recap_core::config::{AppConfig, CacheConfig, StampedeStrategy};
use std::time::Duration;

/// Default budget for a single primary-store fetch
const DEFAULT_PRIMARY_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the orchestrator needs to know about timing and keys
#[derive(Debug, Clone)]
pub struct ReadPolicy {
    pub keys: RecapKeys,
    /// TTL applied to each cache write
    pub entry_ttl: Duration,
    /// Expiry of the repopulation lock
    pub lock_ttl: Duration,
    /// How long a lock loser waits before re-reading the cache once
    pub contention_backoff: Duration,
    /// Budget for one primary fetch
    pub primary_timeout: Duration,
    /// Budget for a whole `get_recap` call
    pub request_deadline: Duration,
    pub strategy: StampedeStrategy,
}

impl ReadPolicy {
    pub fn from_config(cache: &CacheConfig, primary_timeout: Duration) -> Self {
        Self {
            keys: RecapKeys::new(cache.prefix.clone()),
            entry_ttl: cache.ttl(),
            lock_ttl: cache.lock_ttl(),
            contention_backoff: cache.contention_backoff(),
            primary_timeout,
            request_deadline: cache.request_deadline(),
            strategy: cache.strategy,
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::from_config(&config.cache, config.database.query_timeout())
    }

    pub fn with_strategy(mut self, strategy: StampedeStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default(), DEFAULT_PRIMARY_TIMEOUT)
    }
}
