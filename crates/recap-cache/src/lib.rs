//! Cache tier for the recap service
//!
//! Implements the fail-soft `CacheStore` contract from recap-core:
//! every transport failure or timeout is logged here and reported to the
//! caller as a miss, `false`, or a no-op. The cache is never a hard
//! dependency of a read.
//!
//! # Features
//!
//! - `RedisCache`: multiplexed access via Redis ConnectionManager, one
//!   connection attempt at startup, permanent degraded mode if it fails
//! - `MemoryCache`: bounded in-process TTL store (moka) with the same semantics
//! - Set-if-absent locks with expiry for stampede protection
//!
//! # Example
//!
//! ```no_run
//! use recap_cache::RedisCache;
//! use recap_core::traits::CacheStore;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = RedisCache::connect("redis://127.0.0.1:6379", Duration::from_millis(500)).await;
//!
//!     cache.set_with_ttl("recap:42", "{}", Duration::from_secs(60)).await;
//!     let value = cache.get("recap:42").await;
//!     assert_eq!(value.as_deref(), Some("{}"));
//! }
//! ```

pub mod keys;
pub mod memory;

pub use keys::RecapKeys;
pub use memory::MemoryCache;

use async_trait::async_trait;
use recap_core::error::AppError;
use recap_core::traits::CacheStore;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Upper bound on establishing the initial connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Value stored under lock keys
const LOCK_VALUE: &str = "1";

/// Redis cache with fail-soft semantics
///
/// Holds `None` instead of a connection when the server was unreachable at
/// startup; in that state every operation is a miss or no-op and no
/// reconnection is attempted inline with requests.
#[derive(Clone)]
pub struct RedisCache {
    manager: Option<ConnectionManager>,
    op_timeout: Duration,
}

impl RedisCache {
    /// Connect to Redis, falling back to degraded mode on failure
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `op_timeout` - Budget for every individual cache command
    pub async fn connect(url: &str, op_timeout: Duration) -> Self {
        match Self::new(url, op_timeout).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Redis unavailable, continuing without cache: {}", e);
                Self::disabled(op_timeout)
            }
        }
    }

    /// Connect to Redis, failing if the server cannot be reached
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheConnection` if the URL is invalid, the
    /// connection cannot be established, or the server does not answer PING
    pub async fn new(url: &str, op_timeout: Duration) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::CacheConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                AppError::CacheConnection(format!(
                    "Connection timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| {
                error!("Failed to establish Redis connection: {}", e);
                AppError::CacheConnection(format!("Connection failed: {}", e))
            })?;

        let cache = Self {
            manager: Some(manager),
            op_timeout,
        };
        cache.ping().await?;

        info!("Redis connection established");
        Ok(cache)
    }

    /// A cache that is permanently disabled
    pub fn disabled(op_timeout: Duration) -> Self {
        Self {
            manager: None,
            op_timeout,
        }
    }

    /// Ping the Redis server to check connectivity
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheConnection` when running degraded and
    /// `AppError::Cache` if the ping fails or times out
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self
            .manager
            .clone()
            .ok_or_else(|| AppError::CacheConnection("cache disabled".to_string()))?;

        let ping = redis::cmd("PING");
        let reply: RedisResult<String> = timeout(self.op_timeout, ping.query_async(&mut conn))
            .await
            .map_err(|_| AppError::Cache("Ping timed out".to_string()))?;

        reply.map_err(|e| {
            error!("Redis ping failed: {}", e);
            AppError::Cache(format!("Ping failed: {}", e))
        })?;
        Ok(())
    }

    /// Run one command under the operation timeout, absorbing failures
    async fn run<T, F, Fut>(&self, op: &'static str, key: &str, command: F) -> Option<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.manager.clone()?;

        match timeout(self.op_timeout, command(conn)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                Self::log_redis_error(op, key, &e);
                None
            }
            Err(_) => {
                warn!(
                    op,
                    key,
                    timeout_ms = self.op_timeout.as_millis() as u64,
                    "Redis command timed out"
                );
                None
            }
        }
    }

    fn log_redis_error(op: &'static str, key: &str, err: &RedisError) {
        match err.kind() {
            redis::ErrorKind::IoError => {
                warn!(op, key, error = %err, "Redis I/O error, treating as cache miss");
            }
            redis::ErrorKind::TypeError => {
                warn!(op, key, error = %err, "Redis type mismatch");
            }
            _ => {
                error!(op, key, error = %err, "Redis error");
            }
        }
    }
}

/// Whole seconds for Redis expiries; Redis rejects a zero expiry
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        debug!("GET {}", key);
        self.run("get", key, |mut conn| async move {
            conn.get::<_, Option<String>>(key).await
        })
        .await
        .flatten()
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        debug!("SET {} (TTL: {}s)", key, expiry_secs(ttl));
        self.run("set", key, |mut conn| async move {
            conn.set_ex::<_, _, ()>(key, value, expiry_secs(ttl)).await
        })
        .await
        .is_some()
    }

    async fn delete(&self, key: &str) {
        debug!("DEL {}", key);
        self.run("del", key, |mut conn| async move {
            conn.del::<_, i64>(key).await
        })
        .await;
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> bool {
        debug!("SET NX {} (TTL: {}s)", key, expiry_secs(ttl));
        // SET key value EX ttl NX - returns OK if set, nil if key exists
        let reply = self
            .run("lock", key, |mut conn| async move {
                let reply: RedisResult<Option<String>> = redis::cmd("SET")
                    .arg(key)
                    .arg(LOCK_VALUE)
                    .arg("EX")
                    .arg(expiry_secs(ttl))
                    .arg("NX")
                    .query_async(&mut conn)
                    .await;
                reply
            })
            .await;

        matches!(reply, Some(Some(_)))
    }

    async fn release_lock(&self, key: &str) {
        self.delete(key).await;
    }

    fn is_available(&self) -> bool {
        self.manager.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    async fn setup_cache() -> RedisCache {
        let cache = RedisCache::new(REDIS_URL, Duration::from_millis(500))
            .await
            .expect("Failed to connect to Redis");
        cache.delete("test:recap:1").await;
        cache.delete("test:recap:1:lock").await;
        cache
    }

    #[test]
    fn test_expiry_secs_never_zero() {
        assert_eq!(expiry_secs(Duration::from_millis(10)), 1);
        assert_eq!(expiry_secs(Duration::from_secs(900)), 900);
    }

    #[tokio::test]
    async fn test_disabled_cache_fails_soft() {
        let cache = RedisCache::disabled(Duration::from_millis(50));

        assert!(!cache.is_available());
        assert_eq!(cache.get("recap:1").await, None);
        assert!(!cache.set_with_ttl("recap:1", "{}", Duration::from_secs(1)).await);
        assert!(!cache.try_acquire_lock("recap:1:lock", Duration::from_secs(1)).await);
        cache.delete("recap:1").await;
        cache.release_lock("recap:1:lock").await;
        assert!(matches!(
            cache.ping().await,
            Err(AppError::CacheConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_degrades() {
        // Nothing listens on port 1
        let cache = RedisCache::connect("redis://127.0.0.1:1", Duration::from_millis(50)).await;
        assert!(!cache.is_available());
        assert_eq!(cache.get("recap:1").await, None);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = RedisCache::new("not-a-url", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AppError::CacheConnection(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_set_get_delete() {
        let cache = setup_cache().await;

        assert!(cache.set_with_ttl("test:recap:1", "{\"a\":1}", Duration::from_secs(60)).await);
        assert_eq!(cache.get("test:recap:1").await.as_deref(), Some("{\"a\":1}"));

        cache.delete("test:recap:1").await;
        assert_eq!(cache.get("test:recap:1").await, None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_lock_is_exclusive_until_released() {
        let cache = setup_cache().await;
        let ttl = Duration::from_secs(10);

        assert!(cache.try_acquire_lock("test:recap:1:lock", ttl).await);
        assert!(!cache.try_acquire_lock("test:recap:1:lock", ttl).await);

        cache.release_lock("test:recap:1:lock").await;
        assert!(cache.try_acquire_lock("test:recap:1:lock", ttl).await);
        cache.release_lock("test:recap:1:lock").await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_ttl_on_set() {
        let cache = setup_cache().await;

        assert!(cache.set_with_ttl("test:recap:1", "{}", Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.get("test:recap:1").await, None);
    }
}
