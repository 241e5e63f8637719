//! Application configuration
//!
//! Centralized configuration management using the `config` crate.
//! Values come from built-in defaults, optional `config/default` and
//! `config/{RUN_MODE}` files, then `RECAP__SECTION__FIELD` environment
//! variables.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Comma-separated list of allowed CORS origins
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_cors_origins() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// What to do with primary-store callers beyond pool capacity
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Queue up to `max_queued` callers, each waiting at most `acquire_timeout_secs`
    #[default]
    Wait,
    /// Fail immediately once every slot is taken
    Reject,
}

/// Primary store (PostgreSQL) configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Per-query timeout in milliseconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Callers allowed to queue once all connections are busy
    #[serde(default = "default_max_queued")]
    pub max_queued: u32,

    /// Overflow policy beyond `max_connections + max_queued`
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Apply embedded migrations at startup
    #[serde(default)]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_query_timeout() -> u64 {
    5000
}

fn default_max_queued() -> u32 {
    64
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Which cache tier implementation to run
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    Redis,
    /// In-process store, for single-node deployments and local runs
    Memory,
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Cache tier implementation
    #[serde(default)]
    pub backend: CacheBackend,

    /// Timeout for a single cache command in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,

    /// Entry bound of the in-process backend
    #[serde(default = "default_memory_max_entries")]
    pub memory_max_entries: u64,
}

fn default_op_timeout() -> u64 {
    500
}

fn default_memory_max_entries() -> u64 {
    100_000
}

impl RedisConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// How concurrent misses for one key are handled
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StampedeStrategy {
    /// Losers of the lock race back off once, re-read, then fetch directly
    #[default]
    PollOnce,
    /// Callers in this process share one fetch per key; the cross-process
    /// lock still applies to the leader
    Coalesce,
}

/// Read-through cache behaviour
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Key prefix: entries live at `{prefix}:{key}`, locks at `{prefix}:{key}:lock`
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,

    /// Entry TTL in seconds, applied at write time
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Repopulation lock TTL in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Backoff before a lock loser re-reads the cache, in milliseconds
    #[serde(default = "default_contention_backoff")]
    pub contention_backoff_ms: u64,

    /// Stampede protection strategy
    #[serde(default)]
    pub strategy: StampedeStrategy,

    /// Upper bound on one read, in milliseconds (defaults to twice the lock TTL)
    #[serde(default)]
    pub request_deadline_ms: Option<u64>,
}

fn default_cache_prefix() -> String {
    "recap".to_string()
}

fn default_cache_ttl() -> u64 {
    900
}

fn default_lock_ttl() -> u64 {
    10
}

fn default_contention_backoff() -> u64 {
    100
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn contention_backoff(&self) -> Duration {
        Duration::from_millis(self.contention_backoff_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        self.request_deadline_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lock_ttl() * 2)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: default_cache_prefix(),
            ttl_secs: default_cache_ttl(),
            lock_ttl_secs: default_lock_ttl(),
            contention_backoff_ms: default_contention_backoff(),
            strategy: StampedeStrategy::default(),
            request_deadline_ms: None,
        }
    }
}

/// Request signing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Shared secret mixed into request signatures
    #[serde(default)]
    pub signature_secret: Option<String>,

    /// Accepted clock skew for the `timestamp` header, in minutes
    #[serde(default = "default_max_skew")]
    pub max_skew_minutes: i64,

    /// Token required by the admin routes; admin routes are refused when unset
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_max_skew() -> i64 {
    10
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signature_secret: None,
            max_skew_minutes: default_max_skew(),
            admin_token: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config files
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 4000)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("database.url", "postgresql://localhost/recap")?
            .set_default("database.max_connections", 20)?
            .set_default("database.min_connections", 2)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("redis.op_timeout_ms", 500)?
            .set_default("cache.prefix", "recap")?
            .set_default("cache.ttl_secs", 900)?
            .set_default("cache.lock_ttl_secs", 10)?
            .set_default("cache.contention_backoff_ms", 100)?
            .set_default("auth.max_skew_minutes", 10)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with RECAP_ prefix
            .add_source(
                Environment::with_prefix("RECAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get the server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
