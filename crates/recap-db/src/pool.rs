//! PostgreSQL connection pool management
//!
//! The pool is created once at startup and handed to repositories as an
//! explicit handle. On top of sqlx's own pool this module tracks the pool
//! lifecycle and bounds how many callers may be in flight or queued for a
//! connection at any time.

use recap_core::config::{DatabaseConfig, OverflowPolicy};
use recap_core::{AppError, AppResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Create a PostgreSQL connection pool
///
/// # Example
///
/// ```no_run
/// use recap_core::AppConfig;
/// use recap_db::create_pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = AppConfig::load()?;
///     let pool = create_pool(&config.database).await?;
///     Ok(())
/// }
/// ```
pub async fn create_pool(config: &DatabaseConfig) -> AppResult<PgPool> {
    info!("Creating database connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .test_before_acquire(true)
        .connect(&config.url)
        .await
        .map_err(|e| {
            warn!("Failed to create database pool: {}", e);
            AppError::Pool(format!("Failed to connect to database: {}", e))
        })?;

    info!(
        "Database pool created successfully with {} max connections",
        config.max_connections
    );

    // Test the connection
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| AppError::Database(format!("Database health check failed: {}", e)))?;

    info!("Database connection verified");

    Ok(pool)
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Database(format!("Migration failed: {}", e)))?;

    info!("Database migrations applied");
    Ok(())
}

/// Lifecycle of the primary store pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Uninitialized = 0,
    Ready = 1,
    Draining = 2,
    Closed = 3,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Uninitialized,
            1 => PoolState::Ready,
            2 => PoolState::Draining,
            _ => PoolState::Closed,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Ready => "ready",
            PoolState::Draining => "draining",
            PoolState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Forward-only state machine: uninitialized, ready, draining, closed
#[derive(Debug)]
pub struct PoolLifecycle {
    state: AtomicU8,
}

impl Default for PoolLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolLifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PoolState::Uninitialized as u8),
        }
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Uninitialized -> Ready; `false` if the pool was already past that point
    pub fn mark_ready(&self) -> bool {
        self.transition(PoolState::Uninitialized, PoolState::Ready)
    }

    /// Ready -> Draining; only the first caller gets `true`
    pub fn begin_drain(&self) -> bool {
        self.transition(PoolState::Ready, PoolState::Draining)
    }

    pub fn mark_closed(&self) {
        self.state.store(PoolState::Closed as u8, Ordering::Release);
    }

    /// Error unless the pool accepts new work
    pub fn ensure_ready(&self) -> AppResult<()> {
        match self.state() {
            PoolState::Ready => Ok(()),
            state => Err(AppError::Pool(format!("Database pool is {}", state))),
        }
    }

    fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Proof of admission to the primary store; the slot frees on drop
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

/// Bounded admission in front of the connection pool
///
/// At most `capacity` callers (in flight plus queued inside sqlx) are
/// admitted at once. Beyond that, `Reject` fails immediately and `Wait`
/// waits for a slot up to a fixed timeout.
#[derive(Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    policy: OverflowPolicy,
    wait_timeout: Duration,
}

impl AdmissionGate {
    pub fn new(capacity: usize, policy: OverflowPolicy, wait_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
            wait_timeout,
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(
            (config.max_connections + config.max_queued) as usize,
            config.overflow,
            config.acquire_timeout(),
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Callers currently holding an admission
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Admit one caller according to the overflow policy
    ///
    /// # Errors
    ///
    /// Returns `AppError::Pool` when the gate is saturated (reject policy),
    /// the wait times out (wait policy), or the gate has been closed
    pub async fn admit(&self) -> AppResult<Admission> {
        let permit = match self.policy {
            OverflowPolicy::Reject => {
                self.permits
                    .clone()
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::Closed => closed_error(),
                        TryAcquireError::NoPermits => {
                            warn!(capacity = self.capacity, "Primary store saturated, rejecting");
                            AppError::Pool(format!(
                                "Primary store saturated ({} callers admitted)",
                                self.capacity
                            ))
                        }
                    })?
            }
            OverflowPolicy::Wait => {
                match timeout(self.wait_timeout, self.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(closed_error()),
                    Err(_) => {
                        warn!(
                            capacity = self.capacity,
                            wait_ms = self.wait_timeout.as_millis() as u64,
                            "Timed out waiting for primary store admission"
                        );
                        return Err(AppError::Pool(format!(
                            "Timed out after {}ms waiting for a database slot",
                            self.wait_timeout.as_millis()
                        )));
                    }
                }
            }
        };

        Ok(Admission { _permit: permit })
    }

    /// Wait for every admitted caller to finish, then refuse all new ones
    ///
    /// Returns `false` if callers were still in flight when `grace` ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let all = self.capacity as u32;
        let drained = matches!(
            timeout(grace, self.permits.acquire_many(all)).await,
            Ok(Ok(_))
        );
        self.permits.close();
        drained
    }
}

fn closed_error() -> AppError {
    AppError::Pool("Database pool is closed".to_string())
}

/// The primary store pool together with its lifecycle and admission gate
///
/// Cheap to clone; all clones share the same pool and state.
#[derive(Clone)]
pub struct ManagedPool {
    pool: PgPool,
    lifecycle: Arc<PoolLifecycle>,
    gate: Arc<AdmissionGate>,
}

impl ManagedPool {
    /// Connect, optionally migrate, and mark the pool ready
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let pool = create_pool(config).await?;

        if config.run_migrations {
            run_migrations(&pool).await?;
        }

        Ok(Self::new(pool, AdmissionGate::from_config(config)))
    }

    /// Wrap an existing pool; the result is ready for use
    pub fn new(pool: PgPool, gate: AdmissionGate) -> Self {
        let lifecycle = Arc::new(PoolLifecycle::new());
        lifecycle.mark_ready();
        Self {
            pool,
            lifecycle,
            gate: Arc::new(gate),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle.state()
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Admit one primary-store operation
    ///
    /// # Errors
    ///
    /// Returns `AppError::Pool` if the pool is not ready or the admission
    /// gate refuses the caller
    pub async fn admit(&self) -> AppResult<Admission> {
        self.lifecycle.ensure_ready()?;
        self.gate.admit().await
    }

    /// Drain in-flight work for up to `grace`, then close every connection
    pub async fn close(&self, grace: Duration) {
        if !self.lifecycle.begin_drain() {
            debug!("Database pool already {}", self.state());
            return;
        }

        info!(
            in_flight = self.gate.in_flight(),
            "Draining database pool"
        );

        if !self.gate.drain(grace).await {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Closing database pool with operations still in flight"
            );
        }

        self.pool.close().await;
        self.lifecycle.mark_closed();

        info!("Database pool closed");
    }
}
