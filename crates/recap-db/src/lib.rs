//! Recap Primary Store
//!
//! PostgreSQL access for the recap service. It includes:
//!
//! - Connection pool creation with sqlx
//! - Pool lifecycle (uninitialized, ready, draining, closed) and a bounded
//!   admission gate in front of the pool
//! - `PgRecapRepository`, the durable source of truth for recap records
//! - Embedded schema migrations

pub mod pool;
pub mod repositories;

pub use pool::{create_pool, run_migrations, AdmissionGate, ManagedPool, PoolLifecycle, PoolState};
pub use repositories::*;

// Re-export commonly used types
pub use recap_core::{AppError, AppResult};
pub use sqlx::PgPool;
