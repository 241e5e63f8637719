//! Repository implementations
//!
//! Concrete implementations of the store traits defined in recap-core,
//! using sqlx for PostgreSQL access.

pub mod recap_repo;

pub use recap_repo::PgRecapRepository;
