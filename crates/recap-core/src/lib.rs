//! Recap Core Library
//!
//! Foundational types shared by every recap crate:
//!
//! - Domain models (`RecapKey`, `RecapRecord`, `RecapInput`)
//! - The store traits the orchestrator is composed from
//! - Unified error handling with HTTP response mapping
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
