//! API layer for the recap service
//!
//! Thin HTTP surface over the recap orchestrator: the signed user-data read,
//! a health check, a Prometheus scrape endpoint, and token-guarded admin
//! routes for cache invalidation and bulk import.

#![forbid(unsafe_code)]

pub mod auth;
pub mod dto;
pub mod handlers;

pub use auth::{AdminAccess, AdminToken, SignatureVerifier, SignedUser};
pub use dto::{ApiResponse, ImportRequest};
pub use handlers::{
    configure, configure_admin, configure_health, configure_metrics, configure_recaps,
};
