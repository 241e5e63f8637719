//! HTTP request handlers

pub mod admin;
pub mod health;
pub mod metrics;
pub mod recap;

use actix_web::web;

pub use admin::configure as configure_admin;
pub use health::configure as configure_health;
pub use metrics::configure as configure_metrics;
pub use recap::configure as configure_recaps;

/// Register every route of the service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.configure(configure_health)
        .configure(configure_metrics)
        .configure(configure_recaps)
        .configure(configure_admin);
}
