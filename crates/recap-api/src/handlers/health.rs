//! Health check

use crate::dto::{HealthResponse, ServiceReport, ServiceStatus};
use actix_web::{web, HttpResponse};
use recap_services::{CacheCounters, DynRecapOrchestrator};
use tracing::warn;

/// Report primary and cache status with read-path counters
///
/// GET /health
///
/// Answers 503 only when the primary store is unreachable; a degraded cache
/// is reported but does not fail the check.
pub async fn health(
    orchestrator: web::Data<DynRecapOrchestrator>,
    counters: Option<web::Data<CacheCounters>>,
) -> HttpResponse {
    let primary = match orchestrator.ping_primary().await {
        Ok(()) => ServiceStatus::Up,
        Err(e) => {
            warn!("Health check: primary store unreachable: {}", e);
            ServiceStatus::Down
        }
    };

    let cache = if orchestrator.cache_available() {
        ServiceStatus::Up
    } else {
        ServiceStatus::Degraded
    };

    let body = HealthResponse {
        status: if primary == ServiceStatus::Up {
            "ok"
        } else {
            "unavailable"
        },
        services: ServiceReport { primary, cache },
        metrics: counters.map(|c| c.snapshot()),
    };

    if primary == ServiceStatus::Up {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Configure health routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health));
}
