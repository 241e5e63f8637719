//! Prometheus scrape endpoint

use actix_web::{web, HttpResponse};
use recap_core::AppError;
use recap_services::{PrometheusMetrics, METRICS_CONTENT_TYPE};

/// Read-path metrics in the Prometheus text format
///
/// GET /metrics
pub async fn metrics(
    metrics: Option<web::Data<PrometheusMetrics>>,
) -> Result<HttpResponse, AppError> {
    let metrics =
        metrics.ok_or_else(|| AppError::NotFound("Metrics are not enabled".to_string()))?;

    Ok(HttpResponse::Ok()
        .content_type(METRICS_CONTENT_TYPE)
        .body(metrics.encode()?))
}

/// Configure metrics routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics));
}
