//! Admin handlers: cache invalidation and bulk import

use crate::auth::AdminAccess;
use crate::dto::{ApiResponse, ImportRequest};
use actix_web::{web, HttpResponse};
use recap_core::models::RecapKey;
use recap_core::AppError;
use recap_services::DynRecapOrchestrator;
use tracing::{info, instrument, warn};
use validator::Validate;

/// Import bodies are large; allow up to 16 MiB
const IMPORT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Drop one cached recap
///
/// DELETE /api/v1/recaps/{id}/cache
#[instrument(skip(orchestrator, _admin))]
pub async fn invalidate_cache(
    orchestrator: web::Data<DynRecapOrchestrator>,
    path: web::Path<String>,
    _admin: AdminAccess,
) -> Result<HttpResponse, AppError> {
    let raw = path.into_inner();
    let key: RecapKey = raw
        .parse()
        .map_err(|_| AppError::InvalidInput(format!("Invalid user id: {}", raw)))?;
    orchestrator.invalidate(key).await;
    Ok(HttpResponse::NoContent().finish())
}

/// Bulk upsert recaps and invalidate their cache entries
///
/// POST /api/v1/recaps/import
#[instrument(skip(orchestrator, _admin, req))]
pub async fn import_recaps(
    orchestrator: web::Data<DynRecapOrchestrator>,
    _admin: AdminAccess,
    req: web::Json<ImportRequest>,
) -> Result<HttpResponse, AppError> {
    req.validate().map_err(|e| {
        warn!("Import validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let report = orchestrator
        .upsert_and_invalidate(&req.records, req.mode)
        .await?;

    info!(
        inserted = report.inserted,
        failed = report.failed,
        "Recap import finished"
    );

    Ok(HttpResponse::Ok().json(ApiResponse::with_message(
        report,
        format!("Imported {} recaps", report.inserted),
    )))
}

/// Configure admin routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/recaps")
            .app_data(web::JsonConfig::default().limit(IMPORT_BODY_LIMIT))
            .route("/import", web::post().to(import_recaps))
            .route("/{id}/cache", web::delete().to(invalidate_cache)),
    );
}
