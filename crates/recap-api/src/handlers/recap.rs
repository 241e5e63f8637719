//! Recap read handler

use crate::auth::SignedUser;
use actix_web::{web, HttpResponse};
use recap_core::AppError;
use recap_services::DynRecapOrchestrator;
use tracing::{debug, instrument};

/// Fetch the signed-in user's recap
///
/// GET /api/user-data
#[instrument(skip(orchestrator, user), fields(user_id = %user.key))]
pub async fn get_user_data(
    orchestrator: web::Data<DynRecapOrchestrator>,
    user: SignedUser,
) -> Result<HttpResponse, AppError> {
    match orchestrator.get_recap(user.key).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => {
            debug!("No recap for user");
            Err(AppError::NotFound("User not found".to_string()))
        }
    }
}

/// Configure recap routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/user-data", web::get().to(get_user_data));
}
