//! Data transfer objects for the HTTP API

use recap_core::models::{RecapInput, UpsertMode};
use recap_services::CounterSnapshot;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    /// Response data
    pub data: T,
    /// Response message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a success response with data and message
    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            data,
            message: Some(message.into()),
        }
    }
}

/// Bulk import request body
///
/// Rows are validated individually by the store so that per-row mode can
/// count failures instead of rejecting the whole request.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ImportRequest {
    #[serde(default)]
    pub mode: UpsertMode,

    #[validate(length(min = 1, max = 10000))]
    pub records: Vec<RecapInput>,
}

/// State of one backing service in the health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub primary: ServiceStatus,
    pub cache: ServiceStatus,
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub services: ServiceReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<CounterSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_import_request_defaults_to_transactional() {
        let request: ImportRequest = serde_json::from_value(json!({
            "records": [{"user_id": 1, "user_name": "Ada", "trx_count": 3}]
        }))
        .unwrap();

        assert_eq!(request.mode, UpsertMode::Transactional);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_import_is_invalid() {
        let request: ImportRequest =
            serde_json::from_value(json!({"mode": "per_row", "records": []})).unwrap();

        assert_eq!(request.mode, UpsertMode::PerRow);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_health_response_shape() {
        let response = HealthResponse {
            status: "ok",
            services: ServiceReport {
                primary: ServiceStatus::Up,
                cache: ServiceStatus::Degraded,
            },
            metrics: None,
        };

        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["services"]["cache"], "degraded");
        assert!(value.get("metrics").is_none());
    }
}
