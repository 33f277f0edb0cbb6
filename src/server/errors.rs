use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::JobError;

/// Body returned when no trigger secret is deployed.
pub const MISSING_SECRET_MESSAGE: &str = "Cron-Konfiguration fehlt";

pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, axum::Json(json!({ "error": message.into() }))).into_response()
}

pub fn job_error_to_response(err: JobError) -> Response {
    match err {
        JobError::Configuration { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, MISSING_SECRET_MESSAGE)
        }
        JobError::Unauthorized => json_error(StatusCode::UNAUTHORIZED, "Unauthorized"),
        JobError::UnknownTrigger { .. } | JobError::UnknownTaskId { .. } => {
            json_error(StatusCode::NOT_FOUND, err.to_string())
        }
        JobError::AlreadyExecuting { ref task_id } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": err.to_string(),
                "task": task_id,
                "skipped": true,
            })),
        )
            .into_response(),
        JobError::Validation { ref violations, .. } => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": err.to_string(),
                "violations": violations
                    .iter()
                    .map(|v| json!({ "field": v.field, "reason": v.reason }))
                    .collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        JobError::Serialization(_) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
        JobError::Queue { .. } => json_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}
