use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{Value, json};

use crate::auth;
use crate::core::reporter;
use crate::core::DispatchOptions;
use crate::error::JobError;

use super::errors::{job_error_to_response, json_error};
use super::AppState;

/// Header carrying a per-call deadline in milliseconds.
pub const DEADLINE_HEADER: &str = "x-deadline-ms";

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn deadline(headers: &HeaderMap) -> Result<Option<Duration>, Response> {
    let Some(value) = headers.get(DEADLINE_HEADER) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(|ms| Some(Duration::from_millis(ms)))
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "X-Deadline-Ms must be a positive integer",
            )
        })
}

fn json_body(body: &Bytes) -> Result<Option<Value>, JobError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

/// `GET|POST /api/cron/:trigger`
pub async fn run_trigger(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let deadline = match deadline(&headers) {
        Ok(deadline) => deadline,
        Err(response) => return response,
    };

    // The secret is checked before the body is looked at.
    if let Err(e) = auth::authenticate(
        state.jobsmith.config().cron_secret.as_deref(),
        authorization(&headers),
    ) {
        return job_error_to_response(e);
    }

    let payload = match json_body(&body) {
        Ok(payload) => payload,
        Err(e) => return job_error_to_response(e),
    };

    let options = DispatchOptions { deadline, payload };
    match state
        .jobsmith
        .dispatcher()
        .dispatch(&name, authorization(&headers), options)
        .await
    {
        Ok(report) => {
            let envelope = reporter::report(&report);
            let status = if envelope.ok {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(envelope)).into_response()
        }
        Err(e) => job_error_to_response(e),
    }
}

/// `POST /api/tasks/:task_id`
pub async fn enqueue_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = auth::authenticate(
        state.jobsmith.config().cron_secret.as_deref(),
        authorization(&headers),
    ) {
        return job_error_to_response(e);
    }

    let payload = match json_body(&body) {
        Ok(payload) => payload.unwrap_or_else(|| json!({})),
        Err(e) => return job_error_to_response(e),
    };

    match state.jobsmith.enqueue(&task_id, payload).await {
        Ok(invocation_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "ok": true,
                "invocationId": invocation_id,
                "task": task_id,
            })),
        )
            .into_response(),
        Err(e) => job_error_to_response(e),
    }
}

/// `GET /api/invocations/:id`
pub async fn get_invocation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = auth::authenticate(
        state.jobsmith.config().cron_secret.as_deref(),
        authorization(&headers),
    ) {
        return job_error_to_response(e);
    }

    match state.jobsmith.invocation(&id).await {
        Ok(Some(invocation)) => (StatusCode::OK, Json(invocation)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, format!("Invocation '{id}' not found")),
        Err(e) => job_error_to_response(e),
    }
}

/// `GET /api/stats`
pub async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = auth::authenticate(
        state.jobsmith.config().cron_secret.as_deref(),
        authorization(&headers),
    ) {
        return job_error_to_response(e);
    }

    match state.jobsmith.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => job_error_to_response(e),
    }
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    match state.jobsmith.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
