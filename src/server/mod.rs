//! HTTP surface: the cron trigger endpoint plus enqueue and inspection
//! routes.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use crate::core::Jobsmith;

pub mod errors;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub jobsmith: Arc<Jobsmith>,
}

/// Build the router serving `jobsmith`.
pub fn router(jobsmith: Arc<Jobsmith>) -> Router {
    let state = AppState { jobsmith };

    let api = Router::new()
        .route(
            "/api/cron/:trigger",
            get(routes::run_trigger).post(routes::run_trigger),
        )
        .route("/api/tasks/:task_id", post(routes::enqueue_task))
        .route("/api/invocations/:id", get(routes::get_invocation))
        .route("/api/stats", get(routes::stats));

    Router::new()
        .route("/health", get(routes::health))
        .merge(api)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(log_request)))
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    tracing::debug!(
        %method,
        path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}
