use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::HealthResponse;
use crate::state::SharedState;

/// `GET /healthz` — component health; Redis is reported but never fails
/// the check (the engine degrades without it).
pub async fn healthz(State(state): State<SharedState>) -> Json<HealthResponse> {
    let pool = state.engine.pool_stats().await;
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        workers: state.workers.worker_count().await,
        redis_healthy: state.engine.cache().l2_healthy().await,
        active_contexts: pool.active_contexts,
        active_pages: pool.active_pages,
    })
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<SharedState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
