use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::ApiError;
use crate::models::{
    ManualScalingRequest, ManualScalingResponse, MemoryReport, ScalingStatusResponse,
};
use crate::state::SharedState;

/// `GET /scaling/status` — scaler, throttler, pool and engine snapshots.
pub async fn status(State(state): State<SharedState>) -> Json<ScalingStatusResponse> {
    Json(ScalingStatusResponse {
        scaling: state.scaler.status(),
        throttler: state.throttler.status(),
        pool: state.engine.pool_stats().await,
        engine: state.engine.stats_snapshot(),
    })
}

/// `POST /scaling/manual` — operator override: scale_up, scale_down or
/// set_workers(n). Always clamped to the configured worker bounds.
pub async fn manual(
    State(state): State<SharedState>,
    Json(request): Json<ManualScalingRequest>,
) -> Result<Json<ManualScalingResponse>, ApiError> {
    let current = state.workers.worker_count().await;
    let target = match request {
        ManualScalingRequest::ScaleUp => current + 1,
        ManualScalingRequest::ScaleDown => current.saturating_sub(1).max(1),
        ManualScalingRequest::SetWorkers { workers } => workers,
    };

    let workers = state.workers.set_workers(target).await;
    info!(from = current, to = workers, "Manual scaling applied");
    Ok(Json(ManualScalingResponse { workers }))
}

/// `POST /scaling/restart-workers` — tear down and replace every worker.
pub async fn restart(State(state): State<SharedState>) -> Json<Value> {
    let restarted = state.workers.restart_workers().await;
    Json(json!({ "restarted": restarted }))
}

/// `POST /scaling/memory` — external memory sample for one worker/browser;
/// feeds the scaler's restart rule and the throttler's memory rule.
pub async fn memory(
    State(state): State<SharedState>,
    Json(report): Json<MemoryReport>,
) -> Json<Value> {
    state
        .scaler
        .update_memory_usage(report.memory_mb, &report.worker_id);
    state.throttler.update_memory_usage(report.memory_mb);
    state
        .metrics
        .browser_memory_mb
        .with_label_values(&[&report.worker_id])
        .set(report.memory_mb);
    Json(json!({ "accepted": true }))
}
