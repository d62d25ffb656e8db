use axum::extract::{Path, State};
use axum::Json;
use metagrab_workers::Job;
use tracing::info;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::handlers::validate_urls;
use crate::models::{JobsRequest, JobsResponse};
use crate::state::SharedState;

/// `POST /jobs` — chunk the URLs and enqueue one job per chunk; returns the
/// ids for status polling.
pub async fn create(
    State(state): State<SharedState>,
    Json(request): Json<JobsRequest>,
) -> Result<Json<JobsResponse>, ApiError> {
    validate_urls(&request.urls)?;
    let mode = request.mode.unwrap_or(state.config.default_mode());
    let total_urls = request.urls.len();

    let job_ids = state
        .workers
        .submit(request.urls, mode, request.chunk_size)
        .await;

    info!(jobs = job_ids.len(), urls = total_urls, mode = %mode, "Jobs enqueued");

    Ok(Json(JobsResponse {
        chunks: job_ids.len(),
        job_ids,
        total_urls,
    }))
}

/// `GET /jobs/:id` — registry lookup.
pub async fn status(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state
        .workers
        .job(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound {
            resource: format!("job {id}"),
        })
}
