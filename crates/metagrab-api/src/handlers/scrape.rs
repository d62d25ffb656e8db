use axum::extract::{Query, State};
use axum::Json;
use metagrab_types::ScrapeOutcome;
use std::time::Instant;
use tracing::info;

use crate::errors::ApiError;
use crate::handlers::validate_urls;
use crate::models::{BatchResponse, ScrapeRequest, ScrapeSummary, SingleQuery};
use crate::state::SharedState;

/// `POST /scrape` — synchronous batch: all URLs are scraped (bounded
/// concurrency, deduplicated) and gathered into one response with a
/// summary block.
pub async fn batch(
    State(state): State<SharedState>,
    Json(request): Json<ScrapeRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    validate_urls(&request.urls)?;
    let mode = request.mode.unwrap_or(state.config.default_mode());
    let started = Instant::now();
    let total_urls = request.urls.len();

    info!(urls = total_urls, mode = %mode, "Batch scrape request");

    let results = state
        .engine
        .scrape_batch(request.urls, mode, request.max_concurrent)
        .await;
    let summary = ScrapeSummary::from_results(&results);

    Ok(Json(BatchResponse {
        success: true,
        total_urls,
        mode,
        results,
        summary,
        total_time: started.elapsed().as_secs_f64(),
    }))
}

/// `GET /scrape/single?url=...&mode=...` — one URL, one outcome.
pub async fn single(
    State(state): State<SharedState>,
    Query(query): Query<SingleQuery>,
) -> Result<Json<ScrapeOutcome>, ApiError> {
    validate_urls(std::slice::from_ref(&query.url))?;
    let mode = query.mode.unwrap_or(state.config.default_mode());
    let outcome = state.engine.get_metadata(&query.url, mode).await;
    Ok(Json(outcome))
}
