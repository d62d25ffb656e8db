use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::Response;
use axum::Json;
use futures::StreamExt;
use std::convert::Infallible;
use tracing::info;

use crate::errors::ApiError;
use crate::handlers::validate_urls;
use crate::models::{ScrapeRequest, StreamItem};
use crate::state::SharedState;

/// `POST /scrape/stream` — NDJSON stream of `{url, data}` objects, yielded
/// in completion order as each URL finishes.
pub async fn stream(
    State(state): State<SharedState>,
    Json(request): Json<ScrapeRequest>,
) -> Result<Response, ApiError> {
    validate_urls(&request.urls)?;
    let mode = request.mode.unwrap_or(state.config.default_mode());

    info!(urls = request.urls.len(), mode = %mode, "Streaming scrape request");

    let lines = state
        .engine
        .scrape_many(request.urls, mode, request.max_concurrent)
        .map(|outcome| {
            let item = StreamItem {
                url: outcome.url.clone(),
                data: outcome,
            };
            let mut line = serde_json::to_vec(&item).unwrap_or_default();
            line.push(b'\n');
            Ok::<Bytes, Infallible>(Bytes::from(line))
        });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .map_err(|e| ApiError::Internal {
            message: format!("failed to build stream response: {e}"),
        })
}
