//! HTTP surface for the metagrab extraction service.
//!
//! Routes: synchronous batch (`POST /scrape`), NDJSON streaming
//! (`POST /scrape/stream`), single URL (`GET /scrape/single`), async jobs
//! (`POST /jobs`, `GET /jobs/:id`), scaling administration
//! (`/scaling/...`), health and Prometheus metrics.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/scrape", post(handlers::scrape::batch))
        .route("/scrape/stream", post(handlers::stream::stream))
        .route("/scrape/single", get(handlers::scrape::single))
        .route("/jobs", post(handlers::jobs::create))
        .route("/jobs/:id", get(handlers::jobs::status))
        .route("/scaling/status", get(handlers::scaling::status))
        .route("/scaling/manual", post(handlers::scaling::manual))
        .route("/scaling/restart-workers", post(handlers::scaling::restart))
        .route("/scaling/memory", post(handlers::scaling::memory))
        .route("/healthz", get(handlers::health::healthz))
        .route("/metrics", get(handlers::health::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
