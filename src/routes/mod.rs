pub mod health;
pub mod jobs;
pub mod metrics;
pub mod realtime;
pub mod results;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Every application route except `/metrics`, which carries its own state.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", post(jobs::submit_job))
        .route("/api/jobs/{job_id}", get(jobs::get_job))
        .route("/api/results/{result_id}/meta", get(results::get_meta))
        .route("/api/results/{result_id}/events", get(results::get_events))
        .route("/api/results/{result_id}/video", get(results::get_video))
        .route(
            "/api/results/{result_id}/snapshots/{name}",
            get(results::get_snapshot),
        )
        .route("/api/realtime/stream", get(realtime::mjpeg_stream))
        .route("/ws/realtime", get(realtime::websocket))
        .with_state(state)
}
