use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub storage: ComponentHealth,
    pub capture: CaptureHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct CaptureHealth {
    pub phase: String,
    pub viewers: usize,
}

/// GET /health: storage reachability plus live capture status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    // The jobs directory must exist and be a directory
    let storage = match tokio::fs::metadata(state.store.jobs_dir()).await {
        Ok(meta) if meta.is_dir() => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        _ => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    };

    let healthy = storage.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            storage,
            capture: CaptureHealth {
                phase: state.realtime.phase().to_string(),
                viewers: state.realtime.viewer_count(),
            },
        },
    };

    (status_code, Json(response))
}
