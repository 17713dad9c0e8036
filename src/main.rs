use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use obstacle_watch::app_state::AppState;
use obstacle_watch::config::AppConfig;
use obstacle_watch::routes;
use obstacle_watch::services::{
    archive::ResultArchive,
    detector::{Detector, MotionDetector},
    job_store::JobStore,
    orchestrator::{JobOrchestrator, JobPipeline},
    realtime::RealtimeCaptureService,
    video::{CaptureOpener, FileCaptureOpener, MjpegCodec, VideoCodec},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing obstacle-watch server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "detection_job_processing_seconds",
        "Time to analyze one uploaded video"
    );
    metrics::describe_counter!(
        "detection_jobs_submitted",
        "Total detection jobs accepted into the queue"
    );
    metrics::describe_counter!(
        "detection_jobs_rejected",
        "Total detection jobs rejected because the queue was full"
    );
    metrics::describe_counter!(
        "detection_jobs_completed",
        "Total detection jobs completed"
    );
    metrics::describe_counter!(
        "detection_jobs_failed",
        "Total detection jobs that failed"
    );
    metrics::describe_gauge!("realtime_viewers", "Current number of live viewers");
    metrics::describe_counter!(
        "realtime_frames_published",
        "Total annotated live frames published"
    );
    metrics::describe_counter!(
        "realtime_loop_starts",
        "Total live capture loop starts"
    );

    // Open on-disk storage
    tracing::info!(root = %config.storage_root, "Opening result archive");
    let archive = Arc::new(
        ResultArchive::open(&config.storage_root).expect("Failed to open storage root"),
    );
    let store = Arc::new(JobStore::open(archive.jobs_dir()).expect("Failed to open job store"));

    // One detector instance shared by jobs and the live loop
    let detector: Arc<dyn Detector> = Arc::new(MotionDetector);
    let codec: Arc<dyn VideoCodec> = Arc::new(MjpegCodec);
    let opener: Arc<dyn CaptureOpener> = Arc::new(FileCaptureOpener::new(
        &config.storage_root,
        config.capture_fps,
    ));

    tracing::info!(
        workers = config.job_workers,
        queue_capacity = config.job_queue_capacity,
        "Starting job workers"
    );
    let pipeline = Arc::new(JobPipeline::new(
        store,
        Arc::clone(&archive),
        Arc::clone(&detector),
        codec,
    ));
    let orchestrator =
        JobOrchestrator::start(pipeline, config.job_workers, config.job_queue_capacity);
    let realtime = RealtimeCaptureService::new(detector, opener, config.capture_settings());

    // Create shared application state
    let state = AppState::new(archive, orchestrator, realtime);

    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes));

    tracing::info!("Starting obstacle-watch on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
