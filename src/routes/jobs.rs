use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use std::str::FromStr;
use tokio::io::AsyncWriteExt;

use crate::app_state::AppState;
use crate::models::analysis::AnalyzeConfig;
use crate::models::api::SubmitJobResponse;
use crate::models::job::{JobPatch, JobRecord, JobStatus};
use crate::services::orchestrator::{InputFile, SubmitError};

const ACCEPTED_EXTENSIONS: [&str; 2] = ["mjpeg", "mjpg"];

/// An upload streamed to disk, not yet attached to a job.
struct Upload {
    file: tempfile::NamedTempFile,
    filename: String,
    extension: String,
}

/// POST /api/jobs: upload a video for background analysis.
///
/// Multipart fields: `file` plus any of the analysis parameters. The video is
/// streamed to disk; the job is only created once the whole request is read.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitJobResponse>, StatusCode> {
    let mut upload: Option<Upload> = None;
    let mut config = AnalyzeConfig::default();

    while let Some(mut field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .and_then(|n| std::path::Path::new(n).file_name())
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or(StatusCode::BAD_REQUEST)?;
                let extension = filename
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_ascii_lowercase())
                    .filter(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()))
                    .ok_or(StatusCode::UNSUPPORTED_MEDIA_TYPE)?;

                let tmp = tempfile::NamedTempFile::new_in(state.archive.jobs_dir())
                    .map_err(internal("create upload file"))?;
                let mut out = tokio::fs::File::from_std(
                    tmp.as_file().try_clone().map_err(internal("open upload file"))?,
                );
                while let Some(chunk) = field.chunk().await.map_err(|_| StatusCode::BAD_REQUEST)? {
                    out.write_all(&chunk).await.map_err(internal("write upload"))?;
                }
                out.flush().await.map_err(internal("flush upload"))?;

                upload = Some(Upload {
                    file: tmp,
                    filename,
                    extension,
                });
            }
            "sampled_every_n_frames" => {
                config.sampled_every_n_frames = parse_field(field.text().await)?
            }
            "confidence_threshold" => config.confidence_threshold = parse_field(field.text().await)?,
            "roi_warning_y_ratio" => config.roi_warning_y_ratio = parse_field(field.text().await)?,
            "roi_danger_y_ratio" => config.roi_danger_y_ratio = parse_field(field.text().await)?,
            "min_contour_area" => config.min_contour_area = parse_field(field.text().await)?,
            "resize_width" => config.resize_width = parse_field(field.text().await)?,
            other => tracing::debug!(field = %other, "Ignoring unknown upload field"),
        }
    }

    let upload = upload.ok_or(StatusCode::BAD_REQUEST)?;
    config.validate().map_err(|e| {
        tracing::debug!(error = %e, "Rejected analysis parameters");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    let record = state.store.create().map_err(internal("create job"))?;
    let job_id = record.job_id.clone();

    let input_path = state
        .archive
        .job_input_path(&job_id, &upload.extension)
        .map_err(internal("resolve job input"))?;
    if let Err(e) = upload.file.persist(&input_path) {
        tracing::error!(job_id = %job_id, error = %e.error, "Failed to store job input");
        let patch = JobPatch::default()
            .status(JobStatus::Error)
            .message("Error")
            .error(Some("Failed to store upload".to_string()));
        if let Err(e) = state.store.update(&job_id, patch) {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    match state.orchestrator.submit(
        &job_id,
        InputFile::new(input_path),
        upload.filename,
        config,
    ) {
        Ok(()) => Ok(Json(SubmitJobResponse {
            job_id,
            status: record.status,
        })),
        Err(SubmitError::QueueFull | SubmitError::Closed) => Err(StatusCode::SERVICE_UNAVAILABLE),
        Err(SubmitError::Store(e)) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to submit job");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/jobs/{job_id}: current job record.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, StatusCode> {
    match state.store.get(&job_id) {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn parse_field<T: FromStr, E>(text: Result<String, E>) -> Result<T, StatusCode> {
    text.map_err(|_| StatusCode::BAD_REQUEST)?
        .trim()
        .parse()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)
}

fn internal<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> StatusCode {
    move |e| {
        tracing::error!(error = %e, "Failed to {what}");
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
