use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::io::AsyncReadExt;

use crate::app_state::AppState;
use crate::models::result::{EventLog, ResultMeta};
use crate::services::archive::ArchiveError;

const CHUNK_SIZE: usize = 64 * 1024;

/// GET /api/results/{result_id}/meta
pub async fn get_meta(
    State(state): State<AppState>,
    Path(result_id): Path<String>,
) -> Result<Json<ResultMeta>, StatusCode> {
    let paths = state.archive.result_paths(&result_id).map_err(archive_status)?;
    let meta = state.archive.read_json(&paths.meta_path).map_err(archive_status)?;
    Ok(Json(meta))
}

/// GET /api/results/{result_id}/events
pub async fn get_events(
    State(state): State<AppState>,
    Path(result_id): Path<String>,
) -> Result<Json<EventLog>, StatusCode> {
    let paths = state.archive.result_paths(&result_id).map_err(archive_status)?;
    let events = state.archive.read_json(&paths.events_path).map_err(archive_status)?;
    Ok(Json(events))
}

/// GET /api/results/{result_id}/video: the annotated Motion-JPEG file.
pub async fn get_video(
    State(state): State<AppState>,
    Path(result_id): Path<String>,
) -> Result<Response, StatusCode> {
    let paths = state.archive.result_paths(&result_id).map_err(archive_status)?;
    // A video without meta.json belongs to a job that has not finished.
    if !paths.meta_path.exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    stream_file(&paths.video_path, "video/x-motion-jpeg").await
}

/// GET /api/results/{result_id}/snapshots/{name}
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path((result_id, name)): Path<(String, String)>,
) -> Result<Response, StatusCode> {
    let path = state
        .archive
        .snapshot_path(&result_id, &name)
        .map_err(archive_status)?;
    stream_file(&path, "image/jpeg").await
}

async fn stream_file(path: &std::path::Path, content_type: &'static str) -> Result<Response, StatusCode> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to open result file");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let length = file.metadata().await.ok().map(|m| m.len());

    let chunks = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), file)))
    });

    let mut response = (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(chunks),
    )
        .into_response();
    if let Some(length) = length {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from(length));
    }
    Ok(response)
}

fn archive_status(err: ArchiveError) -> StatusCode {
    match err {
        ArchiveError::NotFound(_) | ArchiveError::InvalidName(_) => StatusCode::NOT_FOUND,
        other => {
            tracing::error!(error = %other, "Result archive read failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
