use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use garde::Validate;
use std::convert::Infallible;
use std::sync::Arc;

use crate::app_state::AppState;
use crate::models::api::RealtimeParams;
use crate::models::realtime::RealtimeMessage;
use crate::services::realtime::Viewer;

const BOUNDARY: &str = "frame";

/// Apply the requested source and config, then register a viewer.
///
/// Runs on a blocking thread: a source change may wait (bounded) for the
/// previous capture loop to exit.
async fn attach(state: &AppState, params: RealtimeParams) -> Result<Viewer, StatusCode> {
    let config = params.config();
    config.validate().map_err(|e| {
        tracing::debug!(error = %e, "Rejected live analysis parameters");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    let service = Arc::clone(&state.realtime);
    tokio::task::spawn_blocking(move || {
        service.configure(&params.src, config);
        service.viewer()
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to attach live viewer");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// GET /api/realtime/stream: annotated live frames as
/// `multipart/x-mixed-replace`.
///
/// The viewer lives inside the body stream, so a client disconnect drops it
/// and releases the capture loop.
pub async fn mjpeg_stream(
    State(state): State<AppState>,
    Query(params): Query<RealtimeParams>,
) -> Result<Response, StatusCode> {
    let viewer = attach(&state, params).await?;

    let parts = futures::stream::unfold(viewer, |mut viewer| async move {
        loop {
            let frame = viewer.next_frame().await?;
            let Some(jpeg) = frame.jpeg.as_ref() else {
                continue;
            };
            let head = format!(
                "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg.len()
            );
            let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
            part.extend_from_slice(head.as_bytes());
            part.extend_from_slice(jpeg);
            part.extend_from_slice(b"\r\n");
            return Some((Ok::<_, Infallible>(Bytes::from(part)), viewer));
        }
    });

    Ok((
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response())
}

/// GET /ws/realtime: per-frame detection JSON over a WebSocket.
pub async fn websocket(
    State(state): State<AppState>,
    Query(params): Query<RealtimeParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let viewer = attach(&state, params).await?;
    Ok(ws.on_upgrade(move |socket| push_detections(socket, viewer)))
}

async fn push_detections(mut socket: WebSocket, mut viewer: Viewer) {
    tracing::debug!("WebSocket viewer connected");
    loop {
        tokio::select! {
            frame = viewer.next_frame() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&RealtimeMessage::from(frame.as_ref())) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize live frame");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("WebSocket viewer disconnected");
}
