use axum::body::Bytes;
use serde::Serialize;

use crate::models::detection::{Detection, DetectionMode};

/// Latest published output of the live capture loop.
///
/// Published as a whole behind an `Arc`; never mutated after publication.
#[derive(Debug, Clone)]
pub struct RealtimeState {
    pub jpeg: Option<Bytes>,
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
    pub mode: DetectionMode,
    pub fps: Option<f64>,
}

impl Default for RealtimeState {
    fn default() -> Self {
        Self {
            jpeg: None,
            frame_id: 0,
            width: 0,
            height: 0,
            detections: Vec::new(),
            mode: DetectionMode::Basic,
            fps: None,
        }
    }
}

/// JSON frame pushed to WebSocket viewers.
#[derive(Debug, Serialize)]
pub struct RealtimeMessage<'a> {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub detections: &'a [Detection],
    pub mode: DetectionMode,
    pub fps: Option<f64>,
}

impl<'a> From<&'a RealtimeState> for RealtimeMessage<'a> {
    fn from(state: &'a RealtimeState) -> Self {
        Self {
            frame_id: state.frame_id,
            width: state.width,
            height: state.height,
            detections: &state.detections,
            mode: state.mode,
            fps: state.fps,
        }
    }
}
