use serde::{Deserialize, Serialize};

use crate::models::analysis::AnalyzeConfig;
use crate::models::job::JobStatus;

/// Response after submitting a video.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// Query string of the realtime endpoints.
///
/// Spelled out field by field: urlencoded query values are strings, which
/// `#[serde(flatten)]` cannot coerce into numbers.
#[derive(Debug, Deserialize)]
pub struct RealtimeParams {
    #[serde(default = "default_source")]
    pub src: String,
    pub sampled_every_n_frames: Option<u32>,
    pub confidence_threshold: Option<f32>,
    pub roi_warning_y_ratio: Option<f32>,
    pub roi_danger_y_ratio: Option<f32>,
    pub min_contour_area: Option<u32>,
    pub resize_width: Option<u32>,
}

fn default_source() -> String {
    "0".to_string()
}

impl RealtimeParams {
    pub fn config(&self) -> AnalyzeConfig {
        let defaults = AnalyzeConfig::default();
        AnalyzeConfig {
            sampled_every_n_frames: self
                .sampled_every_n_frames
                .unwrap_or(defaults.sampled_every_n_frames),
            confidence_threshold: self
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            roi_warning_y_ratio: self
                .roi_warning_y_ratio
                .unwrap_or(defaults.roi_warning_y_ratio),
            roi_danger_y_ratio: self.roi_danger_y_ratio.unwrap_or(defaults.roi_danger_y_ratio),
            min_contour_area: self.min_contour_area.unwrap_or(defaults.min_contour_area),
            resize_width: self.resize_width.unwrap_or(defaults.resize_width),
        }
    }
}
