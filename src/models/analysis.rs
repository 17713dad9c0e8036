use garde::Validate;
use serde::{Deserialize, Serialize};

/// Per-job (or per-live-source) detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AnalyzeConfig {
    /// Run the detector on every Nth frame and reuse its result in between.
    #[garde(range(min = 1, max = 1000))]
    pub sampled_every_n_frames: u32,

    /// Raw detections below this confidence are discarded.
    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f32,

    /// Box bottom at or below this fraction of frame height is a warning.
    #[garde(range(min = 0.0, max = 1.0))]
    pub roi_warning_y_ratio: f32,

    /// Box bottom at or below this fraction of frame height is a danger.
    #[garde(range(min = 0.0, max = 1.0))]
    pub roi_danger_y_ratio: f32,

    /// Smallest foreground blob (in resized-frame pixels) the motion detector reports.
    #[garde(range(min = 1, max = 10_000_000))]
    pub min_contour_area: u32,

    /// Frames are resized to this width, keeping aspect ratio, before detection.
    #[garde(range(min = 16, max = 4096))]
    pub resize_width: u32,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            sampled_every_n_frames: 1,
            confidence_threshold: 0.5,
            roi_warning_y_ratio: 0.65,
            roi_danger_y_ratio: 0.80,
            min_contour_area: 800,
            resize_width: 640,
        }
    }
}

impl AnalyzeConfig {
    /// Whether the detector should run on `frame_index` (zero-based).
    pub fn is_sampled(&self, frame_index: u64) -> bool {
        let every = u64::from(self.sampled_every_n_frames.max(1));
        frame_index % every == 0
    }
}
