use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::analysis::AnalyzeConfig;
use crate::models::detection::{DetectionMode, Event};

/// Summary written next to a finished job's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMeta {
    pub result_id: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub processing_time_s: f64,
    pub fps: Option<f64>,
    pub frame_count: Option<u64>,
    pub detection_mode: DetectionMode,
    pub config: AnalyzeConfig,
}

/// Contents of `events.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLog {
    pub result_id: String,
    pub events: Vec<Event>,
}
