use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Axis-aligned box in frame pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Row of the box's bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }
}

/// What a detector backend reports for one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
}

/// Severity of a detection by proximity to the bottom of the frame.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Info,
    Warning,
    Danger,
}

impl RiskLevel {
    /// Only warning and danger detections are logged as events.
    pub fn is_event(self) -> bool {
        self != RiskLevel::Info
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskReason {
    NearBottom,
    EnterRoi,
}

/// A risk-classified detection, as shown to viewers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
    pub risk_level: RiskLevel,
    pub reason: Option<RiskReason>,
}

/// A warning or danger detection recorded in a result's event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub timestamp_ms: u64,
    pub frame_index: u64,
    #[serde(flatten)]
    pub detection: Detection,
    pub snapshot: Option<String>,
}

/// Which detector backend produced a detection set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetectionMode {
    /// Classical background model.
    Basic,
    /// Learned model supplied by the embedder.
    Neural,
}
