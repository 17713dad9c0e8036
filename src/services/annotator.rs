use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::models::analysis::AnalyzeConfig;
use crate::models::detection::{BoundingBox, Detection, Event, RawDetection, RiskLevel, RiskReason};
use crate::services::video::{self, VideoError};

const INFO_COLOUR: Rgb<u8> = Rgb([0, 200, 0]);
const WARNING_COLOUR: Rgb<u8> = Rgb([255, 176, 0]);
const DANGER_COLOUR: Rgb<u8> = Rgb([230, 20, 20]);
const BOX_THICKNESS: u32 = 2;

/// Classify a box by how close its bottom edge is to the bottom of the frame.
///
/// Danger is checked first, so a box past both lines is always danger.
pub fn classify_risk(
    bbox: &BoundingBox,
    frame_height: u32,
    warning_ratio: f32,
    danger_ratio: f32,
) -> (RiskLevel, Option<RiskReason>) {
    if frame_height == 0 {
        return (RiskLevel::Info, None);
    }
    let bottom_ratio = bbox.bottom() as f32 / frame_height as f32;
    if bottom_ratio >= danger_ratio {
        (RiskLevel::Danger, Some(RiskReason::NearBottom))
    } else if bottom_ratio >= warning_ratio {
        (RiskLevel::Warning, Some(RiskReason::EnterRoi))
    } else {
        (RiskLevel::Info, None)
    }
}

/// Drop low-confidence detections and attach risk levels.
pub fn classify(raw: &[RawDetection], frame_height: u32, config: &AnalyzeConfig) -> Vec<Detection> {
    raw.iter()
        .filter(|det| det.confidence >= config.confidence_threshold)
        .map(|det| {
            let (risk_level, reason) = classify_risk(
                &det.bbox,
                frame_height,
                config.roi_warning_y_ratio,
                config.roi_danger_y_ratio,
            );
            Detection {
                bbox: det.bbox,
                class_name: det.class_name.clone(),
                confidence: det.confidence,
                risk_level,
                reason,
            }
        })
        .collect()
}

/// Output of annotating one frame.
#[derive(Debug, Default)]
pub struct AnnotatedFrame {
    /// Every kept detection, info included, for display.
    pub detections: Vec<Detection>,
    /// Warning and danger detections only.
    pub events: Vec<Event>,
}

/// Turns raw detections into classified detections, drawn overlays and
/// events, writing at most one snapshot image per frame index.
pub struct FrameAnnotator {
    snapshots_dir: Option<PathBuf>,
    written: HashMap<u64, String>,
}

impl FrameAnnotator {
    /// Annotator that never writes snapshots (live view).
    pub fn new() -> Self {
        Self {
            snapshots_dir: None,
            written: HashMap::new(),
        }
    }

    pub fn with_snapshots(dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_dir: Some(dir.into()),
            written: HashMap::new(),
        }
    }

    /// Classify `raw`, draw the overlay onto `frame` and emit events.
    pub fn annotate(
        &mut self,
        frame_index: u64,
        timestamp_ms: u64,
        raw: &[RawDetection],
        frame: &mut RgbImage,
        config: &AnalyzeConfig,
    ) -> Result<AnnotatedFrame, VideoError> {
        let detections = classify(raw, frame.height(), config);
        draw_overlay(frame, &detections, config);

        let mut events = Vec::new();
        for detection in detections.iter().filter(|d| d.risk_level.is_event()) {
            let snapshot = self.snapshot_for(frame_index, frame)?;
            events.push(Event {
                timestamp_ms,
                frame_index,
                detection: detection.clone(),
                snapshot,
            });
        }

        Ok(AnnotatedFrame { detections, events })
    }

    /// Name of the frame's snapshot, writing the image only the first time.
    fn snapshot_for(
        &mut self,
        frame_index: u64,
        frame: &RgbImage,
    ) -> Result<Option<String>, VideoError> {
        let Some(dir) = &self.snapshots_dir else {
            return Ok(None);
        };
        if let Some(name) = self.written.get(&frame_index) {
            return Ok(Some(name.clone()));
        }

        let name = snapshot_name(frame_index);
        std::fs::write(dir.join(&name), video::encode_jpeg(frame)?)?;
        tracing::debug!(frame_index, snapshot = %name, "Wrote event snapshot");
        self.written.insert(frame_index, name.clone());
        Ok(Some(name))
    }
}

impl Default for FrameAnnotator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn snapshot_name(frame_index: u64) -> String {
    format!("{frame_index:06}.jpg")
}

/// Draw risk-zone lines and one box per detection.
pub fn draw_overlay(frame: &mut RgbImage, detections: &[Detection], config: &AnalyzeConfig) {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    for (ratio, colour) in [
        (config.roi_warning_y_ratio, WARNING_COLOUR),
        (config.roi_danger_y_ratio, DANGER_COLOUR),
    ] {
        let y = ((ratio * height as f32) as u32).min(height - 1);
        for x in (0..width).step_by(2) {
            frame.put_pixel(x, y, colour);
        }
    }

    for detection in detections {
        let colour = match detection.risk_level {
            RiskLevel::Info => INFO_COLOUR,
            RiskLevel::Warning => WARNING_COLOUR,
            RiskLevel::Danger => DANGER_COLOUR,
        };
        draw_box(frame, &detection.bbox, colour);
    }
}

fn draw_box(frame: &mut RgbImage, bbox: &BoundingBox, colour: Rgb<u8>) {
    let (width, height) = frame.dimensions();
    if bbox.x >= width || bbox.y >= height || bbox.w == 0 || bbox.h == 0 {
        return;
    }
    let x1 = bbox.x.saturating_add(bbox.w).min(width) - 1;
    let y1 = bbox.y.saturating_add(bbox.h).min(height) - 1;

    for t in 0..BOX_THICKNESS {
        let (top, bottom) = (bbox.y.saturating_add(t).min(y1), y1.saturating_sub(t).max(bbox.y));
        let (left, right) = (bbox.x.saturating_add(t).min(x1), x1.saturating_sub(t).max(bbox.x));
        for x in bbox.x..=x1 {
            frame.put_pixel(x, top, colour);
            frame.put_pixel(x, bottom, colour);
        }
        for y in bbox.y..=y1 {
            frame.put_pixel(left, y, colour);
            frame.put_pixel(right, y, colour);
        }
    }
}
