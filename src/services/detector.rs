use image::{GrayImage, RgbImage};

use crate::models::analysis::AnalyzeConfig;
use crate::models::detection::{BoundingBox, DetectionMode, RawDetection};

/// A detector backend, constructed once and shared by every stream.
///
/// Backends that keep per-stream state (a background model, a tracker) keep
/// it in the [`DetectorSession`] so jobs and the live loop never share
/// mutable state.
pub trait Detector: Send + Sync {
    fn mode(&self) -> DetectionMode;

    /// Start a session for one video stream.
    fn session(&self) -> Box<dyn DetectorSession>;
}

/// Per-stream detection state.
pub trait DetectorSession: Send {
    fn analyze(
        &mut self,
        frame: &RgbImage,
        config: &AnalyzeConfig,
    ) -> Result<Vec<RawDetection>, DetectorError>;
}

const CELL: u32 = 8;
const LEARNING_RATE: f32 = 0.05;
const DIFF_THRESHOLD: f32 = 24.0;

/// Classical motion detector: running-average background over a coarse
/// luminance grid, thresholded and grouped into 4-connected blobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct MotionDetector;

impl Detector for MotionDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Basic
    }

    fn session(&self) -> Box<dyn DetectorSession> {
        Box::new(MotionSession::default())
    }
}

#[derive(Default)]
struct MotionSession {
    background: Vec<f32>,
    grid: (u32, u32),
}

impl DetectorSession for MotionSession {
    fn analyze(
        &mut self,
        frame: &RgbImage,
        config: &AnalyzeConfig,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let (width, height) = frame.dimensions();
        if width < CELL || height < CELL {
            return Err(DetectorError::FrameTooSmall { width, height });
        }

        let means = cell_means(&image::imageops::grayscale(frame));
        let grid = (width / CELL, height / CELL);

        // First frame (or a resolution change) only seeds the model.
        if self.grid != grid || self.background.len() != means.len() {
            self.grid = grid;
            self.background = means;
            return Ok(Vec::new());
        }

        let foreground: Vec<bool> = means
            .iter()
            .zip(&self.background)
            .map(|(m, b)| (m - b).abs() > DIFF_THRESHOLD)
            .collect();

        for (b, m) in self.background.iter_mut().zip(&means) {
            *b += LEARNING_RATE * (m - *b);
        }

        let detections = blobs(&foreground, grid)
            .into_iter()
            .filter_map(|blob| {
                let area = blob.cells * CELL * CELL;
                if area < config.min_contour_area {
                    return None;
                }
                let cols = blob.max_col - blob.min_col + 1;
                let rows = blob.max_row - blob.min_row + 1;
                Some(RawDetection {
                    bbox: BoundingBox::new(
                        blob.min_col * CELL,
                        blob.min_row * CELL,
                        cols * CELL,
                        rows * CELL,
                    ),
                    class_name: "obstacle".to_string(),
                    confidence: blob.cells as f32 / (cols * rows) as f32,
                })
            })
            .collect();

        Ok(detections)
    }
}

/// Mean luminance of each full CELL x CELL block, row-major.
fn cell_means(gray: &GrayImage) -> Vec<f32> {
    let (cols, rows) = (gray.width() / CELL, gray.height() / CELL);
    let mut sums = vec![0u32; (cols * rows) as usize];
    for (x, y, pixel) in gray.enumerate_pixels() {
        let (col, row) = (x / CELL, y / CELL);
        if col < cols && row < rows {
            sums[(row * cols + col) as usize] += u32::from(pixel.0[0]);
        }
    }
    let n = (CELL * CELL) as f32;
    sums.into_iter().map(|s| s as f32 / n).collect()
}

struct Blob {
    cells: u32,
    min_col: u32,
    max_col: u32,
    min_row: u32,
    max_row: u32,
}

fn blobs(mask: &[bool], (cols, rows): (u32, u32)) -> Vec<Blob> {
    let mut seen = vec![false; mask.len()];
    let mut out = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let (col, row) = (start as u32 % cols, start as u32 / cols);
        let mut blob = Blob {
            cells: 0,
            min_col: col,
            max_col: col,
            min_row: row,
            max_row: row,
        };

        while let Some(idx) = stack.pop() {
            let (col, row) = (idx as u32 % cols, idx as u32 / cols);
            blob.cells += 1;
            blob.min_col = blob.min_col.min(col);
            blob.max_col = blob.max_col.max(col);
            blob.min_row = blob.min_row.min(row);
            blob.max_row = blob.max_row.max(row);

            let neighbours = [
                (col > 0).then(|| idx - 1),
                (col + 1 < cols).then(|| idx + 1),
                (row > 0).then(|| idx - cols as usize),
                (row + 1 < rows).then(|| idx + cols as usize),
            ];
            for next in neighbours.into_iter().flatten() {
                if mask[next] && !seen[next] {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        out.push(blob);
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Frame {width}x{height} is too small to analyze")]
    FrameTooSmall { width: u32, height: u32 },

    #[error("Detector backend failed: {0}")]
    Backend(String),
}
