//! Video boundary: frame sources, frame sinks and live capture openers.
//!
//! The built-in container is Motion-JPEG, a plain concatenation of JPEG
//! images. Anything else (H.264, camera devices, RTSP) plugs in behind the
//! same traits.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const JPEG_QUALITY: u8 = 80;
pub const DEFAULT_FPS: f64 = 25.0;

/// Sequential decoded frames.
pub trait FrameSource: Send {
    /// Next frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError>;

    fn fps(&self) -> Option<f64> {
        None
    }

    fn frame_count(&self) -> Option<u64> {
        None
    }
}

/// Encoded output of a job.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError>;

    fn finish(self: Box<Self>) -> Result<(), VideoError>;
}

/// Opens a live source by its identifier (a path, a device number, a URL).
pub trait CaptureOpener: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>, VideoError>;
}

/// Opens job inputs and creates job outputs for one container format.
pub trait VideoCodec: Send + Sync {
    fn open_input(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError>;

    fn create_output(&self, path: &Path) -> Result<Box<dyn FrameSink>, VideoError>;
}

/// Motion-JPEG in, Motion-JPEG out.
#[derive(Debug, Default, Clone, Copy)]
pub struct MjpegCodec;

impl VideoCodec for MjpegCodec {
    fn open_input(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
        Ok(Box::new(MjpegReader::open(path)?))
    }

    fn create_output(&self, path: &Path) -> Result<Box<dyn FrameSink>, VideoError> {
        Ok(Box::new(MjpegWriter::create(path)?))
    }
}

/// JPEG-encode a frame.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>, VideoError> {
    let mut out = Vec::with_capacity(frame.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(frame)?;
    Ok(out)
}

/// Resize to `width` keeping the aspect ratio. Frames already that wide are
/// returned untouched.
pub fn resize_to_width(frame: RgbImage, width: u32) -> RgbImage {
    let (w, h) = frame.dimensions();
    if w == 0 || w == width {
        return frame;
    }
    let height = ((u64::from(h) * u64::from(width)) / u64::from(w)).max(1) as u32;
    image::imageops::resize(&frame, width, height, image::imageops::FilterType::Triangle)
}

/// Reads a Motion-JPEG file. Frame boundaries are indexed on open, so the
/// frame count is known before decoding starts.
pub struct MjpegReader {
    data: Vec<u8>,
    frames: Vec<(usize, usize)>,
    next: usize,
}

impl MjpegReader {
    pub fn open(path: &Path) -> Result<Self, VideoError> {
        let data = std::fs::read(path).map_err(|e| VideoError::Open {
            source_id: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, VideoError> {
        let frames = index_jpeg_frames(&data);
        if frames.is_empty() {
            return Err(VideoError::NoFrames);
        }
        Ok(Self {
            data,
            frames,
            next: 0,
        })
    }

    pub fn rewind(&mut self) {
        self.next = 0;
    }
}

impl FrameSource for MjpegReader {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        let Some(&(start, end)) = self.frames.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let decoded = image::load_from_memory_with_format(
            &self.data[start..end],
            image::ImageFormat::Jpeg,
        )
        .map_err(|e| VideoError::Decode {
            frame_index: self.next as u64 - 1,
            reason: e.to_string(),
        })?;
        Ok(Some(decoded.into_rgb8()))
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.frames.len() as u64)
    }
}

/// Byte ranges of top-level JPEG images (SOI .. EOI) in a byte stream.
fn index_jpeg_frames(data: &[u8]) -> Vec<(usize, usize)> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] != 0xFF || data[i + 1] != 0xD8 {
            i += 1;
            continue;
        }
        match jpeg_end(data, i) {
            Some(end) => {
                frames.push((i, end));
                i = end;
            }
            // Corrupt or truncated image: resync on the next SOI.
            None => i += 2,
        }
    }
    frames
}

/// End offset (exclusive) of the JPEG image whose SOI is at `start`.
///
/// Marker segments are skipped by their length fields, so EOI bytes inside
/// metadata (an EXIF thumbnail, for one) do not end the image.
fn jpeg_end(data: &[u8], start: usize) -> Option<usize> {
    let mut j = start + 2;
    loop {
        if *data.get(j)? != 0xFF {
            return None;
        }
        while *data.get(j + 1)? == 0xFF {
            j += 1;
        }
        match data[j + 1] {
            0xD9 => return Some(j + 2),
            0x01 | 0xD0..=0xD7 => j += 2,
            marker => {
                let length = usize::from(u16::from_be_bytes([*data.get(j + 2)?, *data.get(j + 3)?]));
                if length < 2 {
                    return None;
                }
                j += 2 + length;
                if marker == 0xDA {
                    j = next_marker_after_scan(data, j)?;
                }
            }
        }
    }
}

/// Offset of the first marker after entropy-coded scan data. Stuffed zero
/// bytes and restart markers belong to the scan.
fn next_marker_after_scan(data: &[u8], mut j: usize) -> Option<usize> {
    while j + 1 < data.len() {
        if data[j] == 0xFF {
            let next = data[j + 1];
            if next != 0x00 && next != 0xFF && !(0xD0..=0xD7).contains(&next) {
                return Some(j);
            }
        }
        j += 1;
    }
    None
}

/// Writes frames as a Motion-JPEG file.
pub struct MjpegWriter {
    out: BufWriter<File>,
}

impl MjpegWriter {
    pub fn create(path: &Path) -> Result<Self, VideoError> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl FrameSink for MjpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        let jpeg = encode_jpeg(frame)?;
        self.out.write_all(&jpeg)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), VideoError> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

/// Replays Motion-JPEG files as live sources, looping at a fixed rate.
///
/// The source identifier is a path relative to `root`; identifiers that
/// would leave `root` are refused.
pub struct FileCaptureOpener {
    root: PathBuf,
    fps: f64,
}

impl FileCaptureOpener {
    pub fn new(root: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            root: root.into(),
            fps: if fps > 0.0 { fps } else { DEFAULT_FPS },
        }
    }
}

impl CaptureOpener for FileCaptureOpener {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>, VideoError> {
        let relative = Path::new(source);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));
        if escapes {
            return Err(VideoError::Open {
                source_id: source.to_string(),
                reason: "source must be a path inside the storage root".to_string(),
            });
        }
        let path = self.root.join(relative);
        let reader = MjpegReader::open(&path)?;
        Ok(Box::new(LoopingSource {
            reader,
            interval: Duration::from_secs_f64(1.0 / self.fps),
            last: None,
            fps: self.fps,
        }))
    }
}

struct LoopingSource {
    reader: MjpegReader,
    interval: Duration,
    last: Option<Instant>,
    fps: f64,
}

impl FrameSource for LoopingSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        if let Some(last) = self.last {
            let due = last + self.interval;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.last = Some(Instant::now());

        match self.reader.read_frame()? {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.reader.rewind();
                self.reader.read_frame()
            }
        }
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("Cannot open video source {source_id}: {reason}")]
    Open { source_id: String, reason: String },

    #[error("Video contains no frames")]
    NoFrames,

    #[error("Cannot decode frame {frame_index}: {reason}")]
    Decode { frame_index: u64, reason: String },

    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
