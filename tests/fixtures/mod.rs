//! Generated video fixtures

#![allow(dead_code)]

use image::{Rgb, RgbImage};
use obstacle_watch::services::video::{FrameSink, MjpegWriter};
use std::path::Path;

pub const FRAME_WIDTH: u32 = 64;
pub const FRAME_HEIGHT: u32 = 48;

/// A flat grey frame whose brightness varies with `index`.
pub fn frame(index: usize) -> RgbImage {
    let v = (40 + (index * 10) % 160) as u8;
    RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([v, v, v]))
}

/// Write a Motion-JPEG clip of `frames` frames to `path`.
pub fn write_clip(path: &Path, frames: usize) {
    let mut writer: Box<dyn FrameSink> =
        Box::new(MjpegWriter::create(path).expect("Failed to create clip"));
    for i in 0..frames {
        writer.write_frame(&frame(i)).expect("Failed to write frame");
    }
    writer.finish().expect("Failed to finish clip");
}
