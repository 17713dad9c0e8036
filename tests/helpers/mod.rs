//! Fakes and polling helpers shared by the integration tests

#![allow(dead_code)]

use image::RgbImage;
use obstacle_watch::models::analysis::AnalyzeConfig;
use obstacle_watch::models::detection::{BoundingBox, DetectionMode, RawDetection};
use obstacle_watch::services::detector::{Detector, DetectorError, DetectorSession};
use obstacle_watch::services::video::{
    CaptureOpener, FrameSink, FrameSource, MjpegCodec, VideoCodec, VideoError,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::fixtures;

/// Reports one box touching the bottom edge of every analyzed frame.
///
/// Optionally blocks every call until the gate is opened.
#[derive(Clone, Default)]
pub struct ScriptedDetector {
    gate: Option<Gate>,
}

impl ScriptedDetector {
    pub fn gated(gate: Gate) -> Self {
        Self { gate: Some(gate) }
    }
}

impl Detector for ScriptedDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Neural
    }

    fn session(&self) -> Box<dyn DetectorSession> {
        Box::new(ScriptedSession {
            gate: self.gate.clone(),
        })
    }
}

struct ScriptedSession {
    gate: Option<Gate>,
}

impl DetectorSession for ScriptedSession {
    fn analyze(
        &mut self,
        frame: &RgbImage,
        _config: &AnalyzeConfig,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        let h = frame.height();
        Ok(vec![RawDetection {
            bbox: BoundingBox::new(4, h.saturating_sub(10), 20, 10),
            class_name: "person".to_string(),
            confidence: 0.9,
        }])
    }
}

/// Closed until `open` is called; then every waiter proceeds.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

/// Codec whose inputs can never be opened.
pub struct BrokenCodec;

impl VideoCodec for BrokenCodec {
    fn open_input(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
        Err(VideoError::Open {
            source_id: path.display().to_string(),
            reason: "codec unavailable".to_string(),
        })
    }

    fn create_output(&self, _path: &Path) -> Result<Box<dyn FrameSink>, VideoError> {
        Err(VideoError::NoFrames)
    }
}

/// Motion-JPEG codec that runs a callback when an output is finished.
pub struct HookCodec {
    on_finish: Arc<dyn Fn() + Send + Sync>,
}

impl HookCodec {
    pub fn new(on_finish: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_finish: Arc::new(on_finish),
        }
    }
}

impl VideoCodec for HookCodec {
    fn open_input(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
        MjpegCodec.open_input(path)
    }

    fn create_output(&self, path: &Path) -> Result<Box<dyn FrameSink>, VideoError> {
        Ok(Box::new(HookSink {
            inner: MjpegCodec.create_output(path)?,
            on_finish: Arc::clone(&self.on_finish),
        }))
    }
}

struct HookSink {
    inner: Box<dyn FrameSink>,
    on_finish: Arc<dyn Fn() + Send + Sync>,
}

impl FrameSink for HookSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        self.inner.write_frame(frame)
    }

    fn finish(self: Box<Self>) -> Result<(), VideoError> {
        (self.on_finish)();
        self.inner.finish()
    }
}

/// Live opener that tracks how many sources are open at once.
#[derive(Default)]
pub struct CountingOpener {
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub opened: Mutex<Vec<String>>,
}

impl CountingOpener {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl CaptureOpener for CountingOpener {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>, VideoError> {
        if source == "missing" {
            return Err(VideoError::Open {
                source_id: source.to_string(),
                reason: "no such device".to_string(),
            });
        }
        self.opened.lock().unwrap().push(source.to_string());
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(CountingSource {
            live: Arc::clone(&self.live),
            index: 0,
        }))
    }
}

struct CountingSource {
    live: Arc<AtomicUsize>,
    index: usize,
}

impl FrameSource for CountingSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        std::thread::sleep(Duration::from_millis(5));
        self.index += 1;
        Ok(Some(fixtures::frame(self.index)))
    }
}

impl Drop for CountingSource {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Analysis config that keeps the fixture frames at their native size.
pub fn test_config() -> AnalyzeConfig {
    AnalyzeConfig {
        resize_width: fixtures::FRAME_WIDTH,
        ..AnalyzeConfig::default()
    }
}
