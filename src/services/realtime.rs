//! Shared live capture loop.
//!
//! One capture thread reads the configured source, runs detection and
//! publishes each annotated frame as an immutable [`RealtimeState`] through a
//! `watch` channel. Any number of viewers read the latest state and are woken
//! when a new one lands; a slow viewer simply skips frames.
//!
//! Lifecycle transitions (start, stop, restart) are decided under one control
//! lock, which is never held while waiting on a thread. A replaced loop is
//! asked to stop and joined with a bounded timeout after the lock is released.
//! Opening the source requires the source lease, held by a loop until it has
//! closed its source, so a successor that outruns a slow predecessor waits for
//! it and a successor cancelled while waiting never opens anything.

use axum::body::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::models::analysis::AnalyzeConfig;
use crate::models::realtime::RealtimeState;
use crate::services::annotator;
use crate::services::detector::Detector;
use crate::services::video::{self, CaptureOpener, FrameSource};

const READ_RETRY: Duration = Duration::from_millis(20);
const LEASE_POLL: Duration = Duration::from_millis(10);

/// Where the capture loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CapturePhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// How long a restart waits for the previous loop to exit.
    pub join_timeout: Duration,
    /// Pause between attempts to (re)open an unavailable source.
    pub retry_delay: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// State visible to capture threads.
struct Shared {
    detector: Arc<dyn Detector>,
    opener: Arc<dyn CaptureOpener>,
    state: watch::Sender<Arc<RealtimeState>>,
    config: watch::Sender<AnalyzeConfig>,
    phase: Mutex<PhaseCell>,
    // Held by the one loop allowed to have the source open.
    source_lease: Mutex<()>,
    retry_delay: Duration,
}

/// Phase tagged with the loop generation that owns it, so an exiting loop
/// cannot overwrite the phase of its replacement.
struct PhaseCell {
    generation: u64,
    phase: CapturePhase,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, PhaseCell> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn advance(&self, generation: u64, from: CapturePhase, to: CapturePhase) {
        let mut cell = self.phase();
        if cell.generation == generation && cell.phase == from {
            cell.phase = to;
        }
    }

    /// Wait for the source lease, giving up once `stop` is set.
    fn lease(&self, stop: &AtomicBool) -> Option<MutexGuard<'_, ()>> {
        loop {
            match self.source_lease.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if stop.load(Ordering::Acquire) {
                        return None;
                    }
                    std::thread::sleep(LEASE_POLL);
                }
            }
        }
    }

    fn finish(&self, generation: u64) {
        let mut cell = self.phase();
        if cell.generation == generation {
            cell.phase = CapturePhase::Idle;
        }
    }
}

struct Control {
    source: String,
    ref_count: usize,
    generation: u64,
    current: Option<CaptureLoop>,
}

/// Handle on one capture thread.
struct CaptureLoop {
    source: String,
    stop: Arc<AtomicBool>,
    // Disconnects when the thread exits.
    done: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

impl CaptureLoop {
    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.thread.is_finished()
    }

    /// Wait up to `timeout` for the thread to exit. Returns the handle back if
    /// it is still running.
    fn join(self, timeout: Duration) -> Option<CaptureLoop> {
        match self.done.recv_timeout(timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => Some(self),
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    tracing::error!(source = %self.source, "Capture loop panicked");
                }
                None
            }
        }
    }
}

/// One live source shared by any number of viewers.
pub struct RealtimeCaptureService {
    shared: Arc<Shared>,
    control: Mutex<Control>,
    join_timeout: Duration,
}

impl RealtimeCaptureService {
    pub fn new(
        detector: Arc<dyn Detector>,
        opener: Arc<dyn CaptureOpener>,
        settings: CaptureSettings,
    ) -> Self {
        let (state, _) = watch::channel(Arc::new(RealtimeState {
            mode: detector.mode(),
            ..RealtimeState::default()
        }));
        let (config, _) = watch::channel(AnalyzeConfig::default());

        Self {
            shared: Arc::new(Shared {
                detector,
                opener,
                state,
                config,
                phase: Mutex::new(PhaseCell {
                    generation: 0,
                    phase: CapturePhase::Idle,
                }),
                source_lease: Mutex::new(()),
                retry_delay: settings.retry_delay,
            }),
            control: Mutex::new(Control {
                source: "0".to_string(),
                ref_count: 0,
                generation: 0,
                current: None,
            }),
            join_timeout: settings.join_timeout,
        }
    }

    /// Set the desired source and detection config.
    ///
    /// The config applies from the next frame. A different source restarts
    /// the loop if anyone is watching.
    pub fn configure(&self, source: &str, config: AnalyzeConfig) {
        let replaced = {
            let mut ctl = self.lock();
            self.shared.config.send_replace(config);

            if ctl.source == source {
                return;
            }
            tracing::info!(from = %ctl.source, to = %source, "Capture source changed");
            ctl.source = source.to_string();

            if ctl.ref_count > 0 {
                self.start_locked(&mut ctl)
            } else {
                if let Some(current) = &ctl.current {
                    current.signal_stop();
                }
                None
            }
        };
        self.retire(replaced);
    }

    /// Register a viewer, starting the loop if it is not running.
    pub fn acquire(&self) {
        let replaced = {
            let mut ctl = self.lock();
            ctl.ref_count += 1;
            metrics::gauge!("realtime_viewers").set(ctl.ref_count as f64);

            let running = ctl.current.as_ref().is_some_and(CaptureLoop::is_active);
            if running {
                None
            } else {
                self.start_locked(&mut ctl)
            }
        };
        self.retire(replaced);
    }

    /// Deregister a viewer. The last one out stops the loop without waiting
    /// for it to exit.
    pub fn release(&self) {
        let mut ctl = self.lock();
        if ctl.ref_count == 0 {
            tracing::warn!("Capture release without matching acquire");
            return;
        }
        ctl.ref_count -= 1;
        metrics::gauge!("realtime_viewers").set(ctl.ref_count as f64);

        if ctl.ref_count == 0 {
            if let Some(current) = &ctl.current {
                tracing::info!(source = %current.source, "Last viewer left, stopping capture");
                current.signal_stop();
                let generation = ctl.generation;
                self.shared
                    .advance(generation, CapturePhase::Running, CapturePhase::Stopping);
                self.shared
                    .advance(generation, CapturePhase::Starting, CapturePhase::Stopping);
            }
        }
    }

    /// Latest published state. Never waits on the capture loop.
    pub fn snapshot(&self) -> Arc<RealtimeState> {
        self.shared.state.borrow().clone()
    }

    /// Receiver that is woken on every published frame.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RealtimeState>> {
        self.shared.state.subscribe()
    }

    /// Acquire a viewer slot that is released when the handle is dropped.
    pub fn viewer(self: &Arc<Self>) -> Viewer {
        self.acquire();
        let mut frames = self.subscribe();
        if frames.borrow().frame_id > 0 {
            frames.mark_changed();
        }
        Viewer {
            service: Arc::clone(self),
            frames,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.shared.phase().phase
    }

    pub fn viewer_count(&self) -> usize {
        self.lock().ref_count
    }

    /// Source of the loop currently running, if any.
    pub fn active_source(&self) -> Option<String> {
        let ctl = self.lock();
        ctl.current
            .as_ref()
            .filter(|current| current.is_active())
            .map(|current| current.source.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop whatever loop exists and start a fresh one on the desired source.
    ///
    /// Returns the replaced loop for the caller to join once the control lock
    /// is released.
    fn start_locked(&self, ctl: &mut Control) -> Option<CaptureLoop> {
        let replaced = ctl.current.take();
        if let Some(old) = &replaced {
            old.signal_stop();
            self.shared
                .advance(ctl.generation, CapturePhase::Running, CapturePhase::Stopping);
        }

        ctl.generation += 1;
        let generation = ctl.generation;
        {
            let mut cell = self.shared.phase();
            cell.generation = generation;
            cell.phase = CapturePhase::Starting;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let source = ctl.source.clone();
        let thread_stop = Arc::clone(&stop);
        let thread_source = source.clone();

        let spawned = std::thread::Builder::new()
            .name("realtime-capture".to_string())
            .spawn(move || {
                let _done = done_tx;
                capture_loop(&shared, &thread_source, generation, &thread_stop);
                shared.finish(generation);
            });

        match spawned {
            Ok(thread) => {
                metrics::counter!("realtime_loop_starts").increment(1);
                tracing::info!(source = %source, generation, "Capture loop started");
                ctl.current = Some(CaptureLoop {
                    source,
                    stop,
                    done: done_rx,
                    thread,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn capture thread");
                self.shared.finish(generation);
            }
        }
        replaced
    }

    /// Bounded join of a replaced loop. Must not be called with the control
    /// lock held.
    fn retire(&self, replaced: Option<CaptureLoop>) {
        let Some(old) = replaced else { return };
        let source = old.source.clone();
        if old.join(self.join_timeout).is_some() {
            tracing::warn!(
                source = %source,
                timeout_ms = self.join_timeout.as_millis() as u64,
                "Previous capture loop did not stop in time, its successor waits for the source"
            );
        }
    }
}

impl Drop for RealtimeCaptureService {
    fn drop(&mut self) {
        if let Some(current) = &self.lock().current {
            current.signal_stop();
        }
    }
}

/// Sleep for `duration` in short slices, returning early once `stop` is set.
fn pause(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

/// Exponential moving average of detector invocations per second.
#[derive(Debug, Default)]
struct FpsMeter {
    last: Option<Instant>,
    fps: f64,
}

impl FpsMeter {
    fn tick(&mut self, now: Instant) {
        if let Some(last) = self.last {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            if dt > 0.0 {
                self.fps = 0.8 * self.fps + 0.2 * (1.0 / dt);
            }
        }
        self.last = Some(now);
    }

    fn value(&self) -> Option<f64> {
        (self.fps > 0.0).then_some(self.fps)
    }
}

fn capture_loop(shared: &Shared, source_id: &str, generation: u64, stop: &AtomicBool) {
    // Declared before `source` so the lease outlives it.
    let Some(_lease) = shared.lease(stop) else {
        tracing::debug!(source = %source_id, generation, "Capture loop cancelled before taking the source");
        return;
    };
    let mut session = shared.detector.session();
    let mode = shared.detector.mode();
    let mut source: Option<Box<dyn FrameSource>> = None;
    let mut frame_index = 0u64;
    let mut last_raw = Vec::new();
    let mut meter = FpsMeter::default();
    let mut open_failures = 0u32;

    while !stop.load(Ordering::Acquire) {
        if source.is_none() {
            match shared.opener.open(source_id) {
                Ok(opened) => {
                    tracing::info!(source = %source_id, "Capture source opened");
                    open_failures = 0;
                    shared.advance(generation, CapturePhase::Starting, CapturePhase::Running);
                    source = Some(opened);
                }
                Err(e) => {
                    open_failures += 1;
                    // Log the first failure loudly, then stay quiet while retrying.
                    if open_failures == 1 {
                        tracing::warn!(source = %source_id, error = %e, "Capture source unavailable, retrying");
                    } else {
                        tracing::debug!(source = %source_id, attempt = open_failures, error = %e, "Capture source still unavailable");
                    }
                    pause(shared.retry_delay, stop);
                    continue;
                }
            }
        }
        let Some(reader) = source.as_mut() else {
            continue;
        };

        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(source = %source_id, "Capture source ended, reopening");
                source = None;
                pause(shared.retry_delay, stop);
                continue;
            }
            Err(e) => {
                tracing::debug!(source = %source_id, error = %e, "Frame read failed, skipping");
                pause(READ_RETRY, stop);
                continue;
            }
        };

        let config = shared.config.borrow().clone();
        let mut frame = video::resize_to_width(frame, config.resize_width);

        if config.is_sampled(frame_index) {
            match session.analyze(&frame, &config) {
                Ok(raw) => {
                    last_raw = raw;
                    meter.tick(Instant::now());
                }
                Err(e) => tracing::warn!(error = %e, "Live detection failed, keeping last result"),
            }
        }
        frame_index += 1;

        let detections = annotator::classify(&last_raw, frame.height(), &config);
        annotator::draw_overlay(&mut frame, &detections, &config);
        let jpeg = match video::encode_jpeg(&frame) {
            Ok(jpeg) => Bytes::from(jpeg),
            Err(e) => {
                tracing::warn!(error = %e, "Frame encoding failed, skipping");
                continue;
            }
        };

        // A stopped loop must not publish after its replacement has started.
        if stop.load(Ordering::Acquire) {
            break;
        }
        let (width, height) = frame.dimensions();
        let fps = meter.value();
        shared.state.send_modify(|state| {
            *state = Arc::new(RealtimeState {
                jpeg: Some(jpeg),
                frame_id: state.frame_id + 1,
                width,
                height,
                detections,
                mode,
                fps,
            });
        });
        metrics::counter!("realtime_frames_published").increment(1);
    }

    drop(source);
    tracing::info!(source = %source_id, generation, "Capture loop stopped");
}

/// A registered viewer. Dropping it releases the viewer slot.
pub struct Viewer {
    service: Arc<RealtimeCaptureService>,
    frames: watch::Receiver<Arc<RealtimeState>>,
}

impl Viewer {
    /// Wait for a frame newer than the last one returned.
    ///
    /// Frames published while the caller was busy are skipped; only the
    /// latest is returned.
    pub async fn next_frame(&mut self) -> Option<Arc<RealtimeState>> {
        self.frames.changed().await.ok()?;
        let state = self.frames.borrow_and_update().clone();
        Some(state)
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.service.release();
    }
}
