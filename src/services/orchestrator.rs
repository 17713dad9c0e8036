use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use crate::models::analysis::AnalyzeConfig;
use crate::models::detection::RawDetection;
use crate::models::job::{JobPatch, JobStatus};
use crate::models::result::{EventLog, ResultMeta};
use crate::services::annotator::{self, FrameAnnotator};
use crate::services::archive::{self, ArchiveError, ResultArchive, ResultPaths};
use crate::services::detector::{Detector, DetectorError};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::video::{self, VideoCodec, VideoError};

/// Minimum spacing between persisted progress updates.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Deletes a job's uploaded input when dropped, whatever happened to the job.
#[derive(Debug)]
pub struct InputFile(PathBuf);

impl InputFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for InputFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => tracing::debug!(path = %self.0.display(), "Removed job input"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.0.display(), error = %e, "Failed to remove job input"),
        }
    }
}

/// A job waiting for a worker.
#[derive(Debug)]
pub struct JobRequest {
    pub job_id: String,
    pub input: InputFile,
    pub filename: String,
    pub config: AnalyzeConfig,
}

/// Decides which per-frame progress callbacks reach the job store.
///
/// The first callback and the final frame are always persisted; anything in
/// between only once `interval` has passed since the last persisted one.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
    progress: f64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            progress: 0.0,
        }
    }

    pub fn should_persist(&mut self, now: Instant, processed: u64, total: Option<u64>) -> bool {
        let is_final = total.is_some_and(|total| processed >= total);
        let due = self
            .last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if due || is_final {
            self.last = Some(now);
            true
        } else {
            false
        }
    }

    /// Fraction done, never lower than a previously reported value.
    pub fn progress(&mut self, processed: u64, total: Option<u64>) -> f64 {
        if let Some(total) = total.filter(|t| *t > 0) {
            let fraction = (processed as f64 / total as f64).min(1.0);
            self.progress = self.progress.max(fraction);
        }
        self.progress
    }
}

/// Everything a worker needs to run one job end to end.
pub struct JobPipeline {
    store: Arc<JobStore>,
    archive: Arc<ResultArchive>,
    detector: Arc<dyn Detector>,
    codec: Arc<dyn VideoCodec>,
}

impl JobPipeline {
    pub fn new(
        store: Arc<JobStore>,
        archive: Arc<ResultArchive>,
        detector: Arc<dyn Detector>,
        codec: Arc<dyn VideoCodec>,
    ) -> Self {
        Self {
            store,
            archive,
            detector,
            codec,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Run one job to a terminal state. Blocking; call from a blocking thread.
    ///
    /// The request (and with it the input file) is dropped on return.
    pub fn run(&self, request: JobRequest) {
        let started = Instant::now();
        let job_id = request.job_id.clone();
        tracing::info!(job_id = %job_id, filename = %request.filename, "Processing detection job");

        match self.process(&request, started) {
            Ok(outcome) => {
                let done = JobPatch::default()
                    .status(JobStatus::Done)
                    .progress(1.0)
                    .frames(outcome.frames, Some(outcome.frames))
                    .message("Done")
                    .result_id(Some(outcome.result_id.clone()))
                    .error(None);
                match self.store.update(&job_id, done) {
                    Ok(_) => {
                        metrics::counter!("detection_jobs_completed").increment(1);
                        metrics::histogram!("detection_job_processing_seconds")
                            .record(started.elapsed().as_secs_f64());
                        tracing::info!(
                            job_id = %job_id,
                            result_id = %outcome.result_id,
                            frames = outcome.frames,
                            events = outcome.events,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Job completed successfully"
                        );
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to record job completion");
                        self.discard_result(&job_id, &outcome.result_id);
                        self.fail(&job_id, &e.to_string());
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job processing failed");
                self.fail(&job_id, &e.to_string());
            }
        }
    }

    /// Record a fatal failure. Jobs are never retried.
    pub fn fail(&self, job_id: &str, error: &str) {
        metrics::counter!("detection_jobs_failed").increment(1);
        let patch = JobPatch::default()
            .status(JobStatus::Error)
            .message("Error")
            .error(Some(error.to_string()))
            .result_id(None);
        if let Err(e) = self.store.update(job_id, patch) {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
    }

    fn process(&self, request: &JobRequest, started: Instant) -> Result<JobOutcome, JobError> {
        let job_id = request.job_id.as_str();

        self.store.update(
            job_id,
            JobPatch::default().status(JobStatus::Running).message("Starting"),
        )?;

        let result_id = archive::new_id("res_");
        let paths = self.archive.create_result_paths(&result_id)?;

        let outcome = self.render(request, result_id.clone(), &paths, started);
        if outcome.is_err() {
            self.discard_result(job_id, &result_id);
        }
        outcome
    }

    /// Remove a result that will never be referenced by a finished job.
    fn discard_result(&self, job_id: &str, result_id: &str) {
        let removed = self
            .archive
            .result_paths(result_id)
            .map_err(|e| e.to_string())
            .and_then(|paths| std::fs::remove_dir_all(&paths.result_dir).map_err(|e| e.to_string()));
        if let Err(e) = removed {
            tracing::warn!(job_id = %job_id, result_id = %result_id, error = %e, "Failed to remove unused result");
        }
    }

    fn render(
        &self,
        request: &JobRequest,
        result_id: String,
        paths: &ResultPaths,
        started: Instant,
    ) -> Result<JobOutcome, JobError> {
        let job_id = request.job_id.as_str();
        let config = &request.config;

        let mut source = self.codec.open_input(request.input.path())?;
        let total = source.frame_count();
        let fps = source.fps();
        let mut sink = self.codec.create_output(&paths.video_path)?;
        let mut session = self.detector.session();
        let mut annotator = FrameAnnotator::with_snapshots(&paths.snapshots_dir);
        let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);

        let mut last_raw: Vec<RawDetection> = Vec::new();
        let mut events = Vec::new();
        let mut frames = 0u64;

        while let Some(frame) = source.read_frame()? {
            let index = frames;
            let mut frame = video::resize_to_width(frame, config.resize_width);

            if config.is_sampled(index) {
                last_raw = session.analyze(&frame, config)?;
                let timestamp_ms =
                    (index as f64 * 1000.0 / fps.unwrap_or(video::DEFAULT_FPS)) as u64;
                let annotated =
                    annotator.annotate(index, timestamp_ms, &last_raw, &mut frame, config)?;
                events.extend(annotated.events);
            } else {
                // Skipped frames show the last result but log no new events.
                let detections = annotator::classify(&last_raw, frame.height(), config);
                annotator::draw_overlay(&mut frame, &detections, config);
            }

            sink.write_frame(&frame)?;
            frames += 1;

            if throttle.should_persist(Instant::now(), frames, total) {
                let patch = JobPatch::default()
                    .status(JobStatus::Running)
                    .progress(throttle.progress(frames, total))
                    .frames(frames, total)
                    .message("Processing");
                self.store.update(job_id, patch)?;
            }
        }
        sink.finish()?;

        if frames == 0 {
            return Err(JobError::Video(VideoError::NoFrames));
        }

        let meta = ResultMeta {
            result_id: result_id.clone(),
            filename: request.filename.clone(),
            created_at: Utc::now(),
            processing_time_s: (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0,
            fps,
            frame_count: Some(frames),
            detection_mode: self.detector.mode(),
            config: config.clone(),
        };
        let event_count = events.len();
        self.archive.write_json(&paths.meta_path, &meta)?;
        self.archive.write_json(
            &paths.events_path,
            &EventLog {
                result_id: result_id.clone(),
                events,
            },
        )?;

        Ok(JobOutcome {
            result_id,
            frames,
            events: event_count,
        })
    }
}

struct JobOutcome {
    result_id: String,
    frames: u64,
    events: usize,
}

/// Bounded pool of job workers fed by a bounded queue.
///
/// Admission is reject-when-full: `submit` never waits for queue space.
pub struct JobOrchestrator {
    pipeline: Arc<JobPipeline>,
    queue: mpsc::Sender<JobRequest>,
}

impl JobOrchestrator {
    /// Spawn `workers` worker tasks on the current Tokio runtime.
    pub fn start(pipeline: Arc<JobPipeline>, workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<JobRequest>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                tracing::debug!(worker, "Job worker started");
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(request) = next else { break };
                    let job_id = request.job_id.clone();
                    let runner = Arc::clone(&pipeline);
                    if let Err(e) = tokio::task::spawn_blocking(move || runner.run(request)).await {
                        tracing::error!(worker, job_id = %job_id, error = %e, "Job worker panicked");
                        pipeline.fail(&job_id, "Worker panicked");
                    }
                }
                tracing::debug!(worker, "Job worker stopped");
            });
        }

        Self {
            pipeline,
            queue: tx,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.pipeline.store()
    }

    /// Hand a queued job to the worker pool.
    ///
    /// On rejection the job is marked as failed and its input removed.
    pub fn submit(
        &self,
        job_id: &str,
        input: InputFile,
        filename: impl Into<String>,
        config: AnalyzeConfig,
    ) -> Result<(), SubmitError> {
        let request = JobRequest {
            job_id: job_id.to_string(),
            input,
            filename: filename.into(),
            config,
        };

        let rejected = match self.queue.try_send(request) {
            Ok(()) => {
                metrics::counter!("detection_jobs_submitted").increment(1);
                tracing::info!(job_id = %job_id, "Job queued");
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Full(_)) => SubmitError::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SubmitError::Closed,
        };

        metrics::counter!("detection_jobs_rejected").increment(1);
        tracing::warn!(job_id = %job_id, reason = %rejected, "Job rejected");
        let patch = JobPatch::default()
            .status(JobStatus::Error)
            .message("Error")
            .error(Some(rejected.to_string()));
        if let Err(e) = self.store().update(job_id, patch) {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job rejection");
        }
        Err(rejected)
    }
}

/// Fatal failure of one job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Result archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Video error: {0}")]
    Video(#[from] VideoError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Job queue is full")]
    QueueFull,

    #[error("Job workers have shut down")]
    Closed,

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}
