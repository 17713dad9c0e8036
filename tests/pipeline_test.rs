mod fixtures;
mod helpers;

use obstacle_watch::models::analysis::AnalyzeConfig;
use obstacle_watch::models::detection::{DetectionMode, RiskLevel, RiskReason};
use obstacle_watch::models::job::{JobPatch, JobStatus};
use obstacle_watch::models::result::{EventLog, ResultMeta};
use obstacle_watch::services::{
    archive::ResultArchive,
    detector::Detector,
    job_store::JobStore,
    orchestrator::{InputFile, JobOrchestrator, JobPipeline, JobRequest, SubmitError},
    video::{FrameSource, MjpegCodec, MjpegReader, VideoCodec},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use helpers::{BrokenCodec, Gate, HookCodec, ScriptedDetector};

struct Harness {
    _dir: tempfile::TempDir,
    archive: Arc<ResultArchive>,
    store: Arc<JobStore>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(assert_ok!(ResultArchive::open(dir.path())));
        let store = Arc::new(assert_ok!(JobStore::open(archive.jobs_dir())));
        Self {
            _dir: dir,
            archive,
            store,
        }
    }

    fn pipeline(&self, detector: impl Detector + 'static, codec: impl VideoCodec + 'static) -> JobPipeline {
        JobPipeline::new(
            Arc::clone(&self.store),
            Arc::clone(&self.archive),
            Arc::new(detector),
            Arc::new(codec),
        )
    }

    /// Create a queued job whose input is a generated clip.
    fn queued_job(&self, frames: usize) -> (String, PathBuf) {
        let record = assert_ok!(self.store.create());
        let input = assert_ok!(self.archive.job_input_path(&record.job_id, "mjpeg"));
        fixtures::write_clip(&input, frames);
        (record.job_id, input)
    }
}

#[test]
fn test_full_job_run() {
    let h = Harness::new();
    let pipeline = h.pipeline(ScriptedDetector::default(), MjpegCodec);
    let (job_id, input) = h.queued_job(5);

    pipeline.run(JobRequest {
        job_id: job_id.clone(),
        input: InputFile::new(&input),
        filename: "walk.mjpeg".to_string(),
        config: helpers::test_config(),
    });

    let record = assert_ok!(h.store.get(&job_id)).unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert_eq!(record.progress, 1.0);
    assert_eq!(record.processed_frames, 5);
    assert_eq!(record.total_frames, Some(5));
    assert_eq!(record.message.as_deref(), Some("Done"));
    assert!(record.error.is_none());
    assert!(!input.exists(), "job input should be deleted");

    let result_id = record.result_id.unwrap();
    let paths = assert_ok!(h.archive.result_paths(&result_id));

    let meta: ResultMeta = assert_ok!(h.archive.read_json(&paths.meta_path));
    assert_eq!(meta.result_id, result_id);
    assert_eq!(meta.filename, "walk.mjpeg");
    assert_eq!(meta.frame_count, Some(5));
    assert_eq!(meta.detection_mode, DetectionMode::Neural);

    let log: EventLog = assert_ok!(h.archive.read_json(&paths.events_path));
    assert_eq!(log.result_id, result_id);
    assert_eq!(log.events.len(), 5);
    for (i, event) in log.events.iter().enumerate() {
        assert_eq!(event.frame_index, i as u64);
        assert_eq!(event.timestamp_ms, i as u64 * 40);
        assert_eq!(event.detection.risk_level, RiskLevel::Danger);
        assert_eq!(event.detection.reason, Some(RiskReason::NearBottom));
        assert_eq!(event.snapshot.as_deref(), Some(format!("{i:06}.jpg").as_str()));
    }
    assert_eq!(std::fs::read_dir(&paths.snapshots_dir).unwrap().count(), 5);

    let video = assert_ok!(MjpegReader::open(&paths.video_path));
    assert_eq!(video.frame_count(), Some(5));
}

#[test]
fn test_skipped_frames_log_no_events() {
    let h = Harness::new();
    let pipeline = h.pipeline(ScriptedDetector::default(), MjpegCodec);
    let (job_id, input) = h.queued_job(5);

    pipeline.run(JobRequest {
        job_id: job_id.clone(),
        input: InputFile::new(&input),
        filename: "walk.mjpeg".to_string(),
        config: AnalyzeConfig {
            sampled_every_n_frames: 2,
            ..helpers::test_config()
        },
    });

    let record = assert_ok!(h.store.get(&job_id)).unwrap();
    assert_eq!(record.status, JobStatus::Done);
    let paths = assert_ok!(h.archive.result_paths(&record.result_id.unwrap()));
    let log: EventLog = assert_ok!(h.archive.read_json(&paths.events_path));
    let frames: Vec<u64> = log.events.iter().map(|e| e.frame_index).collect();
    assert_eq!(frames, vec![0, 2, 4]);

    // Every frame is still written to the annotated video
    let video = assert_ok!(MjpegReader::open(&paths.video_path));
    assert_eq!(video.frame_count(), Some(5));
}

#[test]
fn test_failed_job_records_error() {
    let h = Harness::new();
    let pipeline = h.pipeline(ScriptedDetector::default(), BrokenCodec);
    let (job_id, input) = h.queued_job(3);

    pipeline.run(JobRequest {
        job_id: job_id.clone(),
        input: InputFile::new(&input),
        filename: "walk.mjpeg".to_string(),
        config: helpers::test_config(),
    });

    let record = assert_ok!(h.store.get(&job_id)).unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert!(record.result_id.is_none());
    assert!(record.error.unwrap().contains("codec unavailable"));
    assert!(!input.exists(), "job input should be deleted");

    // No half-written result is left behind
    let results_dir = h.archive.jobs_dir().parent().unwrap().join("results");
    assert_eq!(std::fs::read_dir(results_dir).unwrap().count(), 0);
}

#[test]
fn test_unrecorded_completion_discards_result() {
    let h = Harness::new();
    let (job_id, input) = h.queued_job(3);

    // The job is failed elsewhere after its last frame, so recording Done is refused.
    let store = Arc::clone(&h.store);
    let failing_id = job_id.clone();
    let codec = HookCodec::new(move || {
        let patch = JobPatch::default()
            .status(JobStatus::Error)
            .error(Some("cancelled".to_string()));
        store.update(&failing_id, patch).unwrap();
    });
    let pipeline = h.pipeline(ScriptedDetector::default(), codec);

    pipeline.run(JobRequest {
        job_id: job_id.clone(),
        input: InputFile::new(&input),
        filename: "walk.mjpeg".to_string(),
        config: helpers::test_config(),
    });

    let record = assert_ok!(h.store.get(&job_id)).unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert!(record.result_id.is_none());
    assert!(!input.exists());

    let results_dir = h.archive.jobs_dir().parent().unwrap().join("results");
    assert_eq!(std::fs::read_dir(results_dir).unwrap().count(), 0);
}

#[test]
fn test_empty_video_fails() {
    let h = Harness::new();
    let pipeline = h.pipeline(ScriptedDetector::default(), MjpegCodec);
    let record = assert_ok!(h.store.create());
    let input = assert_ok!(h.archive.job_input_path(&record.job_id, "mjpeg"));
    std::fs::write(&input, b"").unwrap();

    pipeline.run(JobRequest {
        job_id: record.job_id.clone(),
        input: InputFile::new(&input),
        filename: "empty.mjpeg".to_string(),
        config: helpers::test_config(),
    });

    let record = assert_ok!(h.store.get(&record.job_id)).unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert!(!input.exists());
}

#[tokio::test]
async fn test_queue_full_rejects_submission() {
    let h = Harness::new();
    let gate = Gate::default();
    let pipeline = Arc::new(h.pipeline(ScriptedDetector::gated(gate.clone()), MjpegCodec));
    let orchestrator = JobOrchestrator::start(pipeline, 1, 1);

    // One job held by the worker (or waiting), one in the queue, one too many.
    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(h.queued_job(2));
    }
    for (job_id, input) in &jobs[..2] {
        // The worker may not have dequeued the first job yet
        let _ = orchestrator.submit(job_id, InputFile::new(input), "clip.mjpeg", helpers::test_config());
    }

    let (rejected_id, rejected_input) = &jobs[2];
    let err = assert_err!(orchestrator.submit(
        rejected_id,
        InputFile::new(rejected_input),
        "clip.mjpeg",
        helpers::test_config(),
    ));
    assert!(matches!(err, SubmitError::QueueFull));
    let rejected = assert_ok!(h.store.get(rejected_id)).unwrap();
    assert_eq!(rejected.status, JobStatus::Error);
    assert!(!rejected_input.exists());

    gate.open();

    let (first_id, first_input) = &jobs[0];
    let mut last_progress = 0.0;
    let mut done = false;
    for _ in 0..500 {
        let record = assert_ok!(h.store.get(first_id)).unwrap();
        assert!(record.progress >= last_progress, "progress went backwards");
        last_progress = record.progress;
        if record.status.is_terminal() {
            assert_eq!(record.status, JobStatus::Done);
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(done, "first job never finished");
    assert_eq!(last_progress, 1.0);
    assert!(!first_input.exists());
}
