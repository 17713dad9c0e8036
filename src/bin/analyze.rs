//! Offline analysis: run one Motion-JPEG file through the job pipeline and
//! print the final job record as JSON.

use clap::Parser;
use obstacle_watch::models::analysis::AnalyzeConfig;
use obstacle_watch::models::job::{JobRecord, JobStatus};
use obstacle_watch::services::{
    archive::{ArchiveError, ResultArchive},
    detector::MotionDetector,
    job_store::{JobStore, StoreError},
    orchestrator::{InputFile, JobPipeline, JobRequest},
    video::MjpegCodec,
};
use garde::Validate;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Analyze one video for obstacles", long_about = None)]
struct Cli {
    /// Motion-JPEG file to analyze
    input: PathBuf,
    /// Storage root receiving the job record and result
    #[arg(long, default_value = "./storage")]
    storage_root: PathBuf,
    /// Run detection on every Nth frame
    #[arg(long, default_value_t = 1)]
    every: u32,
    #[arg(long, default_value_t = 0.5)]
    confidence: f32,
    /// Warning zone starts at this fraction of frame height
    #[arg(long, default_value_t = 0.65)]
    warning: f32,
    /// Danger zone starts at this fraction of frame height
    #[arg(long, default_value_t = 0.80)]
    danger: f32,
    #[arg(long, default_value_t = 800)]
    min_area: u32,
    #[arg(long, default_value_t = 640)]
    width: u32,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Invalid analysis parameters: {0}")]
    Config(#[from] garde::Report),

    #[error("Input file has no name: {0}")]
    InputName(PathBuf),

    #[error("Result archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(record) if record.status == JobStatus::Done => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "Analysis failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<JobRecord, CliError> {
    let config = AnalyzeConfig {
        sampled_every_n_frames: cli.every,
        confidence_threshold: cli.confidence,
        roi_warning_y_ratio: cli.warning,
        roi_danger_y_ratio: cli.danger,
        min_contour_area: cli.min_area,
        resize_width: cli.width,
    };
    config.validate()?;

    let filename = cli
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| CliError::InputName(cli.input.clone()))?;
    let extension = cli
        .input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mjpeg")
        .to_ascii_lowercase();

    let archive = Arc::new(ResultArchive::open(&cli.storage_root)?);
    let store = Arc::new(JobStore::open(archive.jobs_dir())?);
    let record = store.create()?;

    let input_path = archive.job_input_path(&record.job_id, &extension)?;
    let pipeline = JobPipeline::new(
        Arc::clone(&store),
        archive,
        Arc::new(MotionDetector),
        Arc::new(MjpegCodec),
    );

    // The pipeline deletes its input when done, so it gets a copy.
    if let Err(e) = std::fs::copy(&cli.input, &input_path) {
        pipeline.fail(&record.job_id, &e.to_string());
        return Err(e.into());
    }
    pipeline.run(JobRequest {
        job_id: record.job_id.clone(),
        input: InputFile::new(input_path),
        filename,
        config,
    });

    let finished = store
        .get(&record.job_id)?
        .ok_or_else(|| StoreError::NotFound(record.job_id.clone()))?;
    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(finished)
}
