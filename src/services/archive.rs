use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const META_FILE: &str = "meta.json";
const EVENTS_FILE: &str = "events.json";
const VIDEO_FILE: &str = "annotated.mjpeg";
const SNAPSHOTS_DIR: &str = "snapshots";

/// Locations of one result's artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPaths {
    pub result_dir: PathBuf,
    pub meta_path: PathBuf,
    pub events_path: PathBuf,
    pub video_path: PathBuf,
    pub snapshots_dir: PathBuf,
}

/// Deterministic on-disk layout for job records, job inputs and results.
///
/// ```text
/// <root>/jobs/<job_id>.json
/// <root>/jobs/<job_id>_input.<ext>
/// <root>/results/<result_id>/{meta.json, events.json, annotated.mjpeg, snapshots/}
/// ```
pub struct ResultArchive {
    jobs_dir: PathBuf,
    results_dir: PathBuf,
}

impl ResultArchive {
    /// Open (and create if needed) an archive rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let root = root.as_ref();
        let jobs_dir = root.join("jobs");
        let results_dir = root.join("results");
        std::fs::create_dir_all(&jobs_dir)?;
        std::fs::create_dir_all(&results_dir)?;
        Ok(Self {
            jobs_dir,
            results_dir,
        })
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Where an uploaded video waits until its job finishes.
    pub fn job_input_path(&self, job_id: &str, extension: &str) -> Result<PathBuf, ArchiveError> {
        check_id(job_id, "job_")?;
        let extension = extension.trim_start_matches('.');
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ArchiveError::InvalidName(extension.to_string()));
        }
        Ok(self.jobs_dir.join(format!("{job_id}_input.{extension}")))
    }

    /// Create the directories of a result and return its paths. Idempotent.
    pub fn create_result_paths(&self, result_id: &str) -> Result<ResultPaths, ArchiveError> {
        let paths = self.result_paths(result_id)?;
        std::fs::create_dir_all(&paths.snapshots_dir)?;
        Ok(paths)
    }

    /// Resolve a result's paths without touching the filesystem.
    pub fn result_paths(&self, result_id: &str) -> Result<ResultPaths, ArchiveError> {
        check_id(result_id, "res_")?;
        let result_dir = self.results_dir.join(result_id);
        Ok(ResultPaths {
            meta_path: result_dir.join(META_FILE),
            events_path: result_dir.join(EVENTS_FILE),
            video_path: result_dir.join(VIDEO_FILE),
            snapshots_dir: result_dir.join(SNAPSHOTS_DIR),
            result_dir,
        })
    }

    /// Path of a snapshot image, with any directory part of `name` stripped.
    pub fn snapshot_path(&self, result_id: &str, name: &str) -> Result<PathBuf, ArchiveError> {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.starts_with('.'))
            .ok_or_else(|| ArchiveError::InvalidName(name.to_string()))?;
        Ok(self.result_paths(result_id)?.snapshots_dir.join(file_name))
    }

    /// Serialize `value` to `path`. Results are write-once, so an existing
    /// file is never replaced.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), ArchiveError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, value)?;
        tmp.flush()?;
        tmp.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                ArchiveError::AlreadyExists(path.to_path_buf())
            } else {
                ArchiveError::Io(e.error)
            }
        })?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, ArchiveError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Fresh id with the given prefix, e.g. `res_3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

/// Ids are `<prefix><32 lowercase hex>`; anything else could escape the root.
pub fn check_id(id: &str, prefix: &str) -> Result<(), ArchiveError> {
    let valid = id
        .strip_prefix(prefix)
        .is_some_and(|hex| hex.len() == 32 && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    if valid {
        Ok(())
    } else {
        Err(ArchiveError::InvalidName(id.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Refusing to overwrite result artifact: {0}")]
    AlreadyExists(PathBuf),

    #[error("Invalid id or file name: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
