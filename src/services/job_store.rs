use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::models::job::{JobPatch, JobRecord, JobStatus};
use crate::services::archive;

/// Durable job records: one JSON file per job, cached in memory.
///
/// Every mutation rewrites the whole record before returning. A single lock
/// covers the cache and the file write, so concurrent workers never interleave
/// a read-modify-write of the same record.
pub struct JobStore {
    jobs_dir: PathBuf,
    cache: Mutex<HashMap<String, JobRecord>>,
}

impl JobStore {
    pub fn open(jobs_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let jobs_dir = jobs_dir.into();
        std::fs::create_dir_all(&jobs_dir)?;
        Ok(Self {
            jobs_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Create a queued job and persist it.
    pub fn create(&self) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let record = JobRecord {
            job_id: archive::new_id("job_"),
            status: JobStatus::Queued,
            progress: 0.0,
            processed_frames: 0,
            total_frames: None,
            message: Some("Queued".to_string()),
            result_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut cache = self.lock();
        self.persist(&record)?;
        cache.insert(record.job_id.clone(), record.clone());
        Ok(record)
    }

    /// Look a job up, loading it from disk on a cache miss.
    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut cache = self.lock();
        let record = self.load_locked(&mut cache, job_id)?.cloned();
        Ok(record)
    }

    /// Merge `patch` into a job, bump `updated_at` and persist the full record.
    pub fn update(&self, job_id: &str, patch: JobPatch) -> Result<JobRecord, StoreError> {
        let mut cache = self.lock();
        let current = self
            .load_locked(&mut cache, job_id)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        if let Some(next) = patch.status {
            if !current.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: current.status,
                    to: next,
                });
            }
        }

        let mut updated = current.clone();
        patch.apply(&mut updated);
        // Strictly later than the previous stamp, even within one clock tick.
        updated.updated_at = Utc::now().max(current.updated_at + Duration::microseconds(1));

        self.persist(&updated)?;
        cache.insert(job_id.to_string(), updated.clone());
        Ok(updated)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobRecord>> {
        // A panic mid-update leaves the cache no worse than the files on disk.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_locked<'a>(
        &self,
        cache: &'a mut HashMap<String, JobRecord>,
        job_id: &str,
    ) -> Result<Option<&'a JobRecord>, StoreError> {
        if !cache.contains_key(job_id) {
            if archive::check_id(job_id, "job_").is_err() {
                return Ok(None);
            }
            let bytes = match std::fs::read(self.record_path(job_id)) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let record: JobRecord = serde_json::from_slice(&bytes)?;
            cache.insert(job_id.to_string(), record);
        }
        Ok(cache.get(job_id))
    }

    fn persist(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.jobs_dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush()?;
        tmp.persist(self.record_path(&record.job_id))
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{job_id}.json"))
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
