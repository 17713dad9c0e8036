use serde::Deserialize;
use std::time::Duration;

use crate::services::realtime::CaptureSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory holding `jobs/` and `results/`. Live capture sources are
    /// resolved relative to it as well.
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    /// Number of jobs processed concurrently
    #[serde(default = "default_job_workers")]
    pub job_workers: usize,

    /// Jobs waiting beyond this are rejected with 503
    #[serde(default = "default_job_queue_capacity")]
    pub job_queue_capacity: usize,

    /// Largest accepted upload in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Bounded wait for a replaced capture loop to exit
    #[serde(default = "default_capture_join_timeout_ms")]
    pub capture_join_timeout_ms: u64,

    /// Delay between attempts to reopen an unavailable capture source
    #[serde(default = "default_capture_retry_ms")]
    pub capture_retry_ms: u64,

    /// Replay rate of file-backed live sources
    #[serde(default = "default_capture_fps")]
    pub capture_fps: f64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_storage_root() -> String {
    "./storage".to_string()
}

fn default_job_workers() -> usize {
    2
}

fn default_job_queue_capacity() -> usize {
    16
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_capture_join_timeout_ms() -> u64 {
    1000
}

fn default_capture_retry_ms() -> u64 {
    250
}

fn default_capture_fps() -> f64 {
    25.0
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            join_timeout: Duration::from_millis(self.capture_join_timeout_ms),
            retry_delay: Duration::from_millis(self.capture_retry_ms),
        }
    }
}
