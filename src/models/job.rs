use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum::{Display, EnumString};

/// Status of a detection job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether a record in `self` may move to `next`.
    ///
    /// Repeating a non-terminal status is allowed (progress updates re-send
    /// `running`). A queued job may fail before its worker ever runs.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Queued) | (Queued, Running) | (Queued, Error) => true,
            (Running, Running) | (Running, Done) | (Running, Error) => true,
            _ => false,
        }
    }
}

/// A video detection job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub processed_frames: u64,
    pub total_frames: Option<u64>,
    pub message: Option<String>,
    pub result_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update merged into a [`JobRecord`].
///
/// `None` leaves a field untouched. Nullable fields use a nested option so a
/// patch can clear them (`Some(None)`). Unknown keys are ignored when a patch
/// is deserialized from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub processed_frames: Option<u64>,
    #[serde(default, deserialize_with = "nullable")]
    pub total_frames: Option<Option<u64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub message: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub result_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub error: Option<Option<String>>,
}

// A present key (even `null`) becomes `Some(..)`; a missing key stays `None`
// through `#[serde(default)]`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl JobPatch {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn frames(mut self, processed: u64, total: Option<u64>) -> Self {
        self.processed_frames = Some(processed);
        self.total_frames = Some(total);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(Some(message.into()));
        self
    }

    pub fn result_id(mut self, result_id: Option<String>) -> Self {
        self.result_id = Some(result_id);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    /// Merge the present fields into `record`. Timestamps are left to the store.
    pub fn apply(self, record: &mut JobRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(progress) = self.progress {
            record.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(processed) = self.processed_frames {
            record.processed_frames = processed;
        }
        if let Some(total) = self.total_frames {
            record.total_frames = total;
        }
        if let Some(message) = self.message {
            record.message = message;
        }
        if let Some(result_id) = self.result_id {
            record.result_id = result_id;
        }
        if let Some(error) = self.error {
            record.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Error));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Done.to_string(), "done");
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"queued\"");
    }

    #[test]
    fn test_patch_ignores_unknown_keys_and_clears_nullable() {
        let patch: JobPatch = serde_json::from_str(
            r#"{"status": "running", "result_id": null, "colour": "blue", "message": "Decoding"}"#,
        )
        .unwrap();
        assert_eq!(patch.status, Some(JobStatus::Running));
        assert_eq!(patch.result_id, Some(None));
        assert_eq!(patch.error, None);
        assert_eq!(patch.message, Some(Some("Decoding".to_string())));
    }
}
