use crate::job::JobStatus;
use thiserror::Error;

/// Job-level errors. Per-chunk failures never surface here; they are recorded
/// on the chunk and reflected in the job's terminal status instead.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} already has an active run")]
    AlreadyRunning(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid job transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("job run aborted: {0}")]
    Aborted(String),
}

impl JobError {
    pub fn storage(err: anyhow::Error) -> Self {
        JobError::Storage(err)
    }
}
