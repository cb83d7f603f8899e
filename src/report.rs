use crate::job::{ChunkStatus, FailureKind, Job, JobStatus};
use crate::progress::Progress;
use crate::util::{char_len, format_rfc3339, now_rfc3339};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub config_fingerprint: String,
    pub total_chunks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub created_at: String,
    pub finished_at: String,
    pub chunk_reports: Vec<ChunkReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReport {
    pub chunk_index: usize,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub source_chars: usize,
    pub translated_chars: Option<usize>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
}

impl JobReport {
    pub fn build(job: &Job, status: JobStatus, progress: &Progress) -> Self {
        let chunk_reports = job
            .chunks()
            .iter()
            .map(|c| ChunkReport {
                chunk_index: c.index(),
                status: c.status(),
                attempts: c.attempts(),
                source_chars: char_len(c.source()),
                translated_chars: c.translated().map(char_len),
                failure: c.failure().map(|f| f.kind),
                error: c.failure().map(|f| f.message.clone()),
            })
            .collect();

        Self {
            job_id: job.id().to_string(),
            status,
            config_fingerprint: job.fingerprint().to_string(),
            total_chunks: job.len(),
            succeeded: job.count(ChunkStatus::Succeeded),
            failed: job.count(ChunkStatus::Failed),
            skipped: progress.skipped_chunks,
            created_at: format_rfc3339(job.created_at()),
            finished_at: now_rfc3339(),
            chunk_reports,
        }
    }

    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkReport> {
        self.chunk_reports
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
    }
}
