//! Job and chunk model.
//!
//! A [`Job`] owns its chunks. The current job status lives in exactly one place,
//! the `watch` channel inside [`JobHandle`]; every transition goes through
//! [`JobHandle::transition`], which rejects moves the state machine does not allow.

use crate::chunk_plan::ChunkPlan;
use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    PartiallyFailed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::PartiallyFailed
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, PartiallyFailed)
                | (Running, Cancelling)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyFailed => "partially_failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// Classification of a chunk's terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    ContentPolicy,
    InvalidLength,
    Timeout,
    Rejected,
    /// The worker task itself died (panic); no client error was observed.
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::ContentPolicy => "content_policy",
            FailureKind::InvalidLength => "invalid_length",
            FailureKind::Timeout => "timeout",
            FailureKind::Rejected => "rejected",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    index: usize,
    source: String,
    status: ChunkStatus,
    attempts: u32,
    failure: Option<ChunkFailure>,
    translated: Option<String>,
}

impl Chunk {
    fn new(index: usize, source: String) -> Self {
        Self {
            index,
            source,
            status: ChunkStatus::Pending,
            attempts: 0,
            failure: None,
            translated: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failure(&self) -> Option<&ChunkFailure> {
        self.failure.as_ref()
    }

    /// Present only while the chunk is `Succeeded`.
    pub fn translated(&self) -> Option<&str> {
        self.translated.as_deref()
    }

    pub fn needs_work(&self) -> bool {
        !matches!(self.status, ChunkStatus::Succeeded)
    }
}

/// Cloneable view of a job's state machine plus its cancellation signal.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Arc<str>,
    state: Arc<watch::Sender<JobStatus>>,
    cancel: CancellationToken,
}

impl JobHandle {
    fn new(id: &str) -> Self {
        let (tx, _rx) = watch::channel(JobStatus::Pending);
        Self {
            id: Arc::from(id),
            state: Arc::new(tx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.state.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation. The run loop performs the state transitions.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Moves to `to`, returning the previous status.
    pub fn transition(&self, to: JobStatus) -> Result<JobStatus, JobError> {
        let mut outcome = Err(JobError::InvalidTransition { from: to, to });
        self.state.send_if_modified(|current| {
            let from = *current;
            if from.can_transition_to(to) {
                *current = to;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(JobError::InvalidTransition { from, to });
                false
            }
        });
        outcome
    }

    pub(crate) fn same_as(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// A translation job: an id, a fixed arena of chunks indexed by position, and
/// the configuration fingerprint the chunks were planned under.
#[derive(Debug)]
pub struct Job {
    handle: JobHandle,
    chunks: Vec<Chunk>,
    fingerprint: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl Job {
    pub fn new(id: &str, plan: ChunkPlan, fingerprint: impl Into<String>) -> Self {
        let chunks = plan
            .into_texts()
            .into_iter()
            .enumerate()
            .map(|(i, text)| Chunk::new(i, text))
            .collect();
        let now = OffsetDateTime::now_utc();
        Self {
            handle: JobHandle::new(id),
            chunks,
            fingerprint: fingerprint.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn status(&self) -> JobStatus {
        self.handle.status()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn count(&self, status: ChunkStatus) -> usize {
        self.chunks.iter().filter(|c| c.status == status).count()
    }

    pub(crate) fn set_created_at(&mut self, ts: OffsetDateTime) {
        self.created_at = ts;
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub(crate) fn mark_in_progress(&mut self, index: usize) {
        if let Some(c) = self.chunks.get_mut(index) {
            if c.status == ChunkStatus::Pending || c.status == ChunkStatus::Failed {
                c.status = ChunkStatus::InProgress;
            }
        }
        self.touch();
    }

    pub(crate) fn mark_succeeded(&mut self, index: usize, text: String, calls: u32) {
        if let Some(c) = self.chunks.get_mut(index) {
            c.status = ChunkStatus::Succeeded;
            c.attempts += calls;
            c.failure = None;
            c.translated = Some(text);
        }
        self.touch();
    }

    pub(crate) fn mark_failed(&mut self, index: usize, failure: ChunkFailure, calls: u32) {
        if let Some(c) = self.chunks.get_mut(index) {
            c.status = ChunkStatus::Failed;
            c.attempts += calls;
            c.failure = Some(failure);
            c.translated = None;
        }
        self.touch();
    }

    /// A chunk interrupted by cancellation goes back to `Pending`.
    pub(crate) fn mark_interrupted(&mut self, index: usize, calls: u32) {
        if let Some(c) = self.chunks.get_mut(index) {
            if c.status == ChunkStatus::InProgress {
                c.status = ChunkStatus::Pending;
            }
            c.attempts += calls;
        }
        self.touch();
    }

    /// Restores state carried over from an earlier run.
    pub(crate) fn restore(
        &mut self,
        index: usize,
        attempts: u32,
        translated: Option<String>,
        failure: Option<ChunkFailure>,
    ) {
        let Some(c) = self.chunks.get_mut(index) else {
            return;
        };
        c.attempts = attempts;
        match translated {
            Some(text) => {
                c.status = ChunkStatus::Succeeded;
                c.translated = Some(text);
                c.failure = None;
            }
            None => {
                c.status = if failure.is_some() {
                    ChunkStatus::Failed
                } else {
                    ChunkStatus::Pending
                };
                c.failure = failure;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_plan::plan;

    fn job(text: &str) -> Job {
        Job::new("t", plan(text, 4).unwrap(), "fp")
    }

    #[test]
    fn happy_path_transitions() {
        let j = job("abcdefgh");
        let h = j.handle();
        assert_eq!(h.transition(JobStatus::Running).unwrap(), JobStatus::Pending);
        assert_eq!(h.transition(JobStatus::Completed).unwrap(), JobStatus::Running);
        assert!(h.status().is_terminal());
    }

    #[test]
    fn terminal_status_is_final() {
        let j = job("abcd");
        let h = j.handle();
        h.transition(JobStatus::Running).unwrap();
        h.transition(JobStatus::Cancelling).unwrap();
        assert!(matches!(
            h.transition(JobStatus::Completed),
            Err(JobError::InvalidTransition { from: JobStatus::Cancelling, .. })
        ));
        h.transition(JobStatus::Cancelled).unwrap();
        assert!(h.transition(JobStatus::Running).is_err());
        assert_eq!(j.status(), JobStatus::Cancelled);
    }

    #[test]
    fn chunk_indices_are_contiguous() {
        let j = job("aaaabbbbcc");
        let idx: Vec<usize> = j.chunks().iter().map(|c| c.index()).collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn failure_clears_translation() {
        let mut j = job("aaaabbbb");
        j.mark_succeeded(0, "AAAA".into(), 1);
        j.mark_failed(
            0,
            ChunkFailure {
                kind: FailureKind::Timeout,
                message: "slow".into(),
            },
            2,
        );
        let c = j.chunk(0).unwrap();
        assert_eq!(c.status(), ChunkStatus::Failed);
        assert_eq!(c.attempts(), 3);
        assert!(c.translated().is_none());
    }
}
