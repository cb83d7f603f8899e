use crate::job::FailureKind;
use serde::Serialize;
use std::sync::Arc;

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub succeeded_chunks: usize,
    pub failed_chunks: usize,
    /// Chunks carried over from a previous run; already included in
    /// `processed_chunks` and `succeeded_chunks`.
    pub skipped_chunks: usize,
    pub message: String,
    pub current_chunk_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Succeeded,
    Failed(FailureKind),
}

pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Job-level counters. Owned by the run loop, so plain fields suffice; each
/// chunk index is counted at most once.
pub struct ProgressTracker {
    total: usize,
    processed: usize,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    counted: Vec<bool>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            counted: vec![false; total],
            callback,
        }
    }

    /// Counts a chunk satisfied by a previous run. No notification.
    pub fn seed_skipped(&mut self, index: usize) -> bool {
        if !self.claim(index) {
            return false;
        }
        self.processed += 1;
        self.succeeded += 1;
        self.skipped += 1;
        true
    }

    /// Counts one resolved chunk and notifies. Returns `false`, without
    /// notifying, if the index is unknown or was already counted.
    pub fn record_outcome(&mut self, index: usize, outcome: ChunkOutcome) -> bool {
        if !self.claim(index) {
            return false;
        }
        self.processed += 1;
        let message = match outcome {
            ChunkOutcome::Succeeded => {
                self.succeeded += 1;
                format!("chunk {} translated ({}/{})", index, self.processed, self.total)
            }
            ChunkOutcome::Failed(kind) => {
                self.failed += 1;
                format!(
                    "chunk {} failed: {} ({}/{})",
                    index, kind, self.processed, self.total
                )
            }
        };
        if let Some(cb) = &self.callback {
            cb(&self.snapshot(message, Some(index)));
        }
        true
    }

    pub fn snapshot(&self, message: impl Into<String>, current: Option<usize>) -> Progress {
        Progress {
            total_chunks: self.total,
            processed_chunks: self.processed,
            succeeded_chunks: self.succeeded,
            failed_chunks: self.failed,
            skipped_chunks: self.skipped,
            message: message.into(),
            current_chunk_index: current,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.processed == self.total
    }

    fn claim(&mut self, index: usize) -> bool {
        match self.counted.get_mut(index) {
            Some(seen) if !*seen => {
                *seen = true;
                true
            }
            _ => false,
        }
    }
}
