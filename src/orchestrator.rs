//! Runs a [`Job`]: resume bookkeeping, bounded dispatch, cancellation, and
//! index-ordered assembly.
//!
//! All chunk state, counters and persistence are driven by one run loop per
//! job. Worker tasks only translate; they hand their result back through the
//! `JoinSet` and never touch the job.

use crate::chunk_plan;
use crate::client::TranslateClient;
use crate::config::{Config, Output};
use crate::error::JobError;
use crate::job::{ChunkFailure, ChunkStatus, FailureKind, Job, JobHandle, JobStatus};
use crate::journal::ChunkJournal;
use crate::metadata::{Metadata, MetadataStore};
use crate::progress::{ChunkOutcome, Progress, ProgressCallback, ProgressTracker};
use crate::recovery::{RecoveryError, RecoveryPolicy, RecoveryStats, RetrySplitter};
use crate::report::JobReport;
use crate::throttle::Throttle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub progress: Option<ProgressCallback>,
    /// Job-level transitions: started, cancelling, and the terminal status.
    pub status: Option<StatusCallback>,
}

impl Callbacks {
    fn status(&self, message: &str) {
        if let Some(cb) = &self.status {
            cb(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Consult the stored snapshot and skip chunks it proves translated.
    pub resume: bool,
    /// Dispatch only chunks the snapshot lists as failed or unfinished.
    /// Implies loading the snapshot even when `resume` is off.
    pub retry_failed_only: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: true,
            retry_failed_only: false,
        }
    }
}

impl RunOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            resume: cfg.global.resume,
            retry_failed_only: false,
        }
    }
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub status: JobStatus,
    /// Translated chunks in index order, with placeholders for failed ones.
    pub output: String,
    pub progress: Progress,
    pub report: JobReport,
}

pub struct RunningJob {
    handle: JobHandle,
    task: JoinHandle<Result<JobOutcome, JobError>>,
}

impl RunningJob {
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub async fn wait(self) -> Result<JobOutcome, JobError> {
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(JobError::Aborted(e.to_string())),
        }
    }
}

struct Inner {
    cfg: Config,
    client: Arc<dyn TranslateClient>,
    store: Arc<dyn MetadataStore>,
    journal: Arc<dyn ChunkJournal>,
    active: Mutex<HashMap<String, JobHandle>>,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
    callbacks: Callbacks,
}

impl JobOrchestrator {
    pub fn new(
        cfg: Config,
        client: Arc<dyn TranslateClient>,
        store: Arc<dyn MetadataStore>,
        journal: Arc<dyn ChunkJournal>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                client,
                store,
                journal,
                active: Mutex::new(HashMap::new()),
            }),
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    /// Plans `text` into a new pending job under the current configuration.
    pub fn create_job(&self, id: &str, text: &str) -> Result<Job, JobError> {
        let cfg = &self.inner.cfg;
        cfg.validate()?;
        let plan = chunk_plan::plan(text, cfg.chunking.max_chunk_size)
            .map_err(|e| JobError::Configuration(format!("{e:#}")))?;
        Ok(Job::new(id, plan, cfg.fingerprint()))
    }

    /// Handle of the active run for `job_id`, if any.
    pub fn handle(&self, job_id: &str) -> Option<JobHandle> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    pub fn cancel(&self, job_id: &str) -> Result<(), JobError> {
        let handle = self
            .handle(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        info!("cancel requested for job {job_id}");
        handle.cancel();
        Ok(())
    }

    pub async fn start(&self, mut job: Job, opts: RunOptions) -> Result<RunningJob, JobError> {
        self.inner.cfg.validate()?;
        if job.status() != JobStatus::Pending {
            return Err(JobError::InvalidTransition {
                from: job.status(),
                to: JobStatus::Running,
            });
        }

        let registration = self.register(job.handle())?;
        let skipped = self.prepare(&mut job, opts).await?;
        job.handle().transition(JobStatus::Running)?;

        let handle = job.handle().clone();
        let this = self.clone();
        let task = tokio::spawn(async move {
            let res = this.run(job, skipped).await;
            drop(registration);
            res
        });
        Ok(RunningJob { handle, task })
    }

    fn register(&self, handle: &JobHandle) -> Result<Registration, JobError> {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = active.get(handle.id()) {
            if !existing.status().is_terminal() {
                return Err(JobError::AlreadyRunning(handle.id().to_string()));
            }
        }
        active.insert(handle.id().to_string(), handle.clone());
        Ok(Registration {
            inner: self.inner.clone(),
            handle: handle.clone(),
        })
    }

    /// Applies the stored snapshot to `job`. Returns the chunk indices that
    /// need no work this run.
    async fn prepare(&self, job: &mut Job, opts: RunOptions) -> Result<Vec<usize>, JobError> {
        let key = job.id().to_string();
        let inner = &self.inner;

        let snapshot = if opts.resume || opts.retry_failed_only {
            inner.store.load(&key).await.map_err(JobError::storage)?
        } else {
            None
        };

        let snapshot = match snapshot {
            Some(meta) if meta.matches(job.fingerprint(), job.len()) => Some(meta),
            Some(meta) => {
                info!(
                    "stored progress for {key} does not match ({} chunks, fingerprint {}); starting over",
                    meta.total_chunks,
                    short(&meta.config_fingerprint)
                );
                None
            }
            None => None,
        };

        let Some(meta) = snapshot else {
            if opts.retry_failed_only {
                warn!("no usable progress for {key}; retry-failed-only will translate every chunk");
            }
            inner.journal.reset(&key).await.map_err(JobError::storage)?;
            return Ok(Vec::new());
        };

        if let Ok(ts) = OffsetDateTime::parse(&meta.created_at, &Rfc3339) {
            job.set_created_at(ts);
        }

        let mut texts = inner.journal.load(&key).await.map_err(JobError::storage)?;
        let mut skipped = Vec::new();
        for record in &meta.chunks {
            if record.index >= job.len() {
                continue;
            }
            let text = match record.status {
                ChunkStatus::Succeeded => {
                    let text = texts.get(&record.index).cloned();
                    if text.is_none() {
                        warn!(chunk = record.index, "marked translated but missing from journal; retranslating");
                    }
                    text
                }
                _ => None,
            };
            if text.is_some() {
                skipped.push(record.index);
            }
            job.restore(record.index, record.attempts, text, record.failure_detail());
        }

        // Later appends must not land after a torn or stale record.
        texts.retain(|index, _| skipped.contains(index));
        inner
            .journal
            .rewrite(&key, &texts)
            .await
            .map_err(JobError::storage)?;

        info!(
            "resuming {key}: {} of {} chunks already translated, {} previously failed",
            skipped.len(),
            job.len(),
            meta.count(ChunkStatus::Failed)
        );
        Ok(skipped)
    }

    async fn run(&self, mut job: Job, skipped: Vec<usize>) -> Result<JobOutcome, JobError> {
        let cfg = &self.inner.cfg;
        let handle = job.handle().clone();
        let cancel = handle.cancel_token().clone();
        let key = job.id().to_string();

        let mut tracker = ProgressTracker::new(job.len(), self.callbacks.progress.clone());
        for &index in &skipped {
            tracker.seed_skipped(index);
        }

        let pending: Vec<(usize, String)> = job
            .chunks()
            .iter()
            .filter(|c| c.needs_work())
            .map(|c| (c.index(), c.source().to_string()))
            .collect();

        info!(
            "job {key} running: chunks={} to_translate={} skipped={} workers={}",
            job.len(),
            pending.len(),
            skipped.len(),
            cfg.global.max_workers
        );
        self.callbacks.status(&format!(
            "job {key} started: {} chunks, {} to translate",
            job.len(),
            pending.len()
        ));

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            client: self.inner.client.clone(),
            policy: Arc::new(RecoveryPolicy::from_config(cfg)),
            throttle: Throttle::per_minute(cfg.api.requests_per_minute).map(Arc::new),
            semaphore: Arc::new(Semaphore::new(cfg.global.max_workers)),
            cancel: cancel.clone(),
            source_lang: Arc::from(cfg.api.source_lang.as_str()),
            target_lang: Arc::from(cfg.api.target_lang.as_str()),
            started: started_tx,
        };

        let mut tasks = JoinSet::new();
        let mut task_chunks: HashMap<Id, TaskChunk> = HashMap::new();
        for (index, text) in pending {
            let spent = Arc::new(AtomicU32::new(0));
            let abort = tasks.spawn(worker.clone().translate(index, text, spent.clone()));
            task_chunks.insert(abort.id(), TaskChunk { index, spent });
        }
        drop(worker);

        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(index) = started_rx.recv() => {
                    debug!(chunk = index, "dispatched");
                    job.mark_in_progress(index);
                }
                joined = tasks.join_next_with_id() => match joined {
                    Some(joined) => self.settle(&mut job, &mut tracker, &task_chunks, joined).await,
                    None => break,
                },
            }
        }

        if cancelled {
            // Results that were already in when the cancel landed still count.
            while let Some(joined) = tasks.try_join_next_with_id() {
                self.settle(&mut job, &mut tracker, &task_chunks, joined).await;
            }
            if tracker.is_complete() {
                info!("cancel for job {key} arrived after every chunk resolved");
                cancelled = false;
            }
        }

        if cancelled {
            handle.transition(JobStatus::Cancelling)?;
            self.callbacks.status(&format!("job {key} cancelling"));
            info!("job {key} cancelling: {} tasks outstanding", tasks.len());

            let grace = tokio::time::sleep(Duration::from_millis(cfg.global.cancel_grace_ms));
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut grace => break,
                    joined = tasks.join_next_with_id() => match joined {
                        Some(joined) => self.settle(&mut job, &mut tracker, &task_chunks, joined).await,
                        None => break,
                    },
                }
            }
            tasks.abort_all();
            while let Some(joined) = tasks.join_next_with_id().await {
                self.settle(&mut job, &mut tracker, &task_chunks, joined).await;
            }
        }

        let failed = job.count(ChunkStatus::Failed);
        let status = if cancelled {
            JobStatus::Cancelled
        } else if failed > 0 {
            JobStatus::PartiallyFailed
        } else {
            JobStatus::Completed
        };

        let saved = self
            .inner
            .store
            .save(&key, &Metadata::from_job(&job, status))
            .await;
        if let Err(e) = &saved {
            error!("final snapshot for {key} not saved: {e:#}");
        }
        handle.transition(status)?;
        saved.map_err(JobError::storage)?;

        let succeeded = job.count(ChunkStatus::Succeeded);
        let message = match status {
            JobStatus::Completed => format!("job {key} completed: {succeeded} chunks translated"),
            JobStatus::PartiallyFailed => {
                format!("job {key} partially failed: {failed} of {} chunks failed", job.len())
            }
            _ => format!(
                "job {key} cancelled: {succeeded} of {} chunks translated, progress saved",
                job.len()
            ),
        };
        info!("{message}");
        self.callbacks.status(&message);

        let progress = tracker.snapshot(message, None);
        let output = assemble(&job, &cfg.output);
        let report = JobReport::build(&job, status, &progress);

        Ok(JobOutcome {
            job,
            status,
            output,
            progress,
            report,
        })
    }

    /// Applies one worker result to the job, then persists.
    async fn settle(
        &self,
        job: &mut Job,
        tracker: &mut ProgressTracker,
        task_chunks: &HashMap<Id, TaskChunk>,
        joined: Result<(Id, WorkerResult), JoinError>,
    ) {
        let WorkerResult {
            index,
            result,
            stats,
        } = match joined {
            Ok((_, res)) => res,
            Err(e) => {
                let Some(task) = task_chunks.get(&e.id()) else {
                    error!("unknown worker task ended: {e}");
                    return;
                };
                let index = task.index;
                if e.is_cancelled() {
                    job.mark_interrupted(index, task.spent.load(Ordering::Relaxed));
                    return;
                }
                error!(chunk = index, "worker panicked: {e}");
                WorkerResult {
                    index,
                    result: Err(RecoveryError::Terminal {
                        kind: FailureKind::Internal,
                        message: e.to_string(),
                    }),
                    stats: RecoveryStats {
                        calls: task.spent.load(Ordering::Relaxed),
                        ..RecoveryStats::default()
                    },
                }
            }
        };

        let key = job.id().to_string();
        match result {
            Ok(text) => {
                if let Err(e) = self.inner.journal.append(&key, index, &text).await {
                    warn!(chunk = index, "journal append failed: {e:#}");
                }
                debug!(
                    chunk = index,
                    calls = stats.calls,
                    splits = stats.splits,
                    "chunk translated"
                );
                job.mark_succeeded(index, text, stats.calls);
                tracker.record_outcome(index, ChunkOutcome::Succeeded);
            }
            Err(RecoveryError::Terminal { kind, message }) => {
                warn!(chunk = index, calls = stats.calls, "chunk failed ({kind}): {message}");
                job.mark_failed(index, ChunkFailure { kind, message }, stats.calls);
                tracker.record_outcome(index, ChunkOutcome::Failed(kind));
            }
            Err(RecoveryError::Cancelled) => {
                job.mark_interrupted(index, stats.calls);
                return;
            }
        }

        let meta = Metadata::from_job(job, job.status());
        if let Err(e) = self.inner.store.save(&key, &meta).await {
            warn!(chunk = index, "snapshot save failed: {e:#}");
        }
    }
}

/// Concatenates chunk output strictly by index. Failed chunks get the
/// configured placeholder; chunks that never ran contribute nothing.
pub fn assemble(job: &Job, output: &Output) -> String {
    let mut out = String::new();
    for chunk in job.chunks() {
        match chunk.status() {
            ChunkStatus::Succeeded => out.push_str(chunk.translated().unwrap_or_default()),
            ChunkStatus::Failed => {
                let reason = chunk
                    .failure()
                    .map(|f| f.kind.as_str())
                    .unwrap_or("unknown");
                out.push_str(
                    &output
                        .failed_chunk_placeholder
                        .replace("{index}", &chunk.index().to_string())
                        .replace("{reason}", reason),
                );
                if output.include_source_on_failure {
                    out.push_str(chunk.source());
                }
            }
            ChunkStatus::Pending | ChunkStatus::InProgress => {}
        }
    }
    out
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

/// Removes the job from the active registry when its run ends, however it ends.
struct Registration {
    inner: Arc<Inner>,
    handle: JobHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active
            .get(self.handle.id())
            .is_some_and(|h| h.same_as(&self.handle))
        {
            active.remove(self.handle.id());
        }
    }
}

/// What the run loop knows about a worker task even if it never returns.
struct TaskChunk {
    index: usize,
    /// Client calls made so far, updated as the task runs.
    spent: Arc<AtomicU32>,
}

struct WorkerResult {
    index: usize,
    result: Result<String, RecoveryError>,
    stats: RecoveryStats,
}

#[derive(Clone)]
struct Worker {
    client: Arc<dyn TranslateClient>,
    policy: Arc<RecoveryPolicy>,
    throttle: Option<Arc<Throttle>>,
    semaphore: Arc<Semaphore>,
    cancel: tokio_util::sync::CancellationToken,
    source_lang: Arc<str>,
    target_lang: Arc<str>,
    started: mpsc::UnboundedSender<usize>,
}

impl Worker {
    async fn translate(self, index: usize, text: String, spent: Arc<AtomicU32>) -> WorkerResult {
        let interrupted = WorkerResult {
            index,
            result: Err(RecoveryError::Cancelled),
            stats: RecoveryStats::default(),
        };

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return interrupted,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return interrupted,
            },
        };
        let _ = self.started.send(index);

        let splitter = RetrySplitter::new(
            self.client.as_ref(),
            &self.policy,
            &self.cancel,
            &self.source_lang,
            &self.target_lang,
        )
        .with_throttle(self.throttle.as_deref())
        .with_call_counter(&spent);
        let (result, stats) = splitter.recover_chunk(&text).await;

        WorkerResult {
            index,
            result,
            stats,
        }
    }
}
