#![allow(dead_code)]

use async_trait::async_trait;
use batch_translate::client::{TranslateClient, TranslateError, TranslateRequest};
use batch_translate::config::Config;
use batch_translate::journal::MemoryJournal;
use batch_translate::metadata::MemoryStore;
use batch_translate::orchestrator::{Callbacks, JobOrchestrator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Reply = Box<dyn Fn(&str) -> Result<String, TranslateError> + Send + Sync>;
type Delay = Box<dyn Fn(&str) -> Duration + Send + Sync>;

/// Test client driven by closures: one decides the reply for a text, the other
/// how long the call takes.
pub struct ScriptClient {
    reply: Reply,
    delay: Option<Delay>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptClient {
    pub fn new(reply: impl Fn(&str) -> Result<String, TranslateError> + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn uppercase() -> Self {
        Self::new(|text| Ok(text.to_uppercase()))
    }

    pub fn with_delay(mut self, delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TranslateClient for ScriptClient {
    async fn translate(&self, req: &TranslateRequest<'_>) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req.text.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(req.text)).await;
        }
        (self.reply)(req.text)
    }
}

/// Defaults with pacing off and millisecond backoff.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.api.requests_per_minute = 0;
    cfg.retry.initial_backoff_ms = 1;
    cfg.retry.max_backoff_ms = 4;
    cfg.global.max_workers = 4;
    cfg
}

pub struct Harness {
    pub orchestrator: JobOrchestrator,
    pub client: Arc<ScriptClient>,
    pub store: Arc<MemoryStore>,
    pub journal: Arc<MemoryJournal>,
}

pub fn harness(cfg: Config, client: ScriptClient) -> Harness {
    harness_with(cfg, client, Arc::new(MemoryStore::new()), Arc::new(MemoryJournal::new()), Callbacks::default())
}

pub fn harness_with(
    cfg: Config,
    client: ScriptClient,
    store: Arc<MemoryStore>,
    journal: Arc<MemoryJournal>,
    callbacks: Callbacks,
) -> Harness {
    let client = Arc::new(client);
    let orchestrator = JobOrchestrator::new(cfg, client.clone(), store.clone(), journal.clone())
        .with_callbacks(callbacks);
    Harness {
        orchestrator,
        client,
        store,
        journal,
    }
}

/// `n` lines of the form `line 0\n`, each its own chunk at `max_chunk_size = 8`.
pub fn numbered_lines(n: usize) -> String {
    (0..n).map(|i| format!("line {i}\n")).collect()
}
