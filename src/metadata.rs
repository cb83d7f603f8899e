//! Persisted projection of a job, consulted at start time to decide which
//! chunks a resumed run may skip.

use crate::job::{ChunkFailure, ChunkStatus, FailureKind, Job, JobStatus};
use crate::util::format_rfc3339;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub job_id: String,
    pub config_fingerprint: String,
    pub total_chunks: usize,
    pub status: JobStatus,
    pub created_at: String,
    pub updated_at: String,
    pub chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub index: usize,
    pub status: ChunkStatus,
    pub has_translated_text: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Metadata {
    /// Snapshot of `job` as it stands, reported under `status`.
    pub fn from_job(job: &Job, status: JobStatus) -> Self {
        let chunks = job
            .chunks()
            .iter()
            .map(|c| ChunkRecord {
                index: c.index(),
                status: c.status(),
                has_translated_text: c.translated().is_some(),
                attempts: c.attempts(),
                failure: c.failure().map(|f| f.kind),
                error: c.failure().map(|f| f.message.clone()),
            })
            .collect();
        Self {
            job_id: job.id().to_string(),
            config_fingerprint: job.fingerprint().to_string(),
            total_chunks: job.len(),
            status,
            created_at: format_rfc3339(job.created_at()),
            updated_at: format_rfc3339(job.updated_at()),
            chunks,
        }
    }

    /// Whether this snapshot describes the same plan under the same settings.
    pub fn matches(&self, fingerprint: &str, total_chunks: usize) -> bool {
        self.config_fingerprint == fingerprint && self.total_chunks == total_chunks
    }

    pub fn record(&self, index: usize) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|r| r.index == index)
    }

    pub fn count(&self, status: ChunkStatus) -> usize {
        self.chunks.iter().filter(|r| r.status == status).count()
    }
}

impl ChunkRecord {
    pub fn failure_detail(&self) -> Option<ChunkFailure> {
        self.failure.map(|kind| ChunkFailure {
            kind,
            message: self.error.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// `Ok(None)` when nothing usable is stored for `key`.
    async fn load(&self, key: &str) -> Result<Option<Metadata>>;
    async fn save(&self, key: &str, meta: &Metadata) -> Result<()>;
}

/// One pretty-printed JSON file per job key: `<dir>/<key><suffix>`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
    suffix: String,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{}", self.suffix))
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<Metadata>> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading metadata: {}", path.display()));
            }
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!("ignoring unreadable metadata {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, meta: &Metadata) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create_dir_all {}", self.dir.display()))?;
        let path = self.path_for(key);
        let raw = serde_json::to_string_pretty(meta)?;
        write_atomic(&path, raw.as_bytes()).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// In-process store; also counts saves so callers can observe persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshots: HashMap<String, Metadata>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).saves
    }

    pub fn get(&self, key: &str) -> Option<Metadata> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Metadata>> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, meta: &Metadata) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.saves += 1;
        inner.snapshots.insert(key.to_string(), meta.clone());
        Ok(())
    }
}
