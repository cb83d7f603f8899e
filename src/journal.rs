//! Append-only record of translated chunk text.
//!
//! Each record is framed as
//!
//! ```text
//! ##CHUNK_INDEX: 3##
//! <translated text>
//! ##END_CHUNK##
//!
//! ```
//!
//! A record whose end marker never made it to disk is ignored on load, whether
//! it sits at the tail or was followed by later appends. When an index appears
//! more than once the last complete record wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const START_PREFIX: &str = "##CHUNK_INDEX: ";
const START_SUFFIX: &str = "##\n";
const END_MARKER: &str = "\n##END_CHUNK##\n";

#[async_trait]
pub trait ChunkJournal: Send + Sync {
    async fn load(&self, key: &str) -> Result<BTreeMap<usize, String>>;
    async fn append(&self, key: &str, index: usize, text: &str) -> Result<()>;
    /// Replaces the journal for `key` with exactly `records`.
    async fn rewrite(&self, key: &str, records: &BTreeMap<usize, String>) -> Result<()>;
    /// Drops every record for `key`; used when a run starts over.
    async fn reset(&self, key: &str) -> Result<()>;
}

pub fn encode_record(index: usize, text: &str) -> String {
    format!("{START_PREFIX}{index}{START_SUFFIX}{text}{END_MARKER}\n")
}

pub fn parse_records(raw: &str) -> BTreeMap<usize, String> {
    let mut out = BTreeMap::new();
    let mut rest = raw;

    while let Some(start) = rest.find(START_PREFIX) {
        let after_prefix = &rest[start + START_PREFIX.len()..];
        let Some(idx_end) = after_prefix.find(START_SUFFIX) else {
            break;
        };
        let Ok(index) = after_prefix[..idx_end].trim().parse::<usize>() else {
            warn!("skipping journal record with bad index: {:?}", &after_prefix[..idx_end]);
            rest = after_prefix;
            continue;
        };
        let body = &after_prefix[idx_end + START_SUFFIX.len()..];
        let body_end = body.find(END_MARKER);
        let restart = body
            .find(START_PREFIX)
            .filter(|&next| body_end.is_none_or(|end| next < end));
        if let Some(next) = restart {
            // Torn write that later appends landed after.
            warn!(chunk = index, "skipping torn journal record");
            rest = &body[next..];
            continue;
        }
        let Some(body_end) = body_end else {
            // Torn write at the tail.
            break;
        };
        out.insert(index, body[..body_end].to_string());
        rest = &body[body_end + END_MARKER.len()..];
    }

    out
}

/// `<dir>/<key><suffix>` on disk.
#[derive(Debug, Clone)]
pub struct FileJournal {
    dir: PathBuf,
    suffix: String,
}

impl FileJournal {
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
impl ChunkJournal for FileJournal {
    async fn load(&self, key: &str) -> Result<BTreeMap<usize, String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(parse_records(&raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("reading journal: {}", path.display())),
        }
    }

    async fn append(&self, key: &str, index: usize, text: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create_dir_all {}", self.dir.display()))?;
        let path = self.path_for(key);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening journal: {}", path.display()))?;
        file.write_all(encode_record(index, text).as_bytes())
            .await
            .with_context(|| format!("appending to journal: {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }

    async fn rewrite(&self, key: &str, records: &BTreeMap<usize, String>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create_dir_all {}", self.dir.display()))?;
        let path = self.path_for(key);
        let raw: String = records
            .iter()
            .map(|(&index, text)| encode_record(index, text))
            .collect();
        let tmp = self.dir.join(format!("{key}{}.tmp", self.suffix));
        tokio::fs::write(&tmp, raw.as_bytes())
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing journal: {}", path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<HashMap<String, BTreeMap<usize, String>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes one record, as if it had never been written.
    pub fn forget(&self, key: &str, index: usize) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(m) = records.get_mut(key) {
            m.remove(&index);
        }
    }
}

#[async_trait]
impl ChunkJournal for MemoryJournal {
    async fn load(&self, key: &str) -> Result<BTreeMap<usize, String>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned().unwrap_or_default())
    }

    async fn append(&self, key: &str, index: usize, text: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(key.to_string())
            .or_default()
            .insert(index, text.to_string());
        Ok(())
    }

    async fn rewrite(&self, key: &str, records: &BTreeMap<usize, String>) -> Result<()> {
        let mut all = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        all.insert(key.to_string(), records.clone());
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(key);
        Ok(())
    }
}
