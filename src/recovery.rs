//! Recovery of a single chunk translation: exponential backoff for transient
//! failures, recursive halving for content-policy rejections.
//!
//! Splitting is private to one call of [`RetrySplitter::translate_with_recovery`]:
//! the pieces never become chunks of the job, they only produce the text of the
//! chunk they came from.

use crate::chunk_plan::split_halves;
use crate::client::{TranslateClient, TranslateError, TranslateRequest};
use crate::config::Config;
use crate::job::FailureKind;
use crate::throttle::Throttle;
use crate::util::{char_len, preview};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub split_enabled: bool,
    pub max_split_attempts: u32,
    pub min_chunk_size: usize,
    pub call_timeout: Duration,
    pub count_timeout_as_transient: bool,
    /// Accepted `translated / source` length ratio, when validation is on.
    pub length_ratio: Option<(f32, f32)>,
}

impl RecoveryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.retry.max_retries,
            initial_backoff: Duration::from_millis(cfg.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.retry.max_backoff_ms),
            split_enabled: cfg.splitting.enabled,
            max_split_attempts: cfg.splitting.max_split_attempts,
            min_chunk_size: cfg.splitting.min_chunk_size,
            call_timeout: cfg.call_timeout(),
            count_timeout_as_transient: cfg.retry.count_timeout_as_transient,
            length_ratio: cfg
                .validation
                .enabled
                .then_some((cfg.validation.min_length_ratio, cfg.validation.max_length_ratio)),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("{kind} failure: {message}")]
    Terminal { kind: FailureKind, message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Translated text of one chunk plus what it took to get it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovered {
    pub text: String,
    pub stats: RecoveryStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Calls made to the client, retries and split pieces included.
    pub calls: u32,
    /// Pieces whose result was final (not split further).
    pub leaves: u32,
    pub splits: u32,
    pub max_depth: u32,
}

enum AttemptError {
    /// Content the provider would not take as-is; splitting may help.
    Splittable { kind: FailureKind, message: String },
    Terminal { kind: FailureKind, message: String },
    Cancelled,
}

type RecoverFuture<'s> = Pin<Box<dyn Future<Output = Result<String, RecoveryError>> + Send + 's>>;

pub struct RetrySplitter<'a> {
    client: &'a dyn TranslateClient,
    policy: &'a RecoveryPolicy,
    throttle: Option<&'a Throttle>,
    spent: Option<&'a AtomicU32>,
    cancel: &'a CancellationToken,
    source_lang: &'a str,
    target_lang: &'a str,
}

impl<'a> RetrySplitter<'a> {
    pub fn new(
        client: &'a dyn TranslateClient,
        policy: &'a RecoveryPolicy,
        cancel: &'a CancellationToken,
        source_lang: &'a str,
        target_lang: &'a str,
    ) -> Self {
        Self {
            client,
            policy,
            throttle: None,
            spent: None,
            cancel,
            source_lang,
            target_lang,
        }
    }

    pub fn with_throttle(mut self, throttle: Option<&'a Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Also counts every client call into `spent` as it is made, so the
    /// count outlives a future that is dropped mid-flight.
    pub fn with_call_counter(mut self, spent: &'a AtomicU32) -> Self {
        self.spent = Some(spent);
        self
    }

    pub async fn translate_with_recovery(&self, text: &str) -> Result<Recovered, RecoveryError> {
        let (result, stats) = self.recover_chunk(text).await;
        result.map(|text| Recovered { text, stats })
    }

    /// Like [`Self::translate_with_recovery`], but the stats survive a failure
    /// so callers can account for the calls that were spent.
    pub async fn recover_chunk(&self, text: &str) -> (Result<String, RecoveryError>, RecoveryStats) {
        let mut stats = RecoveryStats::default();
        let result = self.recover(text, 0, &mut stats).await;
        (result, stats)
    }

    fn recover<'s>(
        &'s self,
        text: &'s str,
        depth: u32,
        stats: &'s mut RecoveryStats,
    ) -> RecoverFuture<'s> {
        Box::pin(async move {
            let (kind, message) = match self.attempt(text, stats).await {
                Ok(out) => {
                    stats.leaves += 1;
                    return Ok(out);
                }
                Err(AttemptError::Cancelled) => return Err(RecoveryError::Cancelled),
                Err(AttemptError::Terminal { kind, message }) => {
                    stats.leaves += 1;
                    return Err(RecoveryError::Terminal { kind, message });
                }
                Err(AttemptError::Splittable { kind, message }) => (kind, message),
            };

            let chars = char_len(text);
            let exhausted = !self.policy.split_enabled
                || chars <= self.policy.min_chunk_size
                || depth >= self.policy.max_split_attempts;
            let halves = if exhausted { None } else { split_halves(text) };
            let Some((left_src, right_src)) = halves else {
                stats.leaves += 1;
                warn!(depth, chars, "{kind} rejection is final: {message}");
                return Err(RecoveryError::Terminal { kind, message });
            };

            stats.splits += 1;
            stats.max_depth = stats.max_depth.max(depth + 1);
            info!(
                depth = depth + 1,
                chars,
                left = char_len(left_src),
                right = char_len(right_src),
                "{kind} rejection, splitting: {}",
                preview(text, 60)
            );

            // Both halves are attempted even if the first one fails for good.
            let left = self.recover(left_src, depth + 1, stats).await;
            if matches!(left, Err(RecoveryError::Cancelled)) {
                return Err(RecoveryError::Cancelled);
            }
            let right = self.recover(right_src, depth + 1, stats).await;

            match (left, right) {
                (_, Err(RecoveryError::Cancelled)) => Err(RecoveryError::Cancelled),
                (Ok(l), Ok(r)) => Ok(join_halves(left_src, l, r)),
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        })
    }

    /// One piece of text against the client, with transient retries.
    async fn attempt(&self, text: &str, stats: &mut RecoveryStats) -> Result<String, AttemptError> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }

        let mut backoff = self.policy.initial_backoff;
        let mut retries = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            if let Some(throttle) = self.throttle {
                if !throttle.acquire(self.cancel).await {
                    return Err(AttemptError::Cancelled);
                }
            }

            stats.calls += 1;
            if let Some(spent) = self.spent {
                spent.fetch_add(1, Ordering::Relaxed);
            }
            let req = TranslateRequest {
                text,
                source_lang: self.source_lang,
                target_lang: self.target_lang,
                timeout: self.policy.call_timeout,
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                r = tokio::time::timeout(self.policy.call_timeout, self.client.translate(&req)) => r,
            };
            let result = result.unwrap_or(Err(TranslateError::Timeout(self.policy.call_timeout)));

            let (kind, message) = match result {
                Ok(out) => return self.check_length(text, out),
                Err(TranslateError::ContentPolicy(message)) => {
                    return Err(AttemptError::Splittable {
                        kind: FailureKind::ContentPolicy,
                        message,
                    });
                }
                Err(TranslateError::Rejected(message)) => {
                    return Err(AttemptError::Terminal {
                        kind: FailureKind::Rejected,
                        message,
                    });
                }
                Err(e @ TranslateError::Timeout(_)) if !self.policy.count_timeout_as_transient => {
                    return Err(AttemptError::Terminal {
                        kind: FailureKind::Timeout,
                        message: e.to_string(),
                    });
                }
                Err(e @ TranslateError::Timeout(_)) => (FailureKind::Timeout, e.to_string()),
                Err(TranslateError::Transient(message)) => (FailureKind::Transient, message),
            };

            if retries >= self.policy.max_retries {
                warn!(retries, "giving up after {kind} errors: {message}");
                return Err(AttemptError::Terminal { kind, message });
            }

            retries += 1;
            debug!(
                attempt = retries,
                backoff_ms = backoff.as_millis() as u64,
                "{kind} error, retrying: {message}"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
    }

    fn check_length(&self, source: &str, translated: String) -> Result<String, AttemptError> {
        let Some((min, max)) = self.policy.length_ratio else {
            return Ok(translated);
        };
        let src = char_len(source.trim());
        let out = char_len(translated.trim());
        if src == 0 {
            return Ok(translated);
        }
        if out == 0 {
            return Err(AttemptError::Splittable {
                kind: FailureKind::ContentPolicy,
                message: "empty translation for non-empty input".into(),
            });
        }
        let ratio = out as f32 / src as f32;
        if ratio < min || ratio > max {
            return Err(AttemptError::Splittable {
                kind: FailureKind::InvalidLength,
                message: format!("length ratio {ratio:.2} outside [{min}, {max}] ({src} -> {out} chars)"),
            });
        }
        Ok(translated)
    }
}

/// Glues two translated halves back together, restoring the whitespace that
/// separated the source halves when the client trimmed it away.
fn join_halves(left_src: &str, mut left: String, right: String) -> String {
    let src_tail = &left_src[left_src.trim_end().len()..];
    if !src_tail.is_empty() && !left.ends_with(char::is_whitespace) && !right.starts_with(char::is_whitespace) {
        left.push_str(src_tail);
    }
    left.push_str(&right);
    left
}
