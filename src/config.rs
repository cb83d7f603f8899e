use crate::error::JobError;
use crate::util::sha256_hex;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub chunking: Chunking,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub splitting: Splitting,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub postprocess: Postprocess,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// Rejects settings that would make a job meaningless before anything is
    /// dispatched.
    pub fn validate(&self) -> std::result::Result<(), JobError> {
        let bad = |msg: String| Err(JobError::Configuration(msg));

        if self.chunking.max_chunk_size == 0 {
            return bad("chunking.max_chunk_size must be > 0".into());
        }
        if self.global.max_workers == 0 {
            return bad("global.max_workers must be > 0".into());
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return bad(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            ));
        }
        if self.validation.enabled
            && self.validation.min_length_ratio > self.validation.max_length_ratio
        {
            return bad(format!(
                "validation.min_length_ratio ({}) exceeds validation.max_length_ratio ({})",
                self.validation.min_length_ratio, self.validation.max_length_ratio
            ));
        }
        if self.api.target_lang.trim().is_empty() {
            return bad("api.target_lang must not be empty".into());
        }
        Ok(())
    }

    /// A stable, normalization-friendly string for hashing. Only settings that
    /// change chunk boundaries or translation output take part; secrets never do.
    pub fn normalized_for_hash(&self) -> String {
        let view = FingerprintView {
            max_chunk_size: self.chunking.max_chunk_size,
            model: &self.api.model,
            temperature: self.api.temperature,
            top_p: self.api.top_p,
            source_lang: &self.api.source_lang,
            target_lang: &self.api.target_lang,
        };
        toml::to_string(&view).unwrap_or_default()
    }

    pub fn fingerprint(&self) -> String {
        sha256_hex(self.normalized_for_hash().as_bytes())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_seconds.max(1))
    }
}

#[derive(Serialize)]
struct FingerprintView<'a> {
    max_chunk_size: usize,
    model: &'a str,
    temperature: f32,
    top_p: f32,
    source_lang: &'a str,
    target_lang: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    pub resume: bool,
    pub max_workers: usize,
    pub cancel_grace_ms: u64,
    pub print_summary: bool,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            resume: true,
            max_workers: 4,
            cancel_grace_ms: 250,
            print_summary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub out_dir: String,
    pub metadata_suffix: String,
    pub journal_suffix: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            out_dir: "out".into(),
            metadata_suffix: "_metadata.json".into(),
            journal_suffix: "_chunked.txt".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunking {
    pub max_chunk_size: usize,
}
impl Default for Chunking {
    fn default() -> Self {
        Self {
            max_chunk_size: 6000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retry {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub count_timeout_as_transient: bool,
}
impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            count_timeout_as_transient: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Splitting {
    pub enabled: bool,
    pub max_split_attempts: u32,
    pub min_chunk_size: usize,
}
impl Default for Splitting {
    fn default() -> Self {
        Self {
            enabled: true,
            max_split_attempts: 3,
            min_chunk_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub enabled: bool,
    pub min_length_ratio: f32,
    pub max_length_ratio: f32,
}
impl Default for Validation {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length_ratio: 0.15,
            max_length_ratio: 2.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub requests_per_minute: u32,
    pub source_lang: String,
    pub target_lang: String,
    pub system_prompt: String,
}
impl Default for Api {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            timeout_seconds: 300,
            temperature: 0.7,
            top_p: 0.9,
            requests_per_minute: 60,
            source_lang: "auto".into(),
            target_lang: "en".into(),
            system_prompt: "Translate the user's text from {source} to {target}. \
                            Preserve paragraph breaks. Output only the translation."
                .into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub translated_suffix: String,
    pub failed_chunk_placeholder: String,
    pub include_source_on_failure: bool,
    pub write_report_json: bool,
    pub report_suffix: String,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            translated_suffix: "_translated.txt".into(),
            failed_chunk_placeholder: "[translation failed for chunk {index}: {reason}]\n".into(),
            include_source_on_failure: false,
            write_report_json: true,
            report_suffix: "_report.json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Postprocess {
    pub enabled: bool,
    pub normalize_newlines: bool,
    pub normalize_unicode: bool,
    pub strip_control_chars: bool,
    pub trim_trailing_whitespace: bool,
    pub remove_by_regex: bool,
    #[serde(default)]
    pub regex: PostprocessRegex,
}
impl Default for Postprocess {
    fn default() -> Self {
        Self {
            enabled: true,
            normalize_newlines: true,
            normalize_unicode: true,
            strip_control_chars: true,
            trim_trailing_whitespace: true,
            remove_by_regex: true,
            regex: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostprocessRegex {
    pub patterns: Vec<String>,
}
impl Default for PostprocessRegex {
    fn default() -> Self {
        Self {
            patterns: vec![
                "^```[a-zA-Z]*$".into(),
                "^(?i)(here is|here's) the translat(ion|ed text)[^\\n]*:$".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
