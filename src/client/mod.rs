pub mod openai;
pub mod types;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use openai::OpenAiClient;

/// One translation call. `text` is either a whole chunk or a sub-split of one.
#[derive(Debug, Clone, Copy)]
pub struct TranslateRequest<'a> {
    pub text: &'a str,
    pub source_lang: &'a str,
    pub target_lang: &'a str,
    pub timeout: Duration,
}

/// Error contract of a remote translation call.
#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    /// Rate limit, server error or dropped connection; worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// The provider refused the content; a smaller piece may pass.
    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    #[error("call exceeded {0:?}")]
    Timeout(Duration),

    /// Authentication or malformed request; retrying cannot help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait TranslateClient: Send + Sync {
    async fn translate(&self, req: &TranslateRequest<'_>) -> Result<String, TranslateError>;
}
