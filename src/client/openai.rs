use super::{TranslateClient, TranslateError, TranslateRequest, types::*};
use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
    top_p: f32,
    system_prompt: String,
}

impl OpenAiClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let api_key = std::env::var(&cfg.api.api_key_env)
            .map_err(|_| anyhow!("missing API key: set {}", cfg.api.api_key_env))?;
        let http = reqwest::Client::builder()
            .build()
            .with_context(|| "building HTTP client")?;
        Ok(Self {
            http,
            endpoint: cfg.api.endpoint.clone(),
            model: cfg.api.model.clone(),
            api_key,
            temperature: cfg.api.temperature,
            top_p: cfg.api.top_p,
            system_prompt: cfg.api.system_prompt.clone(),
        })
    }

    fn system_message(&self, req: &TranslateRequest<'_>) -> String {
        self.system_prompt
            .replace("{source}", req.source_lang)
            .replace("{target}", req.target_lang)
    }
}

#[async_trait]
impl TranslateClient for OpenAiClient {
    async fn translate(&self, req: &TranslateRequest<'_>) -> Result<String, TranslateError> {
        let system = self.system_message(req);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: req.text,
                },
            ],
            temperature: self.temperature,
            top_p: self.top_p,
            stream: false,
        };

        debug!("chat request model={} chars={}", self.model, req.text.len());

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(req.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, req))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| transport_error(e, req))?;
        extract_translation(parsed)
    }
}

fn transport_error(err: reqwest::Error, req: &TranslateRequest<'_>) -> TranslateError {
    if err.is_timeout() {
        TranslateError::Timeout(req.timeout)
    } else {
        TranslateError::Transient(err.to_string())
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> TranslateError {
    let detail = serde_json::from_str::<ApiErrorBody>(body).ok().map(|b| b.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), crate::util::preview(body, 200)));

    let flagged = detail.as_ref().is_some_and(|d| {
        [d.code.as_deref(), d.kind.as_deref()]
            .into_iter()
            .flatten()
            .any(|c| c.contains("content_policy") || c.contains("content_filter"))
    });
    if flagged {
        return TranslateError::ContentPolicy(message);
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::CONFLICT => TranslateError::Transient(message),
        s if s.is_server_error() => TranslateError::Transient(message),
        _ => {
            warn!("non-retryable API status {}", status.as_u16());
            TranslateError::Rejected(message)
        }
    }
}

pub(crate) fn extract_translation(resp: ChatResponse) -> Result<String, TranslateError> {
    let Some(choice) = resp.choices.into_iter().next() else {
        return Err(TranslateError::Transient("response has no choices".into()));
    };

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(TranslateError::ContentPolicy(
            "completion stopped by content filter".into(),
        ));
    }

    let content = choice
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(TranslateError::ContentPolicy(
            "empty completion for non-empty input".into(),
        ));
    }
    Ok(content)
}
