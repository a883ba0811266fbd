//! OpenAI-compatible model client.
//!
//! One client type serves the three model-backed concerns: speech
//! transcription (`/audio/transcriptions`), vision (`/chat/completions`
//! with an image part) and intent classification (`/chat/completions`
//! in JSON mode). Any server speaking the same wire format works by
//! pointing `base_url` at it.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (other) → fail immediately
//! - Network errors → retry
//!
//! Delays grow exponentially from the backoff base (1s, 2s, 4s, ...).
//! Exhausted retries surface as [`LlmError::Unavailable`], which callers
//! classify as transient.

use std::time::Duration;

use base64::Engine;
use reqwest::multipart;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::ExtractError;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Network failure, 429 or 5xx after all retries.
    #[error("model backend unavailable: {0}")]
    Unavailable(String),
    /// Non-retryable 4xx.
    #[error("model backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("model backend misconfigured: {0}")]
    Config(String),
}

impl From<LlmError> for ExtractError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(m) => ExtractError::ServiceUnavailable(m),
            LlmError::Config(m) => ExtractError::ServiceUnavailable(m),
            other => ExtractError::Unsupported(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff_base: Duration,
}

impl LlmClient {
    /// Build a client from a backend section, reading the API key from
    /// the environment variable the section names.
    pub fn from_config(config: &BackendConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            LlmError::Config(format!("{} environment variable not set", config.api_key_env))
        })?;
        Self::with_api_key(config, Some(api_key))
    }

    pub fn with_api_key(config: &BackendConfig, api_key: Option<String>) -> Result<Self, LlmError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| LlmError::Config("model required".to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Override the first retry delay.
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Chat completion in JSON mode. Returns the parsed JSON object the model produced.
    pub async fn chat_json(&self, system: &str, user: &str) -> Result<Value, LlmError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let content = self.chat(&body).await?;
        serde_json::from_str(&content)
            .map_err(|e| LlmError::InvalidResponse(format!("content is not JSON: {}", e)))
    }

    /// Vision completion over a single image. Returns the model's text.
    pub async fn describe_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime: &str,
    ) -> Result<String, LlmError> {
        let data_url = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
        });
        self.chat(&body).await
    }

    /// Speech-to-text over an audio file.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        filename: &str,
        mime: &str,
    ) -> Result<String, LlmError> {
        let url = format!("{}/audio/transcriptions", self.base_url);
        let response = self
            .send_with_retry(|| {
                let part = multipart::Part::bytes(audio.to_vec())
                    .file_name(filename.to_string())
                    .mime_str(mime)
                    .map_err(|e| LlmError::Config(format!("invalid mime '{}': {}", mime, e)))?;
                let form = multipart::Form::new()
                    .text("model", self.model.clone())
                    .part("file", part);
                Ok(self.authorized(self.http.post(&url)).multipart(form))
            })
            .await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        json.get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| LlmError::InvalidResponse("missing text field".to_string()))
    }

    async fn chat(&self, body: &Value) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .send_with_retry(|| Ok(self.authorized(self.http.post(&url)).json(body)))
            .await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".to_string()))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, LlmError>
    where
        F: Fn() -> Result<reqwest::RequestBuilder, LlmError>,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying model request");
                tokio::time::sleep(delay).await;
            }

            match build()?.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(LlmError::Unavailable(format!("{}: {}", status, body_text)));
                        continue;
                    }

                    return Err(LlmError::Rejected {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
                Err(e) => {
                    last_err = Some(LlmError::Unavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::Unavailable("request failed after retries".to_string())))
    }
}
