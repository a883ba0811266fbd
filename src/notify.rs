//! Outcome notifications.
//!
//! One [`Event`] per terminal outcome, fanned out to every configured sink:
//!
//! - an [`EventBuffer`] holding the last N events in memory
//! - a JSON-lines file (`notify.events_path`)
//! - a webhook (`notify.webhook_url`), signed with
//!   `X-Signature-256: sha256=<hex hmac>` when a secret is configured
//!
//! Sink failures are logged and swallowed: a capture never fails because
//! its notification could not be delivered.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::NotifyConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature-256";

/// Structured description of one terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_type: String,
    pub status: String,
    pub message_id: String,
    pub content_type: String,
    pub pipeline: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub source_metadata: serde_json::Value,
    pub output_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    pub timestamp: String,
}

/// Bounded in-memory ring of recent events. Oldest are evicted first.
pub struct EventBuffer {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            while events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Webhook {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

pub struct Notifier {
    buffer: Arc<EventBuffer>,
    events_path: Option<PathBuf>,
    webhook: Option<Webhook>,
}

impl Notifier {
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        let secret = match &config.webhook_secret_env {
            Some(var) => Some(std::env::var(var).with_context(|| format!("{} environment variable not set", var))?),
            None => None,
        };
        let webhook = match &config.webhook_url {
            Some(url) => Some(Webhook {
                client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
                url: url.clone(),
                secret,
            }),
            None => None,
        };
        Ok(Self {
            buffer: Arc::new(EventBuffer::new(config.buffer_size)),
            events_path: config.events_path.clone(),
            webhook,
        })
    }

    pub fn buffer(&self) -> Arc<EventBuffer> {
        self.buffer.clone()
    }

    pub async fn emit(&self, event: Event) {
        if let Some(path) = &self.events_path {
            if let Err(e) = append_jsonl(path, &event).await {
                warn!(path = %path.display(), error = %e, "failed to append event");
            }
        }
        if let Some(webhook) = &self.webhook {
            if let Err(e) = post_webhook(webhook, &event).await {
                warn!(url = %webhook.url, error = %e, "webhook delivery failed");
            }
        }
        debug!(message_id = %event.message_id, status = %event.status, "event emitted");
        self.buffer.push(event);
    }
}

async fn append_jsonl(path: &PathBuf, event: &Event) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// `sha256=<hex>` HMAC of the request body.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("hmac key: {}", e))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

async fn post_webhook(webhook: &Webhook, event: &Event) -> Result<()> {
    let body = serde_json::to_vec(event)?;
    let mut request = webhook
        .client
        .post(&webhook.url)
        .header(reqwest::header::CONTENT_TYPE, "application/json");
    if let Some(secret) = &webhook.secret {
        request = request.header(SIGNATURE_HEADER, sign(secret, &body)?);
    }
    let response = request.body(body).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("webhook returned {}", response.status());
    }
    Ok(())
}
