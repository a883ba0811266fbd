//! Source adapters: where messages come from.
//!
//! A [`SourceAdapter`] polls a remote message API from a persisted cursor
//! and resolves the binary payloads it referenced. Two implementations:
//!
//! - [`TelegramSource`]: Bot API long polling (`getUpdates` with
//!   `offset`/`timeout`), payload download through `getFile`.
//! - [`LocalPayloads`]: direct injection from files, directories or
//!   stdin. Never yields anything on `poll`.
//!
//! [`poll_and_register`] is the only place cursors move: each polled item
//! is registered and its cursor written in one transaction, so a crash
//! can re-deliver an item (absorbed by idempotent registration) but never
//! lose one. A malformed item is registered as a placeholder and failed
//! permanently instead of aborting the batch.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, DirectConfig, SourceConfig};
use crate::error::ExtractError;
use crate::extract::url::is_single_url;
use crate::extract::{effective_mime, LocalResolver, PayloadResolver};
use crate::models::{ContentType, ErrorClass, Message, Payload};
use crate::state::StateStore;

/// Text files up to this size are injected as text messages, not documents.
const MAX_INLINE_TEXT_BYTES: u64 = 1024 * 1024;

/// One polled entry and the cursor that acknowledges it.
#[derive(Debug, Clone)]
pub struct PolledItem {
    pub cursor: String,
    pub entry: PolledEntry,
}

#[derive(Debug, Clone)]
pub enum PolledEntry {
    Message(Message),
    /// Unparseable item, kept as a placeholder so it is visible in `status`.
    Malformed { placeholder: Message, reason: String },
    /// Nothing to capture (edits, service messages); only the cursor moves.
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct PollBatch {
    pub items: Vec<PolledItem>,
}

#[async_trait]
pub trait SourceAdapter: PayloadResolver {
    /// Label stored on messages and used as the checkpoint key.
    fn name(&self) -> &str;

    /// This adapter as a plain payload resolver for the extractors.
    fn resolver(&self) -> &dyn PayloadResolver;

    /// Fetch items after `cursor`. Per-item problems never fail the batch.
    async fn poll(&self, cursor: Option<&str>) -> Result<PollBatch>;
}

/// Counters from one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub registered: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub skipped: usize,
}

/// Poll once and durably register every item, advancing the cursor per item.
pub async fn poll_and_register(source: &dyn SourceAdapter, state: &StateStore) -> Result<PollSummary> {
    let cursor = state.cursor(source.name()).await?;
    let batch = source.poll(cursor.as_deref()).await?;
    let mut summary = PollSummary {
        polled: batch.items.len(),
        ..Default::default()
    };

    for item in &batch.items {
        let cursor = Some((source.name(), item.cursor.as_str()));
        match &item.entry {
            PolledEntry::Message(message) => {
                let reg = state.register_with_cursor(message, cursor).await?;
                if reg.is_new {
                    summary.registered += 1;
                    debug!(message_id = %message.id, content_type = %message.content_type, "registered");
                } else {
                    summary.duplicates += 1;
                }
            }
            PolledEntry::Malformed { placeholder, reason } => {
                let error = format!("malformed source item: {}", reason);
                let reg = state
                    .register_failed(placeholder, ErrorClass::Permanent, &error, cursor)
                    .await?;
                if reg.is_new {
                    warn!(message_id = %placeholder.id, %reason, "malformed source item");
                    summary.malformed += 1;
                } else {
                    summary.duplicates += 1;
                }
            }
            PolledEntry::Skipped => {
                state.set_cursor(source.name(), &item.cursor).await?;
                summary.skipped += 1;
            }
        }
    }

    info!(
        source = source.name(),
        polled = summary.polled,
        registered = summary.registered,
        duplicates = summary.duplicates,
        malformed = summary.malformed,
        "poll complete"
    );
    Ok(summary)
}

/// The configured source adapter.
pub fn source_from_config(config: &Config) -> Result<Arc<dyn SourceAdapter>> {
    match config.source.provider.as_str() {
        "telegram" => Ok(Arc::new(TelegramSource::from_config(&config.source)?)),
        "none" => Ok(Arc::new(LocalPayloads)),
        other => bail!("Unknown source provider: '{}'", other),
    }
}

/// Content type for a text body: a lone URL (hints aside) is a URL capture.
pub fn classify_text(text: &str) -> ContentType {
    if is_single_url(&crate::hints::parse(text).residual_text) {
        ContentType::Url
    } else {
        ContentType::Text
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Telegram
// ═══════════════════════════════════════════════════════════════════════

pub struct TelegramSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
    poll_timeout_secs: u64,
    batch_limit: u32,
}

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    date: i64,
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    voice: Option<TgFile>,
    #[serde(default)]
    audio: Option<TgFile>,
    #[serde(default)]
    photo: Option<Vec<TgFile>>,
    #[serde(default)]
    document: Option<TgFile>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TgFilePath {
    file_path: String,
}

impl TelegramSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("{} environment variable not set", config.token_env))?;
        Self::new(config, token)
    }

    pub fn new(config: &SourceConfig, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 15))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            poll_timeout_secs: config.poll_timeout_secs,
            batch_limit: config.batch_limit,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Convert one raw update. `None` when there is no usable update id.
    fn convert(&self, raw: &serde_json::Value) -> Option<PolledItem> {
        let update_id = raw.get("update_id")?.as_i64()?;
        let cursor = (update_id + 1).to_string();

        let Some(message) = raw.get("message") else {
            return Some(PolledItem {
                cursor,
                entry: PolledEntry::Skipped,
            });
        };

        let entry = match serde_json::from_value::<TgMessage>(message.clone()) {
            Ok(msg) => match to_message(msg) {
                Ok(message) => PolledEntry::Message(message),
                Err((placeholder, reason)) => PolledEntry::Malformed { placeholder, reason },
            },
            Err(e) => PolledEntry::Malformed {
                placeholder: placeholder(&format!("telegram-update:{}", update_id), "unknown", Utc::now()),
                reason: e.to_string(),
            },
        };
        Some(PolledItem { cursor, entry })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, ExtractError> {
        let response = self
            .client
            .get(self.method_url(method))
            .query(query)
            .send()
            .await
            .map_err(|e| ExtractError::Payload(e.without_url().to_string()))?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ExtractError::Payload(format!("{} returned {}", method, status)));
        }
        let body: TgResponse<T> = response
            .json()
            .await
            .map_err(|e| ExtractError::Payload(e.without_url().to_string()))?;
        match (body.ok, body.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(ExtractError::Unsupported(format!(
                "{}: {}",
                method,
                body.description.unwrap_or_else(|| status.to_string())
            ))),
        }
    }
}

fn placeholder(id: &str, sender_id: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        source: "telegram".to_string(),
        sender_id: sender_id.to_string(),
        content_type: ContentType::Text,
        payload: Payload::Empty,
        caption: None,
        received_at: at,
    }
}

fn to_message(msg: TgMessage) -> std::result::Result<Message, (Message, String)> {
    let id = format!("{}:{}", msg.chat.id, msg.message_id);
    let sender_id = msg.from.as_ref().map(|u| u.id).unwrap_or(msg.chat.id).to_string();
    let received_at = Utc.timestamp_opt(msg.date, 0).single().unwrap_or_else(Utc::now);

    let remote = |file: TgFile, default_mime: Option<&str>| Payload::Remote {
        file_id: file.file_id,
        filename: file.file_name,
        mime: file.mime_type.or(default_mime.map(str::to_string)),
        size: file.file_size,
    };

    let (content_type, payload) = if let Some(voice) = msg.voice {
        (ContentType::Voice, remote(voice, Some("audio/ogg")))
    } else if let Some(audio) = msg.audio {
        (ContentType::Voice, remote(audio, None))
    } else if let Some(sizes) = msg.photo {
        // Telegram lists sizes ascending; the last is the original.
        match sizes.into_iter().last() {
            Some(largest) => (ContentType::Photo, remote(largest, Some("image/jpeg"))),
            None => return Err((placeholder(&id, &sender_id, received_at), "photo without sizes".to_string())),
        }
    } else if let Some(doc) = msg.document {
        let content_type = match doc.mime_type.as_deref() {
            Some(m) if m.starts_with("image/") => ContentType::Photo,
            Some(m) if m.starts_with("audio/") => ContentType::Voice,
            _ => ContentType::Document,
        };
        (content_type, remote(doc, None))
    } else if let Some(text) = msg.text {
        (classify_text(&text), Payload::Text { text })
    } else {
        return Err((
            placeholder(&id, &sender_id, received_at),
            "unsupported message kind".to_string(),
        ));
    };

    Ok(Message {
        id,
        source: "telegram".to_string(),
        sender_id,
        content_type,
        payload,
        caption: msg.caption,
        received_at,
    })
}

#[async_trait]
impl PayloadResolver for TelegramSource {
    async fn resolve(&self, payload: &Payload) -> std::result::Result<Vec<u8>, ExtractError> {
        let Payload::Remote { file_id, .. } = payload else {
            return LocalResolver.resolve(payload).await;
        };
        let file: TgFilePath = self
            .get_json("getFile", &[("file_id", file_id.clone())])
            .await?;
        let url = format!("{}/file/bot{}/{}", self.base_url, self.token, file.file_path);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExtractError::Payload(e.without_url().to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let err = format!("file download returned {}", status);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                ExtractError::Payload(err)
            } else {
                ExtractError::Unsupported(err)
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExtractError::Payload(e.without_url().to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SourceAdapter for TelegramSource {
    fn name(&self) -> &str {
        "telegram"
    }

    fn resolver(&self) -> &dyn PayloadResolver {
        self
    }

    async fn poll(&self, cursor: Option<&str>) -> Result<PollBatch> {
        let mut query = vec![
            ("timeout", self.poll_timeout_secs.to_string()),
            ("limit", self.batch_limit.to_string()),
            ("allowed_updates", "[\"message\"]".to_string()),
        ];
        if let Some(offset) = cursor {
            query.push(("offset", offset.to_string()));
        }
        let updates: Vec<serde_json::Value> = self
            .get_json("getUpdates", &query)
            .await
            .map_err(|e| anyhow::anyhow!("telegram poll failed: {}", e))?;

        let mut items = Vec::with_capacity(updates.len());
        for raw in &updates {
            match self.convert(raw) {
                Some(item) => items.push(item),
                None => warn!("dropping update without update_id"),
            }
        }
        Ok(PollBatch { items })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Direct injection
// ═══════════════════════════════════════════════════════════════════════

/// Direct injection: local files and stdin. Polling yields nothing.
pub struct LocalPayloads;

#[async_trait]
impl PayloadResolver for LocalPayloads {
    async fn resolve(&self, payload: &Payload) -> std::result::Result<Vec<u8>, ExtractError> {
        LocalResolver.resolve(payload).await
    }
}

#[async_trait]
impl SourceAdapter for LocalPayloads {
    fn name(&self) -> &str {
        "direct"
    }

    fn resolver(&self) -> &dyn PayloadResolver {
        self
    }

    async fn poll(&self, _cursor: Option<&str>) -> Result<PollBatch> {
        Ok(PollBatch::default())
    }
}

fn direct_id(content: &[u8], caption: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update([0u8]);
    hasher.update(caption.unwrap_or_default().as_bytes());
    format!("direct:{}", &hex::encode(hasher.finalize())[..16])
}

fn direct_message(content_type: ContentType, payload: Payload, id: String, caption: Option<&str>) -> Message {
    Message {
        id,
        source: "direct".to_string(),
        sender_id: "local".to_string(),
        content_type,
        payload,
        caption: caption.map(str::to_string),
        received_at: Utc::now(),
    }
}

impl LocalPayloads {
    /// A message from stdin text.
    pub fn from_text(text: &str, caption: Option<&str>) -> Message {
        direct_message(
            classify_text(text),
            Payload::Text {
                text: text.to_string(),
            },
            direct_id(text.as_bytes(), caption),
            caption,
        )
    }

    /// A message for one file.
    pub fn from_file(path: &Path, caption: Option<&str>) -> Result<Message> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let id = direct_id(&bytes, caption);
        let mime = effective_mime(None, Some(&filename), &bytes);

        let inline_text = matches!(mime.as_deref(), Some("text/plain" | "text/markdown"))
            && (bytes.len() as u64) <= MAX_INLINE_TEXT_BYTES;
        if inline_text {
            if let Ok(text) = String::from_utf8(bytes) {
                return Ok(direct_message(
                    classify_text(&text),
                    Payload::Text { text },
                    id,
                    caption,
                ));
            }
        }

        let content_type = match mime.as_deref() {
            Some(m) if m.starts_with("image/") => ContentType::Photo,
            Some(m) if m.starts_with("audio/") => ContentType::Voice,
            _ => ContentType::Document,
        };
        let path = path
            .canonicalize()
            .with_context(|| format!("resolving {}", path.display()))?;
        Ok(direct_message(
            content_type,
            Payload::Local {
                path,
                filename,
                mime,
            },
            id,
            caption,
        ))
    }

    /// Messages for a file, or every matching file under a directory.
    pub fn scan(path: &Path, caption: Option<&str>, config: &DirectConfig) -> Result<Vec<Message>> {
        if !path.exists() {
            bail!("path does not exist: {}", path.display());
        }
        if path.is_file() {
            return Ok(vec![Self::from_file(path, caption)?]);
        }

        let include_set = build_globset(&config.include_globs)?;
        let mut excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude_set = build_globset(&excludes)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(path) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            let rel_str = relative.to_string_lossy().to_string();
            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            files.push(entry.path().to_path_buf());
        }
        files.sort();

        files
            .iter()
            .map(|file| Self::from_file(file, caption))
            .collect()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingStatus;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn state(tmp: &TempDir) -> StateStore {
        let cfg = crate::config::parse_config(&format!(
            "[db]\npath = \"{}\"\n[vault]\nroot = \"{}\"\n",
            tmp.path().join("source.sqlite").display(),
            tmp.path().join("vault").display()
        ))
        .unwrap();
        StateStore::new(crate::db::open(&cfg).await.unwrap())
    }

    fn telegram(server: &MockServer) -> TelegramSource {
        let config = SourceConfig {
            provider: "telegram".into(),
            base_url: server.uri(),
            poll_timeout_secs: 0,
            ..Default::default()
        };
        TelegramSource::new(&config, "TOKEN".into()).unwrap()
    }

    fn updates() -> serde_json::Value {
        json!({
            "ok": true,
            "result": [
                { "update_id": 10, "message": { "message_id": 1, "date": 1700000000,
                    "chat": { "id": 42 }, "from": { "id": 7 }, "text": "#idea buy milk" } },
                { "update_id": 11, "message": { "message_id": 2, "date": 1700000001,
                    "chat": { "id": 42 }, "voice": { "file_id": "v1", "duration": 3 } } },
                { "update_id": 12, "message": { "message_id": "not-a-number", "chat": 5 } },
                { "update_id": 13, "edited_message": { "message_id": 1 } },
                { "update_id": 14, "message": { "message_id": 3, "date": 1700000002,
                    "chat": { "id": 42 }, "text": "https://example.com/article #read" } },
                { "update_id": 15, "message": { "message_id": 4, "date": 1700000003,
                    "chat": { "id": 42 }, "sticker": { "file_id": "s" } } }
            ]
        })
    }

    #[test]
    fn text_classification() {
        assert_eq!(classify_text("https://example.com/x"), ContentType::Url);
        assert_eq!(classify_text("/clip https://example.com/x #web"), ContentType::Url);
        assert_eq!(classify_text("read https://example.com/x later"), ContentType::Text);
    }

    #[tokio::test]
    async fn poll_registers_items_and_isolates_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/botTOKEN/getUpdates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(updates()))
            .mount(&server)
            .await;
        let tmp = TempDir::new().unwrap();
        let state = state(&tmp).await;
        let source = telegram(&server);

        let summary = poll_and_register(&source, &state).await.unwrap();
        assert_eq!(summary.polled, 6);
        assert_eq!(summary.registered, 3);
        assert_eq!(summary.malformed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(state.cursor("telegram").await.unwrap().as_deref(), Some("16"));

        let text = state.load_message("42:1").await.unwrap().unwrap();
        assert_eq!(text.sender_id, "7");
        assert_eq!(text.content_type, ContentType::Text);
        let voice = state.load_message("42:2").await.unwrap().unwrap();
        assert_eq!(voice.content_type, ContentType::Voice);
        assert_eq!(voice.payload.mime(), Some("audio/ogg"));
        let url = state.load_message("42:3").await.unwrap().unwrap();
        assert_eq!(url.content_type, ContentType::Url);

        let failed = state.list_by_status(ProcessingStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|r| r.error_class == Some(ErrorClass::Permanent)));
        assert!(failed.iter().all(|r| r.attempts == 1));
        assert!(failed
            .iter()
            .all(|r| r.last_error.as_deref().unwrap().starts_with("malformed source item")));

        // Re-delivery of the same batch is absorbed.
        let again = poll_and_register(&source, &state).await.unwrap();
        assert_eq!(again.registered, 0);
        assert_eq!(again.duplicates, 5);
        assert_eq!(state.list_by_status(ProcessingStatus::Pending).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn poll_sends_cursor_as_offset() {
        let server = MockServer::start().await;
        Mock::given(path("/botTOKEN/getUpdates"))
            .and(query_param("offset", "16"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": [] })))
            .expect(1)
            .mount(&server)
            .await;
        let tmp = TempDir::new().unwrap();
        let state = state(&tmp).await;
        state.set_cursor("telegram", "16").await.unwrap();

        let summary = poll_and_register(&telegram(&server), &state).await.unwrap();
        assert_eq!(summary, PollSummary::default());
    }

    #[tokio::test]
    async fn resolves_remote_files() {
        let server = MockServer::start().await;
        Mock::given(path("/botTOKEN/getFile"))
            .and(query_param("file_id", "v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "result": { "file_id": "v1", "file_path": "voice/file_1.oga" }
            })))
            .mount(&server)
            .await;
        Mock::given(path("/file/botTOKEN/voice/file_1.oga"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"OggS-data".to_vec()))
            .mount(&server)
            .await;

        let bytes = telegram(&server)
            .resolve(&Payload::Remote {
                file_id: "v1".into(),
                filename: None,
                mime: None,
                size: None,
            })
            .await
            .unwrap();
        assert_eq!(bytes, b"OggS-data");
    }

    #[tokio::test]
    async fn download_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(path("/botTOKEN/getFile"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false, "description": "Bad Request: file is too big"
            })))
            .mount(&server)
            .await;
        let err = telegram(&server)
            .resolve(&Payload::Remote {
                file_id: "big".into(),
                filename: None,
                mime: None,
                size: None,
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("file is too big"));
        assert!(!err.to_string().contains("TOKEN"));
    }

    #[test]
    fn direct_scan_filters_and_types() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Thought\nsomething").unwrap();
        std::fs::write(tmp.path().join("link.txt"), "https://example.com/a").unwrap();
        std::fs::write(tmp.path().join("scan.pdf"), b"%PDF-1.4 fake").unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(tmp.path().join("skip.log"), "x").unwrap();

        let config = DirectConfig {
            include_globs: vec!["**/*".into()],
            exclude_globs: vec!["*.log".into()],
        };
        let messages = LocalPayloads::scan(tmp.path(), Some("#batch"), &config).unwrap();
        let kinds: Vec<(String, ContentType)> = messages
            .iter()
            .map(|m| {
                (
                    m.filename().map(str::to_string).unwrap_or_else(|| "inline".into()),
                    m.content_type,
                )
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("inline".to_string(), ContentType::Url),
                ("inline".to_string(), ContentType::Text),
                ("scan.pdf".to_string(), ContentType::Document),
            ]
        );
        assert!(messages.iter().all(|m| m.id.starts_with("direct:")));
        assert!(messages.iter().all(|m| m.caption.as_deref() == Some("#batch")));
    }

    #[test]
    fn direct_ids_are_content_addressed() {
        let a = LocalPayloads::from_text("same", None);
        let b = LocalPayloads::from_text("same", None);
        let c = LocalPayloads::from_text("same", Some("#x"));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }
}
