//! Content extraction adapters.
//!
//! One [`Extractor`] per [`ContentType`], dispatched by an
//! [`ExtractorRegistry`]. Adapters get raw bytes through a
//! [`PayloadResolver`] (the source adapter for remote payloads, the local
//! filesystem for direct injection) and return [`ExtractedContent`].
//!
//! Failures are [`ExtractError`]s; the processor maps them onto the
//! transient/permanent taxonomy. Reduced-fidelity results (OCR unavailable,
//! lossy document salvage) are not errors: they succeed with `warnings`.

pub mod document;
pub mod photo;
pub mod text;
pub mod url;
pub mod voice;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::ExtractError;
use crate::llm::LlmClient;
use crate::models::{ContentType, Directive, ExtractedContent, Message, Payload};

/// Resolves an opaque payload reference into bytes.
#[async_trait]
pub trait PayloadResolver: Send + Sync {
    async fn resolve(&self, payload: &Payload) -> Result<Vec<u8>, ExtractError>;
}

/// Everything an adapter may look at for one message.
pub struct ExtractInput<'a> {
    pub message: &'a Message,
    /// Hint-stripped text (body for text/url messages, caption otherwise).
    pub residual_text: &'a str,
    pub directives: &'a [Directive],
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(
        &self,
        input: &ExtractInput<'_>,
        resolver: &dyn PayloadResolver,
    ) -> Result<ExtractedContent, ExtractError>;
}

/// Speech-to-text backend.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn transcribe(&self, audio: &[u8], filename: &str, mime: &str) -> Result<String, ExtractError>;

    fn model_name(&self) -> &str;
}

/// Image analysis backend (OCR and description).
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn describe_image(&self, image: &[u8], mime: &str, prompt: &str) -> Result<String, ExtractError>;

    fn model_name(&self) -> &str;
}

#[async_trait]
impl TranscriptionBackend for LlmClient {
    async fn transcribe(&self, audio: &[u8], filename: &str, mime: &str) -> Result<String, ExtractError> {
        Ok(LlmClient::transcribe(self, audio, filename, mime).await?)
    }

    fn model_name(&self) -> &str {
        self.model()
    }
}

#[async_trait]
impl VisionBackend for LlmClient {
    async fn describe_image(&self, image: &[u8], mime: &str, prompt: &str) -> Result<String, ExtractError> {
        Ok(LlmClient::describe_image(self, prompt, image, mime).await?)
    }

    fn model_name(&self) -> &str {
        self.model()
    }
}

/// Reads [`Payload::Local`] files and inline text. Remote payloads are an error.
pub struct LocalResolver;

#[async_trait]
impl PayloadResolver for LocalResolver {
    async fn resolve(&self, payload: &Payload) -> Result<Vec<u8>, ExtractError> {
        match payload {
            Payload::Local { path, .. } => tokio::fs::read(path)
                .await
                .map_err(|e| ExtractError::Payload(format!("{}: {}", path.display(), e))),
            Payload::Text { text } => Ok(text.as_bytes().to_vec()),
            Payload::Remote { file_id, .. } => Err(ExtractError::Payload(format!(
                "remote payload {} needs a source adapter",
                file_id
            ))),
            Payload::Empty => Err(ExtractError::EmptyPayload),
        }
    }
}

/// Content-type keyed adapter table.
pub struct ExtractorRegistry {
    adapters: HashMap<ContentType, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, content_type: ContentType, adapter: Arc<dyn Extractor>) {
        self.adapters.insert(content_type, adapter);
    }

    /// The standard adapter set for a configuration.
    pub fn from_config(
        config: &Config,
        transcriber: Option<Arc<dyn TranscriptionBackend>>,
        vision: Option<Arc<dyn VisionBackend>>,
    ) -> Result<Self, ExtractError> {
        let mut registry = Self::new();
        registry.register(
            ContentType::Voice,
            Arc::new(voice::VoiceExtractor::new(transcriber)),
        );
        registry.register(ContentType::Photo, Arc::new(photo::PhotoExtractor::new(vision)));
        registry.register(ContentType::Document, Arc::new(document::DocumentExtractor));
        registry.register(
            ContentType::Url,
            Arc::new(url::UrlExtractor::new(&config.extract.url)?),
        );
        registry.register(ContentType::Text, Arc::new(text::TextExtractor));
        Ok(registry)
    }

    pub async fn extract(
        &self,
        input: &ExtractInput<'_>,
        resolver: &dyn PayloadResolver,
    ) -> Result<ExtractedContent, ExtractError> {
        let content_type = input.message.content_type;
        let adapter = self.adapters.get(&content_type).ok_or_else(|| {
            ExtractError::Unsupported(format!("no extractor for {}", content_type))
        })?;
        tracing::debug!(
            message_id = %input.message.id,
            extractor = adapter.name(),
            "extracting content"
        );
        adapter.extract(input, resolver).await
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the optional model backends named in the config.
pub fn backends_from_config(
    config: &Config,
) -> anyhow::Result<(
    Option<Arc<dyn TranscriptionBackend>>,
    Option<Arc<dyn VisionBackend>>,
)> {
    let transcriber: Option<Arc<dyn TranscriptionBackend>> = if config.extract.transcription.is_enabled() {
        Some(Arc::new(LlmClient::from_config(&config.extract.transcription)?))
    } else {
        None
    };
    let vision: Option<Arc<dyn VisionBackend>> = if config.extract.vision.is_enabled() {
        Some(Arc::new(LlmClient::from_config(&config.extract.vision)?))
    } else {
        None
    };
    Ok((transcriber, vision))
}

/// Guess a MIME type from a filename extension.
pub fn mime_from_filename(filename: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    Some(match ext.as_str() {
        "pdf" => document::MIME_PDF,
        "docx" => document::MIME_DOCX,
        "pptx" => document::MIME_PPTX,
        "xlsx" => document::MIME_XLSX,
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "mp3" | "mpga" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "webm" => "audio/webm",
        "flac" => "audio/flac",
        "amr" => "audio/amr",
        _ => return None,
    })
}

/// Resolve the effective MIME type: declared, then extension, then magic bytes.
pub fn effective_mime(declared: Option<&str>, filename: Option<&str>, bytes: &[u8]) -> Option<String> {
    let declared = declared
        .map(|m| m.split(';').next().unwrap_or(m).trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty() && m != "application/octet-stream");
    declared
        .or_else(|| filename.and_then(mime_from_filename).map(str::to_string))
        .or_else(|| infer::get(bytes).map(|k| k.mime_type().to_string()))
}
