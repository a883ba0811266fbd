//! Voice notes and audio files → transcript.

use std::sync::Arc;

use async_trait::async_trait;

use super::{effective_mime, ExtractInput, Extractor, PayloadResolver, TranscriptionBackend};
use crate::error::ExtractError;
use crate::models::ExtractedContent;

/// Codecs the transcription endpoint accepts, with a default file extension.
const SUPPORTED_CODECS: &[(&str, &str)] = &[
    ("audio/ogg", "ogg"),
    ("audio/opus", "opus"),
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/x-m4a", "m4a"),
    ("audio/m4a", "m4a"),
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/wave", "wav"),
    ("audio/webm", "webm"),
    ("audio/flac", "flac"),
    ("audio/x-flac", "flac"),
    ("video/mp4", "mp4"),
];

pub struct VoiceExtractor {
    backend: Option<Arc<dyn TranscriptionBackend>>,
}

impl VoiceExtractor {
    pub fn new(backend: Option<Arc<dyn TranscriptionBackend>>) -> Self {
        Self { backend }
    }
}

/// Supported `(mime, extension)` for a resolved mime type, or `UnsupportedCodec`.
pub fn check_codec(mime: Option<&str>) -> Result<(&'static str, &'static str), ExtractError> {
    let mime = mime.ok_or_else(|| ExtractError::UnsupportedCodec("unknown".to_string()))?;
    SUPPORTED_CODECS
        .iter()
        .find(|(m, _)| *m == mime)
        .copied()
        .ok_or_else(|| ExtractError::UnsupportedCodec(mime.to_string()))
}

#[async_trait]
impl Extractor for VoiceExtractor {
    fn name(&self) -> &str {
        "voice"
    }

    async fn extract(
        &self,
        input: &ExtractInput<'_>,
        resolver: &dyn PayloadResolver,
    ) -> Result<ExtractedContent, ExtractError> {
        let payload = &input.message.payload;

        // Declared type and extension are enough to reject a codec before download.
        let declared = effective_mime(payload.mime(), payload.filename(), &[]);
        if declared.is_some() {
            check_codec(declared.as_deref())?;
        }

        let backend = self.backend.as_ref().ok_or_else(|| {
            ExtractError::ServiceUnavailable("transcription backend disabled".to_string())
        })?;

        let audio = resolver.resolve(payload).await?;
        if audio.is_empty() {
            return Err(ExtractError::EmptyPayload);
        }
        let mime = effective_mime(payload.mime(), payload.filename(), &audio);
        let (mime, ext) = check_codec(mime.as_deref())?;
        let filename = payload
            .filename()
            .map(str::to_string)
            .unwrap_or_else(|| format!("voice.{}", ext));

        let transcript = backend.transcribe(&audio, &filename, mime).await?;
        let mut content = ExtractedContent {
            text: transcript.trim().to_string(),
            extractor: format!("voice/{}", backend.model_name()),
            ..Default::default()
        };
        if content.text.is_empty() {
            content.warnings.push("empty transcript".to_string());
        }
        Ok(content)
    }
}
