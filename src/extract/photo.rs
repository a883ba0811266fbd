//! Photos → OCR text, a description, or stored as-is.
//!
//! `/ocr` selects OCR. `/describe` or any caption text selects a
//! description. Without either the image is stored without analysis.
//! Analysis failures never fail the message: the image is kept and the
//! failure is reported as a warning.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{effective_mime, ExtractInput, Extractor, PayloadResolver, VisionBackend};
use crate::error::ExtractError;
use crate::models::{Attachment, Directive, ExtractedContent};

const OCR_PROMPT: &str = "Transcribe all text visible in this image exactly as written. \
Preserve line breaks. Return only the transcribed text, or an empty response if there is no text.";

const DESCRIBE_PROMPT: &str = "Describe this image in two to four sentences for a personal \
knowledge note. Mention any visible text, people, places or objects that would help find it later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ocr,
    Describe,
    Store,
}

fn mode(directives: &[Directive], residual_text: &str) -> Mode {
    if directives.contains(&Directive::Ocr) {
        Mode::Ocr
    } else if directives.contains(&Directive::Describe) || !residual_text.trim().is_empty() {
        Mode::Describe
    } else {
        Mode::Store
    }
}

pub struct PhotoExtractor {
    vision: Option<Arc<dyn VisionBackend>>,
}

impl PhotoExtractor {
    pub fn new(vision: Option<Arc<dyn VisionBackend>>) -> Self {
        Self { vision }
    }
}

#[async_trait]
impl Extractor for PhotoExtractor {
    fn name(&self) -> &str {
        "photo"
    }

    async fn extract(
        &self,
        input: &ExtractInput<'_>,
        resolver: &dyn PayloadResolver,
    ) -> Result<ExtractedContent, ExtractError> {
        let payload = &input.message.payload;
        let bytes = resolver.resolve(payload).await?;
        if bytes.is_empty() {
            return Err(ExtractError::EmptyPayload);
        }
        let mime = effective_mime(payload.mime(), payload.filename(), &bytes)
            .unwrap_or_else(|| "image/jpeg".to_string());
        let filename = payload.filename().map(str::to_string).unwrap_or_else(|| {
            let ext = mime.rsplit('/').next().unwrap_or("jpg");
            format!("photo.{}", if ext == "jpeg" { "jpg" } else { ext })
        });

        let mut content = ExtractedContent {
            extractor: "photo/store".to_string(),
            ..Default::default()
        };

        let mode = mode(input.directives, input.residual_text);
        if mode != Mode::Store {
            let (label, prompt) = match mode {
                Mode::Ocr => ("ocr", OCR_PROMPT.to_string()),
                _ if input.residual_text.trim().is_empty() => ("describe", DESCRIBE_PROMPT.to_string()),
                _ => (
                    "describe",
                    format!(
                        "{}\n\nThe sender's caption: {}",
                        DESCRIBE_PROMPT,
                        input.residual_text.trim()
                    ),
                ),
            };
            match &self.vision {
                None => content
                    .warnings
                    .push(format!("{} skipped: vision backend disabled", label)),
                Some(vision) => match vision.describe_image(&bytes, &mime, &prompt).await {
                    Ok(text) => {
                        content.text = text.trim().to_string();
                        content.extractor = format!("photo/{}", label);
                    }
                    Err(e) => {
                        warn!(message_id = %input.message.id, error = %e, "image analysis failed; storing image only");
                        content.warnings.push(format!("{} failed: {}", label, e));
                    }
                },
            }
        }

        content.attachment = Some(Attachment {
            filename,
            mime: Some(mime),
            bytes,
        });
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testing::{message, FakeVision, StaticResolver};
    use crate::models::{ContentType, Payload};

    fn photo() -> crate::models::Message {
        message(
            ContentType::Photo,
            Payload::Remote {
                file_id: "p".into(),
                filename: None,
                mime: Some("image/jpeg".into()),
                size: None,
            },
            None,
        )
    }

    #[test]
    fn mode_selection() {
        assert_eq!(mode(&[Directive::Ocr], "caption"), Mode::Ocr);
        assert_eq!(mode(&[], "whiteboard from standup"), Mode::Describe);
        assert_eq!(mode(&[Directive::Describe], ""), Mode::Describe);
        assert_eq!(mode(&[], "  "), Mode::Store);
    }

    #[tokio::test]
    async fn ocr_uses_ocr_prompt() {
        let vision = Arc::new(FakeVision::ok("TOTAL 12.00\n"));
        let extractor = PhotoExtractor::new(Some(vision.clone()));
        let msg = photo();
        let input = ExtractInput {
            message: &msg,
            residual_text: "",
            directives: &[Directive::Ocr],
        };
        let out = extractor
            .extract(&input, &StaticResolver(vec![0xFF, 0xD8, 0xFF]))
            .await
            .unwrap();
        assert_eq!(out.text, "TOTAL 12.00");
        assert_eq!(out.extractor, "photo/ocr");
        assert!(vision.prompts.lock().unwrap()[0].starts_with("Transcribe"));
        assert_eq!(out.attachment.unwrap().filename, "photo.jpg");
    }

    #[tokio::test]
    async fn no_caption_stores_without_analysis() {
        let vision = Arc::new(FakeVision::ok("unused"));
        let extractor = PhotoExtractor::new(Some(vision.clone()));
        let msg = photo();
        let input = ExtractInput {
            message: &msg,
            residual_text: "",
            directives: &[],
        };
        let out = extractor
            .extract(&input, &StaticResolver(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(out.extractor, "photo/store");
        assert!(out.text.is_empty());
        assert!(out.warnings.is_empty());
        assert!(vision.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn analysis_failure_degrades_to_store() {
        let extractor = PhotoExtractor::new(Some(Arc::new(FakeVision::failing("503"))));
        let msg = photo();
        let input = ExtractInput {
            message: &msg,
            residual_text: "team photo",
            directives: &[],
        };
        let out = extractor
            .extract(&input, &StaticResolver(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(out.extractor, "photo/store");
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].starts_with("describe failed"));
        assert!(out.attachment.is_some());
    }
}
