//! Plain text: pass-through of the hint-stripped body.

use async_trait::async_trait;

use super::{ExtractInput, Extractor, PayloadResolver};
use crate::error::ExtractError;
use crate::models::ExtractedContent;

pub struct TextExtractor;

#[async_trait]
impl Extractor for TextExtractor {
    fn name(&self) -> &str {
        "text"
    }

    async fn extract(
        &self,
        input: &ExtractInput<'_>,
        _resolver: &dyn PayloadResolver,
    ) -> Result<ExtractedContent, ExtractError> {
        let raw = input.message.payload.text().unwrap_or_default();
        if raw.trim().is_empty() {
            return Err(ExtractError::EmptyPayload);
        }
        // A message of only hints is valid and yields an empty body.
        Ok(ExtractedContent {
            text: input.residual_text.trim().to_string(),
            extractor: "text".to_string(),
            ..Default::default()
        })
    }
}
