//! Classifier/router: picks the pipeline for a message.
//!
//! Decision order, first applicable wins:
//!
//! 1. an explicit pipeline `/command` (confidence 1.0)
//! 2. `[type:...]` / `[category:...]` metadata hints (confidence 0.95)
//! 3. the intent oracle, adopted only at or above the confidence threshold
//! 4. the default pipeline (`note`)
//!
//! The router holds no state. Given the same hints and the same oracle
//! response it always returns the same result, which is what makes
//! [`ReplayOracle`] fixtures reproduce routing decisions exactly.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;
use crate::llm::{LlmClient, LlmError};
use crate::models::{
    ClassificationResult, ClassificationSource, Command, ContentType, ExtractedMetadata, ParsedHints, Pipeline,
};
use crate::security::isolate_content;

/// Confidence assigned to metadata-hint routing.
pub const METADATA_CONFIDENCE: f64 = 0.95;

const ARCHIVE_TYPES: &[&str] = &["CONTRACT", "CORRESPONDANCE", "DOCUMENT", "REPORT"];

const INTENT_SYSTEM_PROMPT: &str = r#"You route personal captures to one of four pipelines:
- "note": thoughts, reminders, journal entries, anything else
- "clip": web articles or videos worth keeping as standalone reference
- "archive": official documents to file (contracts, letters, reports)
- "receipt": purchase receipts and invoices

Reply with a JSON object:
{"pipeline": "note|clip|archive|receipt", "confidence": 0.0-1.0,
 "metadata": {"type": "...", "category": "...", "vendor": "...", "amount": 0.0, "date": "YYYYMMDD", "description": "...", "details": "..."},
 "suggested_tags": ["..."]}
Omit metadata fields you cannot determine. Use uppercase for type and category."#;

/// What the oracle sees. Serialised form is the replay fixture key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRequest {
    pub residual_text: String,
    pub content_type: ContentType,
    pub filename: Option<String>,
}

impl IntentRequest {
    pub fn fixture_key(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)[..16].to_string()
    }
}

/// The oracle's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResponse {
    pub pipeline: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: ExtractedMetadata,
    #[serde(default)]
    pub suggested_tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum OracleError {
    /// Turned off in configuration.
    #[error("intent oracle disabled")]
    Disabled,
    #[error("intent oracle unavailable: {0}")]
    Unavailable(String),
    #[error("invalid intent response: {0}")]
    Invalid(String),
    #[error("no recorded fixture for request {0}")]
    MissingFixture(String),
}

impl From<LlmError> for OracleError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(m) | LlmError::Config(m) => OracleError::Unavailable(m),
            other => OracleError::Invalid(other.to_string()),
        }
    }
}

#[async_trait]
pub trait IntentOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn infer(&self, request: &IntentRequest) -> Result<IntentResponse, OracleError>;
}

pub struct DisabledOracle;

#[async_trait]
impl IntentOracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn infer(&self, _request: &IntentRequest) -> Result<IntentResponse, OracleError> {
        Err(OracleError::Disabled)
    }
}

/// Chat-completions intent extraction in JSON mode.
pub struct OpenAiIntentOracle {
    client: LlmClient,
}

impl OpenAiIntentOracle {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IntentOracle for OpenAiIntentOracle {
    fn name(&self) -> &str {
        "openai"
    }

    async fn infer(&self, request: &IntentRequest) -> Result<IntentResponse, OracleError> {
        let user = format!(
            "content_type: {}\nfilename: {}\n\n{}",
            request.content_type,
            request.filename.as_deref().unwrap_or("(none)"),
            isolate_content(&request.residual_text, "capture", Utc::now())
        );
        let value = self.client.chat_json(INTENT_SYSTEM_PROMPT, &user).await?;
        serde_json::from_value(value).map_err(|e| OracleError::Invalid(e.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Fixture {
    request: IntentRequest,
    response: IntentResponse,
}

/// Path of the fixture file for `request` under `dir`.
pub fn fixture_path(dir: &Path, request: &IntentRequest) -> PathBuf {
    dir.join(format!("{}.json", request.fixture_key()))
}

/// Store a captured oracle exchange.
pub fn write_fixture(dir: &Path, request: &IntentRequest, response: &IntentResponse) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = fixture_path(dir, request);
    let fixture = Fixture {
        request: request.clone(),
        response: response.clone(),
    };
    std::fs::write(&path, serde_json::to_string_pretty(&fixture)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Answers from recorded fixtures; never touches the network.
pub struct ReplayOracle {
    dir: PathBuf,
}

impl ReplayOracle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl IntentOracle for ReplayOracle {
    fn name(&self) -> &str {
        "replay"
    }

    async fn infer(&self, request: &IntentRequest) -> Result<IntentResponse, OracleError> {
        let path = fixture_path(&self.dir, request);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OracleError::MissingFixture(request.fixture_key()))
            }
            Err(e) => return Err(OracleError::Unavailable(format!("{}: {}", path.display(), e))),
        };
        let fixture: Fixture =
            serde_json::from_str(&raw).map_err(|e| OracleError::Invalid(format!("{}: {}", path.display(), e)))?;
        Ok(fixture.response)
    }
}

/// Passes through to a live oracle and records each exchange as a fixture.
pub struct RecordingOracle {
    inner: Arc<dyn IntentOracle>,
    dir: PathBuf,
}

impl RecordingOracle {
    pub fn new(inner: Arc<dyn IntentOracle>, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl IntentOracle for RecordingOracle {
    fn name(&self) -> &str {
        "recording"
    }

    async fn infer(&self, request: &IntentRequest) -> Result<IntentResponse, OracleError> {
        let response = self.inner.infer(request).await?;
        match write_fixture(&self.dir, request, &response) {
            Ok(path) => debug!(path = %path.display(), "recorded intent fixture"),
            Err(e) => warn!(error = %e, "failed to record intent fixture"),
        }
        Ok(response)
    }
}

pub fn oracle_from_config(config: &ClassifierConfig) -> Result<Arc<dyn IntentOracle>> {
    let oracle: Arc<dyn IntentOracle> = match config.provider.as_str() {
        "disabled" => Arc::new(DisabledOracle),
        "openai" => {
            let client = LlmClient::from_config(&config.backend()).map_err(|e| anyhow::anyhow!(e))?;
            let live: Arc<dyn IntentOracle> = Arc::new(OpenAiIntentOracle::new(client));
            match (&config.fixtures_dir, config.record) {
                (Some(dir), true) => Arc::new(RecordingOracle::new(live, dir.clone())),
                _ => live,
            }
        }
        "replay" => match &config.fixtures_dir {
            Some(dir) => Arc::new(ReplayOracle::new(dir.clone())),
            None => bail!("classifier.fixtures_dir is required for the replay provider"),
        },
        other => bail!("Unknown classifier provider: '{}'", other),
    };
    Ok(oracle)
}

/// A routing decision plus what the caller should surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub result: ClassificationResult,
    /// Reduced-fidelity markers for frontmatter.
    pub warnings: Vec<String>,
    /// Present when a low-confidence oracle result was demoted.
    pub review: Option<serde_json::Value>,
}

/// The first pipeline command, in order. Directives and unknowns are skipped.
pub fn explicit_pipeline(commands: &[String]) -> Option<Pipeline> {
    commands.iter().find_map(|c| match Command::parse(c) {
        Command::Pipeline(p) => Some(p),
        _ => None,
    })
}

/// Deterministic metadata mapping: `type:RECEIPT` to receipt, any other
/// `type` or any `category` to archive.
pub fn metadata_pipeline(metadata: &ExtractedMetadata) -> Option<Pipeline> {
    match metadata.doc_type.as_deref().map(str::to_ascii_uppercase) {
        Some(t) if t == "RECEIPT" => Some(Pipeline::Receipt),
        Some(t) => {
            if !ARCHIVE_TYPES.contains(&t.as_str()) {
                debug!(doc_type = %t, "unrecognised type hint routed to archive");
            }
            Some(Pipeline::Archive)
        }
        None if metadata.category.is_some() => Some(Pipeline::Archive),
        None => None,
    }
}

/// Validate an oracle response and apply the confidence threshold.
pub fn adopt(
    response: &IntentResponse,
    hint_metadata: &ExtractedMetadata,
    threshold: f64,
) -> std::result::Result<(ClassificationResult, bool), OracleError> {
    let pipeline = Pipeline::parse(&response.pipeline)
        .ok_or_else(|| OracleError::Invalid(format!("unknown pipeline '{}'", response.pipeline)))?;
    if !(0.0..=1.0).contains(&response.confidence) {
        return Err(OracleError::Invalid(format!(
            "confidence {} outside [0, 1]",
            response.confidence
        )));
    }

    if response.confidence >= threshold {
        let mut metadata = hint_metadata.clone();
        metadata.fill_from(&response.metadata);
        let suggested_tags: BTreeSet<String> = response
            .suggested_tags
            .iter()
            .map(|t| t.trim().trim_start_matches('#').to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Ok((
            ClassificationResult {
                pipeline,
                confidence: response.confidence,
                extracted_metadata: metadata,
                suggested_tags,
                source: ClassificationSource::AiIntent,
            },
            true,
        ))
    } else {
        Ok((
            ClassificationResult {
                pipeline: Pipeline::Note,
                confidence: response.confidence,
                extracted_metadata: hint_metadata.clone(),
                suggested_tags: BTreeSet::new(),
                source: ClassificationSource::Default,
            },
            false,
        ))
    }
}

fn default_result(metadata: ExtractedMetadata) -> ClassificationResult {
    ClassificationResult {
        pipeline: Pipeline::Note,
        confidence: 0.0,
        extracted_metadata: metadata,
        suggested_tags: BTreeSet::new(),
        source: ClassificationSource::Default,
    }
}

pub struct Router {
    oracle: Arc<dyn IntentOracle>,
    threshold: f64,
}

impl Router {
    pub fn new(oracle: Arc<dyn IntentOracle>, threshold: f64) -> Self {
        Self { oracle, threshold }
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    /// Classify a message. `commands` are the gate-approved commands.
    ///
    /// Never fails: oracle problems degrade to the default pipeline.
    pub async fn classify(
        &self,
        hints: &ParsedHints,
        commands: &[String],
        content_type: ContentType,
        filename: Option<&str>,
    ) -> Classification {
        let metadata = ExtractedMetadata::from_hints(&hints.metadata);

        if let Some(pipeline) = explicit_pipeline(commands) {
            return Classification {
                result: ClassificationResult {
                    pipeline,
                    confidence: 1.0,
                    extracted_metadata: metadata,
                    suggested_tags: BTreeSet::new(),
                    source: ClassificationSource::ExplicitCommand,
                },
                warnings: Vec::new(),
                review: None,
            };
        }

        if let Some(pipeline) = metadata_pipeline(&metadata) {
            return Classification {
                result: ClassificationResult {
                    pipeline,
                    confidence: METADATA_CONFIDENCE,
                    extracted_metadata: metadata,
                    suggested_tags: BTreeSet::new(),
                    source: ClassificationSource::MetadataHint,
                },
                warnings: Vec::new(),
                review: None,
            };
        }

        let request = IntentRequest {
            residual_text: hints.residual_text.clone(),
            content_type,
            filename: filename.map(str::to_string),
        };
        let outcome = self
            .oracle
            .infer(&request)
            .await
            .and_then(|response| adopt(&response, &metadata, self.threshold).map(|r| (response, r)));

        match outcome {
            Ok((_, (result, true))) => {
                debug!(pipeline = %result.pipeline, confidence = result.confidence, "intent adopted");
                Classification {
                    result,
                    warnings: Vec::new(),
                    review: None,
                }
            }
            Ok((response, (result, false))) => {
                info!(
                    suggested = %response.pipeline,
                    confidence = response.confidence,
                    threshold = self.threshold,
                    "low-confidence intent demoted to note"
                );
                Classification {
                    result,
                    warnings: Vec::new(),
                    review: Some(json!({
                        "suggested_pipeline": response.pipeline,
                        "confidence": response.confidence,
                        "threshold": self.threshold,
                        "metadata": response.metadata,
                        "suggested_tags": response.suggested_tags,
                    })),
                }
            }
            Err(OracleError::Disabled) => Classification {
                result: default_result(metadata),
                warnings: Vec::new(),
                review: None,
            },
            Err(e) => {
                warn!(oracle = self.oracle.name(), error = %e, "intent oracle failed; using default pipeline");
                Classification {
                    result: default_result(metadata),
                    warnings: vec![format!("classification fell back to default: {}", e)],
                    review: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hints;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixed(IntentResponse);

    #[async_trait]
    impl IntentOracle for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn infer(&self, _request: &IntentRequest) -> Result<IntentResponse, OracleError> {
            Ok(self.0.clone())
        }
    }

    fn response(pipeline: &str, confidence: f64) -> IntentResponse {
        IntentResponse {
            pipeline: pipeline.into(),
            confidence,
            metadata: ExtractedMetadata {
                vendor: Some("Bunnings".into()),
                amount: Some(45.99),
                ..Default::default()
            },
            suggested_tags: vec!["#Hardware".into()],
        }
    }

    fn router(r: IntentResponse) -> Router {
        Router::new(Arc::new(Fixed(r)), 0.8)
    }

    async fn classify(router: &Router, text: &str) -> Classification {
        let hints = hints::parse(text);
        router
            .classify(&hints, &hints.commands, ContentType::Text, None)
            .await
    }

    #[tokio::test]
    async fn explicit_command_wins_with_full_confidence() {
        let c = classify(&router(response("receipt", 0.99)), "/summarize /clip /archive read later").await;
        assert_eq!(c.result.pipeline, Pipeline::Clip);
        assert_eq!(c.result.confidence, 1.0);
        assert_eq!(c.result.source, ClassificationSource::ExplicitCommand);
    }

    #[tokio::test]
    async fn metadata_hints_route_deterministically() {
        let r = router(response("note", 0.99));
        let c = classify(&r, "[type:receipt] lunch").await;
        assert_eq!(c.result.pipeline, Pipeline::Receipt);
        assert_eq!(c.result.confidence, METADATA_CONFIDENCE);
        let c = classify(&r, "[category:HOUSE] lease").await;
        assert_eq!(c.result.pipeline, Pipeline::Archive);
        assert_eq!(c.result.source, ClassificationSource::MetadataHint);
    }

    #[tokio::test]
    async fn confident_oracle_is_adopted() {
        let c = classify(&router(response("receipt", 0.92)), "receipt from Bunnings $45.99").await;
        assert_eq!(c.result.pipeline, Pipeline::Receipt);
        assert_eq!(c.result.source, ClassificationSource::AiIntent);
        assert_eq!(c.result.extracted_metadata.vendor.as_deref(), Some("Bunnings"));
        assert!(c.result.suggested_tags.contains("hardware"));
        assert!(c.review.is_none());
    }

    #[tokio::test]
    async fn low_confidence_is_demoted_and_queued() {
        let c = classify(&router(response("archive", 0.5)), "maybe a contract").await;
        assert_eq!(c.result.pipeline, Pipeline::Note);
        assert_eq!(c.result.source, ClassificationSource::Default);
        assert!(c.result.extracted_metadata.vendor.is_none());
        let review = c.review.unwrap();
        assert_eq!(review["suggested_pipeline"], "archive");
        assert_eq!(review["confidence"], 0.5);
    }

    #[tokio::test]
    async fn invalid_or_unavailable_oracle_degrades() {
        let c = classify(&router(response("shopping", 0.99)), "groceries").await;
        assert_eq!(c.result.pipeline, Pipeline::Note);
        assert_eq!(c.warnings.len(), 1);

        let disabled = Router::new(Arc::new(DisabledOracle), 0.8);
        let c = classify(&disabled, "just a thought").await;
        assert_eq!(c.result.pipeline, Pipeline::Note);
        assert!(c.warnings.is_empty());
    }

    #[tokio::test]
    async fn replay_reproduces_recorded_decision() {
        let tmp = TempDir::new().unwrap();
        let request = IntentRequest {
            residual_text: "archive this receipt from Bunnings for plumbing $45.99".into(),
            content_type: ContentType::Document,
            filename: Some("invoice.pdf".into()),
        };
        write_fixture(tmp.path(), &request, &response("receipt", 0.9)).unwrap();

        let router = Router::new(Arc::new(ReplayOracle::new(tmp.path())), 0.8);
        let hints = hints::parse(&request.residual_text);
        let first = router
            .classify(&hints, &[], ContentType::Document, Some("invoice.pdf"))
            .await;
        let second = router
            .classify(&hints, &[], ContentType::Document, Some("invoice.pdf"))
            .await;
        assert_eq!(first, second);
        assert_eq!(first.result.pipeline, Pipeline::Receipt);

        let missing = router.classify(&hints, &[], ContentType::Document, None).await;
        assert_eq!(missing.result.pipeline, Pipeline::Note);
        assert!(missing.warnings[0].contains("no recorded fixture"));
    }

    #[tokio::test]
    async fn recording_oracle_writes_fixtures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content":
                    "{\"pipeline\":\"clip\",\"confidence\":0.85,\"suggested_tags\":[\"rust\"]}" } }]
            })))
            .mount(&server)
            .await;
        let tmp = TempDir::new().unwrap();
        let backend = crate::config::BackendConfig {
            provider: "openai".into(),
            base_url: server.uri(),
            model: Some("gpt-test".into()),
            max_retries: 0,
            ..Default::default()
        };
        let live = Arc::new(OpenAiIntentOracle::new(
            LlmClient::with_api_key(&backend, None).unwrap(),
        ));
        let recording = RecordingOracle::new(live, tmp.path());
        let request = IntentRequest {
            residual_text: "great article on async rust".into(),
            content_type: ContentType::Text,
            filename: None,
        };
        let live_answer = recording.infer(&request).await.unwrap();
        assert_eq!(live_answer.pipeline, "clip");

        let replayed = ReplayOracle::new(tmp.path()).infer(&request).await.unwrap();
        assert_eq!(replayed, live_answer);
    }
}
