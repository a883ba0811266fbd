//! Core data models used throughout the capture pipeline.
//!
//! These types represent the inbound messages, their processing records,
//! and the intermediate and final artifacts that flow from the source
//! adapter to the knowledge vault.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of inbound content. Selects the extractor adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Voice,
    Photo,
    Document,
    Url,
    Text,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::Voice,
        ContentType::Photo,
        ContentType::Document,
        ContentType::Url,
        ContentType::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Voice => "voice",
            ContentType::Photo => "photo",
            ContentType::Document => "document",
            ContentType::Url => "url",
            ContentType::Text => "text",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "voice" => Ok(ContentType::Voice),
            "photo" => Ok(ContentType::Photo),
            "document" => Ok(ContentType::Document),
            "url" => Ok(ContentType::Url),
            "text" => Ok(ContentType::Text),
            other => bail!("unknown content type: '{}'", other),
        }
    }
}

/// Opaque reference to the raw content of a message.
///
/// Binary payloads are never stored in the database: remote payloads are
/// resolved through the source adapter, local ones from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    /// Inline text (text and URL messages, stdin injection).
    Text { text: String },
    /// A file on the local filesystem (direct injection).
    Local {
        path: PathBuf,
        filename: String,
        mime: Option<String>,
    },
    /// A file held by the remote message source, downloadable by id.
    Remote {
        file_id: String,
        filename: Option<String>,
        mime: Option<String>,
        size: Option<u64>,
    },
    /// Nothing to resolve (malformed placeholders).
    Empty,
}

impl Payload {
    pub fn filename(&self) -> Option<&str> {
        match self {
            Payload::Local { filename, .. } => Some(filename),
            Payload::Remote { filename, .. } => filename.as_deref(),
            Payload::Text { .. } | Payload::Empty => None,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        match self {
            Payload::Local { mime, .. } | Payload::Remote { mime, .. } => mime.as_deref(),
            Payload::Text { .. } | Payload::Empty => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Immutable record of one inbound item. Created by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Source-assigned unique id (e.g. `"4711:93"` or `"direct:1a2b..."`).
    pub id: String,
    /// Label of the adapter that produced the message (`"telegram"`, `"direct"`).
    pub source: String,
    /// Sender identity used for rate limiting and allow-listing.
    pub sender_id: String,
    pub content_type: ContentType,
    pub payload: Payload,
    pub caption: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// The text the hint parser runs over: the body for text and URL
    /// messages, the caption for everything else.
    pub fn hint_text(&self) -> String {
        match (self.content_type, &self.payload) {
            (ContentType::Text | ContentType::Url, Payload::Text { text }) => match &self.caption {
                Some(caption) if !caption.trim().is_empty() => format!("{}\n{}", text, caption),
                _ => text.clone(),
            },
            _ => self.caption.clone().unwrap_or_default(),
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.payload.filename()
    }
}

/// Lifecycle state of a [`ProcessingRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub const ALL: [ProcessingStatus; 4] = [
        ProcessingStatus::Pending,
        ProcessingStatus::Processing,
        ProcessingStatus::Completed,
        ProcessingStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => bail!("unknown processing status: '{}'", other),
        }
    }
}

/// Persisted classification of a failure. Drives retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Upstream unavailable or rate limited; retried automatically.
    Transient,
    /// Unsupported format or malformed data; manual triage only.
    Permanent,
    /// Rejected by the security gate; never retried automatically.
    Security,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Security => "security",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "permanent" => Ok(ErrorClass::Permanent),
            "security" => Ok(ErrorClass::Security),
            other => bail!("unknown error class: '{}'", other),
        }
    }
}

/// Mutable state-machine instance keyed by message id. Owned by the state store.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    pub message_id: String,
    pub status: ProcessingStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub content_type: ContentType,
    /// JSON outcome written on completion (pipeline and output paths).
    pub outcome: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Privacy partition of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Private,
    Work,
    #[default]
    Unspecified,
}

impl Scope {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Scope::Private => Some("private"),
            Scope::Work => Some("work"),
            Scope::Unspecified => None,
        }
    }
}

/// Inline capture syntax recovered from a message. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedHints {
    pub tags: BTreeSet<String>,
    pub people: BTreeSet<String>,
    pub commands: Vec<String>,
    pub scope: Scope,
    pub metadata: BTreeMap<String, String>,
    pub residual_text: String,
}

/// Destination branch for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    Note,
    Clip,
    Archive,
    Receipt,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Note => "note",
            Pipeline::Clip => "clip",
            Pipeline::Archive => "archive",
            Pipeline::Receipt => "receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Pipeline> {
        match s.trim().to_ascii_lowercase().as_str() {
            "note" => Some(Pipeline::Note),
            "clip" => Some(Pipeline::Clip),
            "archive" => Some(Pipeline::Archive),
            "receipt" => Some(Pipeline::Receipt),
            _ => None,
        }
    }

    /// Archive-family pipelines force private scope and sync their artifacts.
    pub fn is_archival(&self) -> bool {
        matches!(self, Pipeline::Archive | Pipeline::Receipt)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-pipeline `/command` directives that adjust extraction or annotate output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    /// Run OCR over a photo instead of a free-form description.
    Ocr,
    /// Ask the vision backend for a description of a photo.
    Describe,
    /// Mark the note for downstream summarisation.
    Summarize,
}

impl Directive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::Ocr => "ocr",
            Directive::Describe => "describe",
            Directive::Summarize => "summarize",
        }
    }
}

/// A parsed `/command`. Closed set; anything else is [`Command::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Pipeline(Pipeline),
    Directive(Directive),
    Unknown(String),
}

impl Command {
    pub fn parse(raw: &str) -> Command {
        let name = raw.trim_start_matches('/').to_ascii_lowercase();
        if let Some(p) = Pipeline::parse(&name) {
            return Command::Pipeline(p);
        }
        match name.as_str() {
            "ocr" => Command::Directive(Directive::Ocr),
            "describe" => Command::Directive(Directive::Describe),
            "summarize" | "summarise" => Command::Directive(Directive::Summarize),
            _ => Command::Unknown(name),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Pipeline(p) => p.as_str(),
            Command::Directive(d) => d.as_str(),
            Command::Unknown(s) => s,
        }
    }
}

/// Where a routing decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationSource {
    ExplicitCommand,
    MetadataHint,
    AiIntent,
    Default,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::ExplicitCommand => "explicit-command",
            ClassificationSource::MetadataHint => "metadata-hint",
            ClassificationSource::AiIntent => "ai-intent",
            ClassificationSource::Default => "default",
        }
    }
}

/// Structured metadata recovered from hints, the intent oracle, or a receipt reader.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ExtractedMetadata {
    /// Fill every unset field from `other`. Fields already set win.
    pub fn fill_from(&mut self, other: &ExtractedMetadata) {
        fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }
        fill(&mut self.doc_type, &other.doc_type);
        fill(&mut self.category, &other.category);
        fill(&mut self.vendor, &other.vendor);
        fill(&mut self.amount, &other.amount);
        fill(&mut self.date, &other.date);
        fill(&mut self.description, &other.description);
        fill(&mut self.details, &other.details);
    }

    /// Metadata carried by `[key:value]` hints.
    pub fn from_hints(metadata: &BTreeMap<String, String>) -> Self {
        let get = |k: &str| metadata.get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            doc_type: get("type"),
            category: get("category"),
            vendor: get("vendor"),
            amount: get("amount").and_then(|a| parse_amount(&a)),
            date: get("date"),
            description: get("description").or_else(|| get("desc")),
            details: get("details"),
        }
    }
}

/// Parse a money amount such as `45.99`, `$45.99` or `45,99`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches(|c: char| !c.is_ascii_digit() && c != '-')
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-')
        .collect();
    let normalized = if cleaned.contains('.') {
        cleaned.replace(',', "")
    } else {
        cleaned.replace(',', ".")
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Output of the classifier/router.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub pipeline: Pipeline,
    pub confidence: f64,
    pub extracted_metadata: ExtractedMetadata,
    pub suggested_tags: BTreeSet<String>,
    pub source: ClassificationSource,
}

/// A binary artifact carried alongside extracted text (photo, document).
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

/// Plain text or markdown produced by an extractor adapter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractedContent {
    pub text: String,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub attachment: Option<Attachment>,
    /// Reduced-fidelity markers; surfaced as `warnings` in frontmatter.
    pub warnings: Vec<String>,
    /// Name of the adapter (and tier) that produced the text.
    pub extractor: String,
}

/// Final artifact committed to the knowledge vault.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultNote {
    pub path: PathBuf,
    pub frontmatter: serde_yaml::Mapping,
    pub body: String,
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SecurityCheck,
    SecurityDecision,
    PipelineOutcome,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::SecurityCheck => "security_check",
            AuditKind::SecurityDecision => "security_decision",
            AuditKind::PipelineOutcome => "pipeline_outcome",
        }
    }
}

/// Result of a single audited check or outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Pass,
    Flagged,
    Fail,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Pass => "pass",
            AuditOutcome::Flagged => "flagged",
            AuditOutcome::Fail => "fail",
        }
    }
}

/// Append-only record of a security decision or terminal pipeline outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub at: i64,
    pub message_id: String,
    pub sender_id: Option<String>,
    pub kind: AuditKind,
    pub check: String,
    pub outcome: AuditOutcome,
    pub detail: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parse_is_closed() {
        assert_eq!(Command::parse("/archive"), Command::Pipeline(Pipeline::Archive));
        assert_eq!(Command::parse("OCR"), Command::Directive(Directive::Ocr));
        assert_eq!(Command::parse("/rm"), Command::Unknown("rm".to_string()));
    }

    #[test]
    fn parse_amount_variants() {
        assert_eq!(parse_amount("45.99"), Some(45.99));
        assert_eq!(parse_amount("$45.99"), Some(45.99));
        assert_eq!(parse_amount("AUD 1,045.50"), Some(1045.5));
        assert_eq!(parse_amount("12,50"), Some(12.5));
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn hint_text_uses_caption_for_binary_content() {
        let msg = Message {
            id: "1:1".into(),
            source: "telegram".into(),
            sender_id: "1".into(),
            content_type: ContentType::Photo,
            payload: Payload::Remote {
                file_id: "f".into(),
                filename: None,
                mime: None,
                size: None,
            },
            caption: Some("#receipt lunch".into()),
            received_at: Utc::now(),
        };
        assert_eq!(msg.hint_text(), "#receipt lunch");
    }

    #[test]
    fn metadata_fill_keeps_existing_fields() {
        let mut a = ExtractedMetadata {
            vendor: Some("Bunnings".into()),
            ..Default::default()
        };
        let b = ExtractedMetadata {
            vendor: Some("Other".into()),
            amount: Some(3.0),
            ..Default::default()
        };
        a.fill_from(&b);
        assert_eq!(a.vendor.as_deref(), Some("Bunnings"));
        assert_eq!(a.amount, Some(3.0));
    }
}
