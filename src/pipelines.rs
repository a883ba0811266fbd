//! Pipeline executors.
//!
//! Each pipeline turns extracted content, hints and a routing decision into
//! a [`Draft`]: the vault note to write and, for archival pipelines, the
//! renamed artifact that goes next to it.
//!
//! | Pipeline | Directory | Output |
//! |----------|-----------|--------|
//! | note | `vault.inbox_dir` | note, attachment under `attachments/` |
//! | clip | `vault.clips_dir` | standalone cleaned-up document |
//! | archive | `vault.archive_dir` | structured-name artifact + companion note |
//! | receipt | `vault.receipts_dir` | as archive, plus vendor/date/amount |
//!
//! Archive names follow
//! `{TYPE} - {YYYYMMDD} - {Description} ({Details}) - {CATEGORY}.{ext}`.
//! A file already named that way keeps its name.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value as Yaml};
use tracing::{debug, warn};
use url::Url;

use crate::config::VaultConfig;
use crate::error::ProcessError;
use crate::extract::VisionBackend;
use crate::models::{
    Attachment, ClassificationResult, Directive, ExtractedContent, ExtractedMetadata, Message, ParsedHints,
    Pipeline, Scope, VaultNote,
};
use crate::tags::TagCorrection;

/// Names that are already archive-compliant and must be kept verbatim.
static COMPLIANT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(CONTRACT|RECEIPT|CORRESPONDANCE|DOCUMENT|REPORT)\s*-\s*\d{8}\s*-").expect("compliant name regex")
});
static URL_IN_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'\]\)]+"#).expect("url regex"));
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+•‣◦▪]|\d{1,2}[.)])\s+(.+)$").expect("bullet regex"));
static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:total|amount|due|paid)?[^\d$€£\n]{0,20}[$€£]\s*(\d{1,3}(?:,\d{3})*(?:\.\d{2})?|\d+(?:\.\d{2})?)")
        .expect("amount regex")
});

pub const ARCHIVE_TYPES: &[&str] = &["CONTRACT", "RECEIPT", "CORRESPONDANCE", "DOCUMENT", "REPORT"];
const DEFAULT_CATEGORY: &str = "GENERAL";
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "igshid", "si", "ref", "ref_src", "_hsenc", "_hsmi",
];
const MAX_TITLE_CHARS: usize = 80;
const MAX_KEY_POINTS: usize = 10;

const RECEIPT_PROMPT: &str = "Read this receipt. Reply with only a JSON object \
{\"vendor\": string, \"date\": \"YYYYMMDD\", \"amount\": number} for the merchant, \
purchase date and total paid. Use null for anything you cannot read.";

/// Everything a pipeline may use for one message.
pub struct PipelineInput<'a> {
    pub message: &'a Message,
    pub content: &'a ExtractedContent,
    pub hints: &'a ParsedHints,
    pub classification: &'a ClassificationResult,
    /// Final tag set (hint tags after correction plus suggested tags).
    pub tags: &'a BTreeSet<String>,
    pub directives: &'a [Directive],
    pub tag_corrections: &'a [TagCorrection],
    /// Warnings collected by earlier stages.
    pub warnings: &'a [String],
}

/// A pipeline's output, before it is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub pipeline: Pipeline,
    pub title: String,
    /// Note with a vault-relative path.
    pub note: VaultNote,
    /// Binary artifact and its vault-relative path.
    pub artifact: Option<(PathBuf, Attachment)>,
    /// Copy the outputs to the sync target.
    pub sync: bool,
}

pub struct Executors {
    vault: VaultConfig,
    receipt_reader: Option<Arc<dyn VisionBackend>>,
}

impl Executors {
    pub fn new(vault: VaultConfig, receipt_reader: Option<Arc<dyn VisionBackend>>) -> Self {
        Self { vault, receipt_reader }
    }

    pub async fn execute(&self, input: &PipelineInput<'_>) -> Result<Draft, ProcessError> {
        match input.classification.pipeline {
            Pipeline::Note => Ok(self.note(input)),
            Pipeline::Clip => Ok(self.clip(input)),
            Pipeline::Archive => self.archive(input, Pipeline::Archive, Vec::new()),
            Pipeline::Receipt => {
                let (metadata_warnings, filled) = self.read_receipt(input).await;
                let classification = ClassificationResult {
                    extracted_metadata: filled,
                    ..input.classification.clone()
                };
                let input = PipelineInput {
                    classification: &classification,
                    ..*input
                };
                self.archive(&input, Pipeline::Receipt, metadata_warnings)
            }
        }
    }

    fn note(&self, input: &PipelineInput<'_>) -> Draft {
        let title = note_title(input);
        let stem = format!(
            "{} {}",
            input.message.received_at.format("%Y%m%d-%H%M%S"),
            sanitize_component(&title)
        );

        let mut body = input.content.text.trim().to_string();
        let artifact = input.content.attachment.as_ref().map(|attachment| {
            let name = format!("{} {}", stem, sanitize_component(&attachment.filename));
            let path = Path::new(&self.vault.inbox_dir).join("attachments").join(&name);
            push_block(&mut body, &embed_link(&name, attachment));
            (path, attachment.clone())
        });
        if let Some(url) = &input.content.source_url {
            push_block(&mut body, &format!("Source: <{}>", url));
        }

        let scope = input.hints.scope;
        let frontmatter = frontmatter(input, Pipeline::Note, scope, &title, &[]);
        Draft {
            pipeline: Pipeline::Note,
            title,
            note: VaultNote {
                path: Path::new(&self.vault.inbox_dir).join(format!("{}.md", stem)),
                frontmatter,
                body,
            },
            artifact,
            sync: false,
        }
    }

    fn clip(&self, input: &PipelineInput<'_>) -> Draft {
        let text = strip_tracking_in_text(&input.content.text);
        let source_url = input
            .content
            .source_url
            .as_deref()
            .map(strip_tracking)
            .or_else(|| URL_IN_TEXT_RE.find(&text).map(|m| m.as_str().to_string()));

        let title = input
            .content
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| first_heading_or_line(&text))
            .or_else(|| source_url.as_deref().and_then(domain_of))
            .unwrap_or_else(|| "Clipping".to_string());
        let title = truncate_title(&title);

        let (key_points, content) = restructure(&text);
        let mut body = format!("# {}\n", title);
        if let Some(url) = &source_url {
            body.push_str(&format!("\n> Source: <{}>\n", url));
        }
        if !key_points.is_empty() {
            body.push_str("\n## Key points\n\n");
            for point in &key_points {
                body.push_str(&format!("- {}\n", point));
            }
        }
        let content = strip_leading_heading(&content, &title);
        if !content.trim().is_empty() {
            body.push_str("\n## Content\n\n");
            body.push_str(content.trim());
            body.push('\n');
        }

        let mut extra = Vec::new();
        if let Some(url) = &source_url {
            extra.push(("source_url", Yaml::from(url.clone())));
        }
        let frontmatter = frontmatter(input, Pipeline::Clip, input.hints.scope, &title, &extra);
        let stem = format!(
            "{} {}",
            input.message.received_at.format("%Y%m%d"),
            sanitize_component(&title)
        );
        Draft {
            pipeline: Pipeline::Clip,
            title,
            note: VaultNote {
                path: Path::new(&self.vault.clips_dir).join(format!("{}.md", stem)),
                frontmatter,
                body,
            },
            artifact: None,
            sync: false,
        }
    }

    fn archive(
        &self,
        input: &PipelineInput<'_>,
        pipeline: Pipeline,
        mut stage_warnings: Vec<String>,
    ) -> Result<Draft, ProcessError> {
        let metadata = &input.classification.extracted_metadata;
        let dir = match pipeline {
            Pipeline::Receipt => &self.vault.receipts_dir,
            _ => &self.vault.archive_dir,
        };

        let original = input
            .content
            .attachment
            .as_ref()
            .map(|a| a.filename.clone())
            .or_else(|| input.message.filename().map(str::to_string));
        let ext = original
            .as_deref()
            .and_then(|f| Path::new(f).extension())
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .filter(|_| input.content.attachment.is_some())
            .unwrap_or_else(|| "md".to_string());

        // A compliant name is reused byte for byte, extension case included.
        let kept = original.as_deref().filter(|name| is_compliant_name(name));
        let stem = match kept {
            Some(name) => {
                debug!(name, "keeping archive-compliant filename");
                Path::new(name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| name.to_string())
            }
            None => {
                let date = archive_date(metadata, input.message.received_at)?;
                let description = archive_description(input, metadata, pipeline);
                let details = metadata
                    .details
                    .clone()
                    .or_else(|| (pipeline == Pipeline::Receipt).then(|| metadata.amount.map(format_amount)).flatten());
                let doc_type = match pipeline {
                    Pipeline::Receipt => "RECEIPT".to_string(),
                    _ => metadata.doc_type.clone().unwrap_or_else(|| "DOCUMENT".to_string()),
                };
                let category = metadata.category.clone().unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
                archive_stem(&doc_type, &date, &description, details.as_deref(), &category)?
            }
        };

        let note_path = Path::new(dir).join(format!("{}.md", stem));
        let mut body = input.content.text.trim().to_string();
        let artifact = input.content.attachment.as_ref().map(|attachment| {
            let name = kept
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}.{}", stem, ext));
            let mut renamed = attachment.clone();
            renamed.filename = name.clone();
            push_block(&mut body, &embed_link(&name, attachment));
            (Path::new(dir).join(name), renamed)
        });
        if let Some(url) = &input.content.source_url {
            push_block(&mut body, &format!("Source: <{}>", url));
        }

        let mut extra: Vec<(&str, Yaml)> = Vec::new();
        if let Some(original) = &original {
            extra.push(("original_filename", Yaml::from(original.clone())));
        }
        if let Some(vendor) = &metadata.vendor {
            extra.push(("vendor", Yaml::from(vendor.clone())));
        }
        if let Some(amount) = metadata.amount {
            extra.push(("amount", Yaml::from((amount * 100.0).round() / 100.0)));
        }
        extra.push((
            "category",
            Yaml::from(metadata.category.clone().unwrap_or_else(|| DEFAULT_CATEGORY.to_string())),
        ));
        if let Some(date) = &metadata.date {
            extra.push(("document_date", Yaml::from(date.clone())));
        }

        let title = stem.clone();
        let mut fm = frontmatter(input, pipeline, Scope::Private, &title, &extra);
        if !stage_warnings.is_empty() {
            let mut all: Vec<String> = input.warnings.to_vec();
            all.append(&mut stage_warnings);
            fm.insert(Yaml::from("warnings"), Yaml::from(all));
        }

        Ok(Draft {
            pipeline,
            title,
            note: VaultNote {
                path: note_path,
                frontmatter: fm,
                body,
            },
            artifact,
            sync: true,
        })
    }

    /// Fill missing vendor/date/amount from the receipt image, then from text.
    async fn read_receipt(&self, input: &PipelineInput<'_>) -> (Vec<String>, ExtractedMetadata) {
        let mut metadata = input.classification.extracted_metadata.clone();
        let mut warnings = Vec::new();
        let complete = metadata.vendor.is_some() && metadata.amount.is_some() && metadata.date.is_some();

        let image = input
            .content
            .attachment
            .as_ref()
            .filter(|a| a.mime.as_deref().is_some_and(|m| m.starts_with("image/")));
        if let (false, Some(image)) = (complete, image) {
            match &self.receipt_reader {
                Some(reader) => {
                    let mime = image.mime.as_deref().unwrap_or("image/jpeg");
                    match reader.describe_image(&image.bytes, mime, RECEIPT_PROMPT).await {
                        Ok(reply) => match parse_receipt_reply(&reply) {
                            Some(read) => metadata.fill_from(&read),
                            None => warnings.push("receipt reader returned no usable fields".to_string()),
                        },
                        Err(e) => {
                            warn!(message_id = %input.message.id, error = %e, "receipt reader failed");
                            warnings.push(format!("receipt reader failed: {}", e));
                        }
                    }
                }
                None => warnings.push("receipt reader skipped: vision backend disabled".to_string()),
            }
        }

        if metadata.amount.is_none() {
            let text = format!("{}\n{}", input.hints.residual_text, input.content.text);
            metadata.amount = find_amount(&text);
        }
        (warnings, metadata)
    }
}

#[derive(Debug, Deserialize)]
struct ReceiptReply {
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    amount: Option<serde_json::Value>,
}

/// Parse the receipt reader's JSON reply, tolerating code fences.
fn parse_receipt_reply(reply: &str) -> Option<ExtractedMetadata> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    let parsed: ReceiptReply = serde_json::from_str(reply.get(start..=end)?).ok()?;
    let amount = match parsed.amount {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => crate::models::parse_amount(&s),
        _ => None,
    };
    let metadata = ExtractedMetadata {
        vendor: parsed.vendor.filter(|v| !v.trim().is_empty()),
        date: parsed.date.filter(|d| parse_date(d).is_some()),
        amount,
        ..Default::default()
    };
    (metadata != ExtractedMetadata::default()).then_some(metadata)
}

/// First currency amount in free text.
pub fn find_amount(text: &str) -> Option<f64> {
    AMOUNT_RE
        .captures(text)
        .and_then(|c| crate::models::parse_amount(&c[1]))
}

pub fn is_compliant_name(filename: &str) -> bool {
    COMPLIANT_NAME_RE.is_match(filename)
}

/// Build an archive stem. Fails on an unknown document type.
pub fn archive_stem(
    doc_type: &str,
    date: &str,
    description: &str,
    details: Option<&str>,
    category: &str,
) -> Result<String, ProcessError> {
    let doc_type = doc_type.trim().to_ascii_uppercase();
    if !ARCHIVE_TYPES.contains(&doc_type.as_str()) {
        return Err(ProcessError::Permanent(format!(
            "invalid archive type '{}' (expected one of {})",
            doc_type,
            ARCHIVE_TYPES.join(", ")
        )));
    }
    let description = sanitize_component(description);
    let category = sanitize_component(&category.to_ascii_uppercase());
    let mut stem = format!("{} - {} - {}", doc_type, date, description);
    if let Some(details) = details.map(sanitize_component).filter(|d| !d.is_empty()) {
        stem.push_str(&format!(" ({})", details));
    }
    stem.push_str(&format!(" - {}", category));
    Ok(stem)
}

fn archive_date(metadata: &ExtractedMetadata, received_at: DateTime<Utc>) -> Result<String, ProcessError> {
    match metadata.date.as_deref() {
        Some(raw) => parse_date(raw)
            .map(|d| d.format("%Y%m%d").to_string())
            .ok_or_else(|| ProcessError::Permanent(format!("malformed date metadata '{}'", raw))),
        None => Ok(received_at.format("%Y%m%d").to_string()),
    }
}

/// Accepts `YYYYMMDD`, `YYYY-MM-DD`, `DD/MM/YYYY` and `DD.MM.YYYY`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y%m%d", "%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn archive_description(input: &PipelineInput<'_>, metadata: &ExtractedMetadata, pipeline: Pipeline) -> String {
    let from_text = || {
        let words: Vec<&str> = input.hints.residual_text.split_whitespace().take(6).collect();
        (!words.is_empty()).then(|| words.join(" "))
    };
    let from_filename = || {
        input
            .message
            .filename()
            .and_then(|f| Path::new(f).file_stem())
            .map(|s| s.to_string_lossy().to_string())
    };
    let candidates = match pipeline {
        Pipeline::Receipt => [metadata.vendor.clone(), metadata.description.clone()],
        _ => [metadata.description.clone(), metadata.vendor.clone()],
    };
    candidates
        .into_iter()
        .flatten()
        .find(|d| !d.trim().is_empty())
        .or_else(|| input.content.title.clone())
        .or_else(from_text)
        .or_else(from_filename)
        .unwrap_or_else(|| "Untitled".to_string())
}

fn format_amount(amount: f64) -> String {
    format!("{:.2}", amount)
}

/// Frontmatter shared by every pipeline. `extra` entries are additive.
fn frontmatter(
    input: &PipelineInput<'_>,
    pipeline: Pipeline,
    scope: Scope,
    title: &str,
    extra: &[(&str, Yaml)],
) -> Mapping {
    let mut tags: BTreeSet<String> = input.tags.clone();
    if let Some(scope) = scope.as_str() {
        tags.insert(format!("scope/{}", scope));
    }

    let mut fm = Mapping::new();
    let mut set = |key: &str, value: Yaml| {
        fm.insert(Yaml::from(key), value);
    };
    set("title", Yaml::from(title));
    set("tags", Yaml::from(tags.into_iter().collect::<Vec<_>>()));
    set("source", Yaml::from(input.message.source.clone()));
    set("generation_date", Yaml::from(Utc::now().to_rfc3339()));
    set("captured_at", Yaml::from(input.message.received_at.to_rfc3339()));
    if let Some(scope) = scope.as_str() {
        set("scope", Yaml::from(scope));
    }
    set("pipeline", Yaml::from(pipeline.as_str()));
    set("content_type", Yaml::from(input.message.content_type.as_str()));
    set("message_id", Yaml::from(input.message.id.clone()));
    if !input.hints.people.is_empty() {
        set("people", Yaml::from(input.hints.people.iter().cloned().collect::<Vec<_>>()));
    }
    let mut classification = Mapping::new();
    classification.insert(Yaml::from("source"), Yaml::from(input.classification.source.as_str()));
    classification.insert(Yaml::from("confidence"), Yaml::from(input.classification.confidence));
    set("classification", Yaml::Mapping(classification));
    if !input.content.extractor.is_empty() {
        set("extractor", Yaml::from(input.content.extractor.clone()));
    }
    if input.directives.contains(&Directive::Summarize) {
        set("summarize", Yaml::from(true));
    }
    if !input.tag_corrections.is_empty() {
        let corrections = input
            .tag_corrections
            .iter()
            .map(|c| {
                let mut m = Mapping::new();
                m.insert(Yaml::from("from"), Yaml::from(c.from.clone()));
                m.insert(Yaml::from("to"), Yaml::from(c.to.clone()));
                m.insert(Yaml::from("similarity"), Yaml::from(c.similarity));
                Yaml::Mapping(m)
            })
            .collect::<Vec<_>>();
        set("tag_corrections", Yaml::Sequence(corrections));
    }
    if !input.warnings.is_empty() {
        set("warnings", Yaml::from(input.warnings.to_vec()));
    }
    for (key, value) in extra {
        set(*key, value.clone());
    }
    fm
}

fn note_title(input: &PipelineInput<'_>) -> String {
    input
        .content
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| first_heading_or_line(&input.content.text))
        .or_else(|| input.message.filename().map(str::to_string))
        .map(|t| truncate_title(&t))
        .unwrap_or_else(|| {
            let kind = input.message.content_type.as_str();
            let mut chars = kind.chars();
            let kind: String = chars
                .next()
                .map(|c| c.to_ascii_uppercase())
                .into_iter()
                .chain(chars)
                .collect();
            format!("{} capture", kind)
        })
}

fn first_heading_or_line(text: &str) -> Option<String> {
    text.lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn truncate_title(title: &str) -> String {
    let title = title.trim();
    if title.chars().count() <= MAX_TITLE_CHARS {
        return title.to_string();
    }
    let cut: String = title.chars().take(MAX_TITLE_CHARS).collect();
    match cut.rfind(' ') {
        Some(idx) if idx > MAX_TITLE_CHARS / 2 => cut[..idx].to_string(),
        _ => cut,
    }
}

fn strip_leading_heading(content: &str, title: &str) -> String {
    let trimmed = content.trim_start();
    match trimmed.lines().next() {
        Some(first) if first.trim_start_matches('#').trim() == title => {
            trimmed[first.len()..].trim_start().to_string()
        }
        _ => content.to_string(),
    }
}

/// Normalise bullets and collect them as key points.
fn restructure(text: &str) -> (Vec<String>, String) {
    let mut points = Vec::new();
    let mut out = Vec::new();
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run <= 1 {
                out.push(String::new());
            }
            continue;
        }
        blank_run = 0;
        match BULLET_RE.captures(line) {
            Some(caps) => {
                let item = caps[1].trim().to_string();
                if points.len() < MAX_KEY_POINTS {
                    points.push(item.clone());
                }
                out.push(format!("- {}", item));
            }
            None => out.push(line.trim_end().to_string()),
        }
    }
    (points, out.join("\n"))
}

/// Remove `utm_*` and click-tracking parameters from a URL.
pub fn strip_tracking(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string()
}

fn strip_tracking_in_text(text: &str) -> String {
    URL_IN_TEXT_RE
        .replace_all(text, |caps: &regex::Captures<'_>| strip_tracking(&caps[0]))
        .into_owned()
}

fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_string())
}

fn embed_link(name: &str, attachment: &Attachment) -> String {
    let is_image = attachment.mime.as_deref().is_some_and(|m| m.starts_with("image/"));
    if is_image {
        format!("![[{}]]", name)
    } else {
        format!("[[{}]]", name)
    }
}

fn push_block(body: &mut String, block: &str) {
    if !body.is_empty() {
        body.push_str("\n\n");
    }
    body.push_str(block);
}

/// Make text safe as one path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '#' | '[' | ']' | '^' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches(|c: char| c == '.' || c == ' ').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testing::{message, FakeVision};
    use crate::hints;
    use crate::models::{ClassificationSource, ContentType, Payload};

    fn vault() -> VaultConfig {
        crate::config::parse_config("[db]\npath = \"x.sqlite\"\n[vault]\nroot = \"/vault\"\n")
            .unwrap()
            .vault
    }

    fn classification(pipeline: Pipeline, metadata: ExtractedMetadata) -> ClassificationResult {
        ClassificationResult {
            pipeline,
            confidence: 1.0,
            extracted_metadata: metadata,
            suggested_tags: BTreeSet::new(),
            source: ClassificationSource::ExplicitCommand,
        }
    }

    struct Case {
        message: Message,
        content: ExtractedContent,
        hints: ParsedHints,
        classification: ClassificationResult,
    }

    impl Case {
        fn input(&self) -> PipelineInput<'_> {
            PipelineInput {
                message: &self.message,
                content: &self.content,
                hints: &self.hints,
                classification: &self.classification,
                tags: &self.hints.tags,
                directives: &[],
                tag_corrections: &[],
                warnings: &[],
            }
        }
    }

    fn document_case(filename: &str, caption: &str, pipeline: Pipeline) -> Case {
        let hints = hints::parse(caption);
        let metadata = ExtractedMetadata::from_hints(&hints.metadata);
        Case {
            message: message(
                ContentType::Document,
                Payload::Remote {
                    file_id: "d".into(),
                    filename: Some(filename.into()),
                    mime: Some("application/pdf".into()),
                    size: None,
                },
                Some(caption),
            ),
            content: ExtractedContent {
                text: "Invoice text".into(),
                attachment: Some(Attachment {
                    filename: filename.into(),
                    mime: Some("application/pdf".into()),
                    bytes: b"%PDF".to_vec(),
                }),
                extractor: "document/pdf".into(),
                ..Default::default()
            },
            hints,
            classification: classification(pipeline, metadata),
        }
    }

    #[test]
    fn compliant_names_are_detected() {
        assert!(is_compliant_name("CONTRACT - 20240208 - Lease.pdf"));
        assert!(is_compliant_name("RECEIPT-20231101-Shop.jpg"));
        assert!(!is_compliant_name("Contract - 20240208 - Lease.pdf"));
        assert!(!is_compliant_name("INVOICE - 20240208 - x.pdf"));
    }

    #[tokio::test]
    async fn archive_preserves_compliant_filename() {
        let case = document_case("CONTRACT - 20240208 - Lease.pdf", "/archive", Pipeline::Archive);
        let draft = Executors::new(vault(), None).execute(&case.input()).await.unwrap();
        let (path, artifact) = draft.artifact.unwrap();
        assert_eq!(path, Path::new("Archive/CONTRACT - 20240208 - Lease.pdf"));
        assert_eq!(artifact.filename, "CONTRACT - 20240208 - Lease.pdf");
        assert_eq!(draft.note.path, Path::new("Archive/CONTRACT - 20240208 - Lease.md"));
        assert!(draft.sync);
    }

    #[tokio::test]
    async fn archive_keeps_compliant_name_with_uppercase_extension() {
        let case = document_case("CONTRACT - 20240208 - Lease.PDF", "/archive", Pipeline::Archive);
        let draft = Executors::new(vault(), None).execute(&case.input()).await.unwrap();
        let (path, artifact) = draft.artifact.unwrap();
        assert_eq!(path, Path::new("Archive/CONTRACT - 20240208 - Lease.PDF"));
        assert_eq!(artifact.filename, "CONTRACT - 20240208 - Lease.PDF");
        assert_eq!(draft.note.path, Path::new("Archive/CONTRACT - 20240208 - Lease.md"));
        assert!(draft.note.body.contains("[[CONTRACT - 20240208 - Lease.PDF]]"));
    }

    #[tokio::test]
    async fn archive_builds_structured_name_and_forces_private() {
        let case = document_case(
            "scan0001.pdf",
            "/archive [type:contract] [date:2024-02-08] [description:Flat lease] [details:Unit 4] [category:housing]",
            Pipeline::Archive,
        );
        let draft = Executors::new(vault(), None).execute(&case.input()).await.unwrap();
        assert_eq!(
            draft.artifact.unwrap().0,
            Path::new("Archive/CONTRACT - 20240208 - Flat lease (Unit 4) - HOUSING.pdf")
        );
        let fm = &draft.note.frontmatter;
        assert_eq!(fm.get("scope").and_then(Yaml::as_str), Some("private"));
        let tags = fm.get("tags").and_then(Yaml::as_sequence).unwrap();
        assert!(tags.iter().any(|t| t.as_str() == Some("scope/private")));
        assert_eq!(fm.get("original_filename").and_then(Yaml::as_str), Some("scan0001.pdf"));
    }

    #[tokio::test]
    async fn archive_rejects_unknown_type_and_bad_date() {
        let case = document_case("a.pdf", "[type:memo]", Pipeline::Archive);
        let err = Executors::new(vault(), None).execute(&case.input()).await.unwrap_err();
        assert_eq!(err.class(), crate::models::ErrorClass::Permanent);

        let case = document_case("a.pdf", "[type:report] [date:soon]", Pipeline::Archive);
        let err = Executors::new(vault(), None).execute(&case.input()).await.unwrap_err();
        assert!(err.reason().contains("malformed date"));
    }

    #[tokio::test]
    async fn receipt_names_vendor_and_amount() {
        let mut case = document_case("invoice.pdf", "receipt from Bunnings for plumbing $45.99", Pipeline::Receipt);
        case.classification.extracted_metadata.vendor = Some("Bunnings".into());
        case.classification.extracted_metadata.category = Some("home".into());
        let draft = Executors::new(vault(), None).execute(&case.input()).await.unwrap();
        let name = draft.artifact.unwrap().1.filename;
        let date = case.message.received_at.format("%Y%m%d").to_string();
        assert_eq!(name, format!("RECEIPT - {} - Bunnings (45.99) - HOME.pdf", date));
        assert_eq!(draft.note.frontmatter.get("amount").and_then(Yaml::as_f64), Some(45.99));
        assert!(draft.note.path.starts_with("Archive/Receipts"));
    }

    #[tokio::test]
    async fn receipt_reads_image_fields() {
        let hints = hints::parse("/receipt");
        let case = Case {
            message: message(
                ContentType::Photo,
                Payload::Remote {
                    file_id: "p".into(),
                    filename: None,
                    mime: Some("image/jpeg".into()),
                    size: None,
                },
                Some("/receipt"),
            ),
            content: ExtractedContent {
                attachment: Some(Attachment {
                    filename: "photo.jpg".into(),
                    mime: Some("image/jpeg".into()),
                    bytes: vec![0xFF, 0xD8],
                }),
                extractor: "photo/store".into(),
                ..Default::default()
            },
            hints,
            classification: classification(Pipeline::Receipt, ExtractedMetadata::default()),
        };
        let reader: Arc<dyn VisionBackend> = Arc::new(FakeVision::ok(
            "```json\n{\"vendor\": \"Cafe Nero\", \"date\": \"20240301\", \"amount\": \"12.50\"}\n```",
        ));
        let draft = Executors::new(vault(), Some(reader)).execute(&case.input()).await.unwrap();
        assert_eq!(
            draft.artifact.unwrap().1.filename,
            "RECEIPT - 20240301 - Cafe Nero (12.50) - GENERAL.jpg"
        );
        assert_eq!(draft.note.frontmatter.get("vendor").and_then(Yaml::as_str), Some("Cafe Nero"));
    }

    #[tokio::test]
    async fn note_keeps_scope_and_tags() {
        let hints = hints::parse("~private This is a personal health note #health");
        let case = Case {
            message: message(
                ContentType::Text,
                Payload::Text {
                    text: "~private This is a personal health note #health".into(),
                },
                None,
            ),
            content: ExtractedContent {
                text: hints.residual_text.clone(),
                extractor: "text".into(),
                ..Default::default()
            },
            classification: classification(Pipeline::Note, ExtractedMetadata::default()),
            hints,
        };
        let draft = Executors::new(vault(), None).execute(&case.input()).await.unwrap();
        assert_eq!(draft.note.body, "This is a personal health note");
        assert!(draft.note.path.starts_with("Inbox"));
        let fm = &draft.note.frontmatter;
        assert_eq!(fm.get("scope").and_then(Yaml::as_str), Some("private"));
        let tags: Vec<&str> = fm
            .get("tags")
            .and_then(Yaml::as_sequence)
            .unwrap()
            .iter()
            .filter_map(Yaml::as_str)
            .collect();
        assert_eq!(tags, vec!["health", "scope/private"]);
        assert!(!draft.sync);
    }

    #[tokio::test]
    async fn clip_cleans_links_and_extracts_points() {
        let text = "# Async Rust\n\nIntro paragraph.\n\n\n\n* first point\n• second point\n\nRead more https://example.com/post?utm_source=tw&id=3&fbclid=abc";
        let hints = hints::parse("/clip");
        let case = Case {
            message: message(ContentType::Url, Payload::Text { text: "/clip https://example.com".into() }, None),
            content: ExtractedContent {
                text: text.into(),
                title: Some("Async Rust".into()),
                source_url: Some("https://example.com/post?utm_medium=social&id=3".into()),
                extractor: "url/page".into(),
                ..Default::default()
            },
            hints,
            classification: classification(Pipeline::Clip, ExtractedMetadata::default()),
        };
        let draft = Executors::new(vault(), None).execute(&case.input()).await.unwrap();
        let body = &draft.note.body;
        assert!(body.starts_with("# Async Rust\n\n> Source: <https://example.com/post?id=3>"));
        assert!(body.contains("## Key points\n\n- first point\n- second point\n"));
        assert!(body.contains("Read more https://example.com/post?id=3"));
        assert!(!body.contains("utm_"));
        assert!(!body.contains("\n\n\n"));
        assert_eq!(body.matches("# Async Rust").count(), 1);
        assert!(draft.note.path.starts_with("Clips"));
    }

    #[test]
    fn tracking_parameters_are_removed() {
        assert_eq!(strip_tracking("https://a.com/x?utm_source=x"), "https://a.com/x");
        assert_eq!(strip_tracking("https://a.com/x?q=1&gclid=2"), "https://a.com/x?q=1");
        assert_eq!(strip_tracking("not a url"), "not a url");
    }

    #[test]
    fn amounts_in_text() {
        assert_eq!(find_amount("archive this receipt from Bunnings for plumbing $45.99"), Some(45.99));
        assert_eq!(find_amount("Total: € 1,204.00"), Some(1204.0));
        assert_eq!(find_amount("no money here"), None);
    }

    #[test]
    fn components_are_path_safe() {
        assert_eq!(sanitize_component("a/b: c?  d."), "a b c d");
        assert_eq!(sanitize_component("../etc"), "etc");
    }
}
