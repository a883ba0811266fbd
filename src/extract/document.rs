//! Documents → text, in three fidelity tiers.
//!
//! 1. Format-specific extraction: PDF, DOCX, PPTX, XLSX, plain text,
//!    markdown, CSV, JSON and HTML.
//! 2. Printable-text salvage over the raw bytes when tier 1 fails or
//!    yields nothing.
//! 3. Store-only: the file is kept as an attachment with a warning.
//!
//! Only an empty or oversized payload fails the message. OOXML entries
//! are read with a decompression bound (zip-bomb protection) and a PDF
//! parser panic is contained as a tier-1 failure.

use std::io::Read;

use async_trait::async_trait;
use tracing::warn;

use super::{effective_mime, ExtractInput, Extractor, PayloadResolver};
use crate::error::ExtractError;
use crate::models::{Attachment, ExtractedContent};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Largest document accepted at all.
const MAX_DOCUMENT_BYTES: usize = 50 * 1024 * 1024;
const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Salvaged runs shorter than this are noise.
const MIN_SALVAGE_RUN: usize = 8;
const MIN_SALVAGE_ALNUM: usize = 20;

pub struct DocumentExtractor;

#[async_trait]
impl Extractor for DocumentExtractor {
    fn name(&self) -> &str {
        "document"
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
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(ExtractError::Unsupported(format!(
                "document exceeds {} bytes",
                MAX_DOCUMENT_BYTES
            )));
        }
        let mime = effective_mime(payload.mime(), payload.filename(), &bytes);
        let filename = payload
            .filename()
            .map(str::to_string)
            .unwrap_or_else(|| "document".to_string());

        let (bytes, tier1) = {
            let mime = mime.clone().unwrap_or_default();
            tokio::task::spawn_blocking(move || {
                let result = extract_text(&bytes, &mime);
                (bytes, result)
            })
            .await
            .map_err(|e| ExtractError::Unsupported(format!("extraction task failed: {}", e)))?
        };

        let mut content = ExtractedContent::default();
        match tier1 {
            Ok(text) if !text.trim().is_empty() => {
                content.text = text.trim().to_string();
                content.extractor = format!("document/{}", format_label(mime.as_deref()));
            }
            other => {
                let reason = match other {
                    Err(e) => e.to_string(),
                    Ok(_) => "no text found".to_string(),
                };
                warn!(message_id = %input.message.id, %reason, "format extraction failed; degrading");
                match salvage_printable(&bytes) {
                    Some(text) => {
                        content.text = text;
                        content.extractor = "document/salvage".to_string();
                        content
                            .warnings
                            .push(format!("lossy text salvage: {}", reason));
                    }
                    None => {
                        content.extractor = "document/store".to_string();
                        content
                            .warnings
                            .push(format!("text extraction unavailable: {}", reason));
                    }
                }
            }
        }

        content.attachment = Some(Attachment {
            filename,
            mime,
            bytes,
        });
        Ok(content)
    }
}

fn format_label(mime: Option<&str>) -> &'static str {
    match mime {
        Some(MIME_PDF) => "pdf",
        Some(MIME_DOCX) => "docx",
        Some(MIME_PPTX) => "pptx",
        Some(MIME_XLSX) => "xlsx",
        Some("text/html") => "html",
        _ => "text",
    }
}

/// Format-specific (tier 1) extraction.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        "text/html" | "application/xhtml+xml" => {
            Ok(super::url::html_to_markdown(&String::from_utf8_lossy(bytes)).body)
        }
        "text/plain" | "text/markdown" | "text/csv" | "application/json" => std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| ExtractError::Unsupported(format!("not UTF-8 text: {}", e))),
        _ => Err(ExtractError::Unsupported(if content_type.is_empty() {
            "unknown document type".to_string()
        } else {
            content_type.to_string()
        })),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(result) => result.map_err(|e| ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf("parser panicked".to_string())),
    }
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Numbered parts (`prefix{N}.xml`) in numeric order.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    text_runs(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_parts(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = text_runs(&xml)?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

/// Concatenate `<*:t>` runs, one line per `<*:p>` paragraph.
fn text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let mut sheets = Vec::new();
    for name in numbered_parts(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared_strings)?;
        if !cells.is_empty() {
            sheets.push(cells);
        }
    }
    Ok(sheets.join("\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s");
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if shared {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

/// Tier 2: keep runs of printable text long enough to be words.
fn salvage_printable(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    fn flush(current: &mut String, runs: &mut Vec<String>) {
        let run = current.trim();
        let letters = run.chars().filter(|c| c.is_alphabetic()).count();
        if run.chars().count() >= MIN_SALVAGE_RUN && letters * 2 >= run.chars().count() {
            runs.push(run.to_string());
        }
        current.clear();
    }

    let mut runs: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch.is_ascii_punctuation() || ch == ' ' {
            current.push(ch);
        } else {
            flush(&mut current, &mut runs);
        }
    }
    flush(&mut current, &mut runs);

    let joined = runs.join("\n");
    let alnum = joined.chars().filter(|c| c.is_alphanumeric()).count();
    (alnum >= MIN_SALVAGE_ALNUM).then_some(joined)
}
