//! URLs → clean markdown.
//!
//! Generic pages are fetched and reduced to markdown (title, headings,
//! paragraphs, list items, links). YouTube links take the caption-track
//! path instead and become a transcript.
//!
//! Outbound requests are guarded against SSRF: only http(s), and no
//! loopback, private, link-local, unspecified or cloud metadata hosts,
//! checked on the literal host, on every resolved address and on every
//! redirect hop. Response bodies are capped at `extract.url.max_bytes`.

use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use tracing::{debug, warn};
use url::{Host, Url};

use super::{ExtractInput, Extractor, PayloadResolver};
use crate::config::UrlFetchConfig;
use crate::error::ExtractError;
use crate::models::ExtractedContent;

const MAX_REDIRECTS: usize = 5;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'\]\)]+"#).expect("url regex"));

/// First http(s) URL in `text`, without trailing sentence punctuation.
pub fn find_url(text: &str) -> Option<String> {
    URL_RE
        .find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string())
}

/// Whether `text` is nothing but one URL (surrounding whitespace allowed).
pub fn is_single_url(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty()
        && !trimmed.contains(char::is_whitespace)
        && find_url(trimmed).is_some_and(|u| u.len() + 1 >= trimmed.len())
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || (o[0] == 100 && (64..128).contains(&o[1]))
                || matches!((o[0], o[1], o[2]), (192, 0, 2) | (198, 51, 100) | (203, 0, 113))
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_blocked_ip(IpAddr::V4(v4)))
        }
    }
}

fn is_blocked_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_blocked_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_blocked_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => {
            let d = domain.trim_end_matches('.').to_ascii_lowercase();
            d == "localhost" || d.ends_with(".localhost") || d == "metadata.google.internal"
        }
        None => true,
    }
}

/// Parse and statically vet a URL for fetching.
pub fn check_url(raw: &str, allow_private: bool) -> Result<Url, ExtractError> {
    let url = Url::parse(raw).map_err(|e| ExtractError::BlockedUrl(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ExtractError::BlockedUrl(format!(
            "scheme '{}' not allowed",
            url.scheme()
        )));
    }
    if !allow_private && is_blocked_host(&url) {
        return Err(ExtractError::BlockedUrl(format!(
            "{} resolves to a private or reserved address",
            url.host_str().unwrap_or_default()
        )));
    }
    Ok(url)
}

/// YouTube video id for watch, shorts, embed and youtu.be links.
pub fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    let candidate = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "music.youtube.com" => {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("shorts") | Some("embed") | Some("live") => segments.next().map(str::to_string),
                _ => None,
            }
        }
        _ => None,
    }?;
    let valid = candidate.len() == 11
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(candidate)
}

pub struct UrlExtractor {
    client: reqwest::Client,
    config: UrlFetchConfig,
}

impl UrlExtractor {
    pub fn new(config: &UrlFetchConfig) -> Result<Self, ExtractError> {
        let allow_private = config.allow_private_hosts;
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if !allow_private && is_blocked_host(attempt.url()) {
                attempt.error("redirect to a private or reserved address")
            } else {
                attempt.follow()
            }
        });
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(policy)
            .build()
            .map_err(|e| ExtractError::ServiceUnavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Resolve the host and reject any private address among the results.
    async fn check_resolved(&self, url: &Url) -> Result<(), ExtractError> {
        if self.config.allow_private_hosts {
            return Ok(());
        }
        let Some(Host::Domain(domain)) = url.host() else {
            return Ok(());
        };
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((domain, port))
            .await
            .map_err(|e| ExtractError::Fetch(format!("resolving {}: {}", domain, e)))?;
        for addr in addrs {
            if is_blocked_ip(addr.ip()) {
                return Err(ExtractError::BlockedUrl(format!(
                    "{} resolves to {}",
                    domain,
                    addr.ip()
                )));
            }
        }
        Ok(())
    }

    /// GET with status classification and a body cap. Returns (final url, content type, body, truncated).
    async fn fetch(&self, url: &Url) -> Result<(Url, String, Vec<u8>, bool), ExtractError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ExtractError::Fetch(e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ExtractError::Fetch(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(ExtractError::Unsupported(format!("{} returned {}", url, status)));
        }
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
            .unwrap_or_default();

        let max = self.config.max_bytes;
        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ExtractError::Fetch(e.to_string()))?
        {
            let room = max.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok((final_url, content_type, body, truncated))
    }

    async fn fetch_page(&self, url: &Url) -> Result<ExtractedContent, ExtractError> {
        self.check_resolved(url).await?;
        let (final_url, content_type, body, truncated) = self.fetch(url).await?;
        let mut content = ExtractedContent {
            source_url: Some(final_url.to_string()),
            ..Default::default()
        };
        match content_type.as_str() {
            "text/html" | "application/xhtml+xml" | "" => {
                let doc = html_to_markdown(&String::from_utf8_lossy(&body));
                content.title = doc.title;
                content.text = doc.body;
                content.extractor = "url/html".to_string();
            }
            "text/plain" | "text/markdown" => {
                content.text = String::from_utf8_lossy(&body).trim().to_string();
                content.extractor = "url/text".to_string();
            }
            super::document::MIME_PDF if !truncated => {
                content.text = super::document::extract_text(&body, super::document::MIME_PDF)?;
                content.extractor = "url/pdf".to_string();
            }
            other => {
                return Err(ExtractError::Unsupported(format!(
                    "unsupported content type '{}' at {}",
                    other, final_url
                )))
            }
        }
        if truncated {
            content
                .warnings
                .push(format!("content truncated at {} bytes", self.config.max_bytes));
        }
        Ok(content)
    }

    async fn fetch_transcript(&self, video_id: &str) -> Result<Option<String>, ExtractError> {
        let endpoint = Url::parse_with_params(
            &self.config.transcript_endpoint,
            &[("v", video_id), ("lang", "en")],
        )
        .map_err(|e| ExtractError::ServiceUnavailable(format!("transcript endpoint: {}", e)))?;
        let (_, _, body, _) = match self.fetch(&endpoint).await {
            Ok(fetched) => fetched,
            Err(ExtractError::Unsupported(reason)) => {
                debug!(video_id, %reason, "no caption track");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let text = parse_caption_track(&body)?;
        Ok((!text.is_empty()).then_some(text))
    }
}

#[async_trait]
impl Extractor for UrlExtractor {
    fn name(&self) -> &str {
        "url"
    }

    async fn extract(
        &self,
        input: &ExtractInput<'_>,
        _resolver: &dyn PayloadResolver,
    ) -> Result<ExtractedContent, ExtractError> {
        let source_text = input
            .message
            .payload
            .text()
            .unwrap_or(input.residual_text);
        let raw = find_url(source_text)
            .ok_or_else(|| ExtractError::Unsupported("no URL in message".to_string()))?;
        let url = check_url(&raw, self.config.allow_private_hosts)?;

        if let Some(video_id) = youtube_video_id(&url) {
            match self.fetch_transcript(&video_id).await? {
                Some(transcript) => {
                    return Ok(ExtractedContent {
                        text: transcript,
                        title: Some(format!("YouTube video {}", video_id)),
                        source_url: Some(url.to_string()),
                        extractor: "url/youtube".to_string(),
                        ..Default::default()
                    })
                }
                None => {
                    warn!(message_id = %input.message.id, video_id, "no transcript; fetching page");
                    let mut content = self.fetch_page(&url).await?;
                    content.warnings.push("youtube transcript unavailable".to_string());
                    return Ok(content);
                }
            }
        }

        self.fetch_page(&url).await
    }
}

/// Join caption-track `<text>` segments into one transcript.
pub fn parse_caption_track(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_segment = false;
    let mut segments: Vec<String> = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"text" => {
                in_segment = true;
                segments.push(String::new());
            }
            Ok(Event::Text(te)) if in_segment => {
                if let Some(last) = segments.last_mut() {
                    last.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"text" => in_segment = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Fetch(format!("caption track: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(segments
        .iter()
        .map(|s| collapse_spaces(&decode_entities(s)))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" "))
}

/// Markdown reduction of an HTML page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HtmlDocument {
    pub title: Option<String>,
    pub body: String,
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("title regex"));
static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"));
static DROP_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        "head", "title", "script", "style", "noscript", "svg", "nav", "footer", "iframe", "template", "form",
    ]
    .iter()
    .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).expect("drop regex"))
    .collect()
});
static MAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:main|article)\b[^>]*>(.*)</(?:main|article)\s*>").expect("main regex")
});
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<h([1-6])\b[^>]*>(.*?)</h[1-6]\s*>").expect("heading regex")
});
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a\s*>"#).expect("link regex")
});
static LI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<li\b[^>]*>").expect("li regex"));
static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("br regex"));
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(?:p|div|section|article|main|header|ul|ol|table|tr|blockquote|pre|figure)\b[^>]*>")
        .expect("block regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"));
static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|\d+);").expect("entity regex"));

fn decode_entities(text: &str) -> String {
    let numeric = NUMERIC_ENTITY_RE.replace_all(text, |c: &Captures<'_>| {
        let raw = &c[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    numeric
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_tags(fragment: &str) -> String {
    collapse_spaces(&decode_entities(&TAG_RE.replace_all(fragment, " ")))
}

/// Reduce HTML to markdown. Regex-based; tolerant of malformed markup.
pub fn html_to_markdown(html: &str) -> HtmlDocument {
    let title = TITLE_RE
        .captures(html)
        .map(|c| strip_tags(&c[1]))
        .filter(|t| !t.is_empty());

    let mut s = COMMENT_RE.replace_all(html, "").into_owned();
    for re in DROP_RES.iter() {
        s = re.replace_all(&s, "").into_owned();
    }
    if let Some(main) = MAIN_RE.captures(&s).map(|c| c[1].to_string()) {
        s = main;
    }

    s = HEADING_RE
        .replace_all(&s, |c: &Captures<'_>| {
            let level: usize = c[1].parse().unwrap_or(1);
            format!("\n\n{} {}\n\n", "#".repeat(level), strip_tags(&c[2]))
        })
        .into_owned();
    s = LINK_RE
        .replace_all(&s, |c: &Captures<'_>| {
            let text = strip_tags(&c[2]);
            let href = &c[1];
            if text.is_empty() {
                String::new()
            } else if href.starts_with("http://") || href.starts_with("https://") {
                format!("[{}]({})", text, href)
            } else {
                text
            }
        })
        .into_owned();
    s = LI_RE.replace_all(&s, "\n- ").into_owned();
    s = BR_RE.replace_all(&s, "\n").into_owned();
    s = BLOCK_RE.replace_all(&s, "\n\n").into_owned();
    s = TAG_RE.replace_all(&s, "").into_owned();
    let s = decode_entities(&s);

    let mut lines: Vec<String> = Vec::new();
    for line in s.lines() {
        let line = collapse_spaces(line);
        if line.is_empty() || line == "-" {
            if lines.last().is_some_and(|l| !l.is_empty()) {
                lines.push(String::new());
            }
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    HtmlDocument {
        title,
        body: lines.join("\n"),
    }
}
