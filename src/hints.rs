//! Inline capture syntax.
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `#tag`, `#parent/child` | tag |
//! | `@handle` | person reference |
//! | `/command` | pipeline or directive (first pipeline command wins) |
//! | `~private`, `~work` | privacy scope |
//! | `[key:value]` | metadata pair, last occurrence of a key wins |
//!
//! Hints may appear anywhere. Recognised hints are removed from the
//! residual text; anything that only looks like a hint (`#`, `/usr/bin`,
//! `~home`, `[a b:c]`) stays in place as plain text. Parsing is pure and
//! never fails.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{ParsedHints, Scope};

static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Za-z][A-Za-z0-9_\-]*):([^\[\]\n]+)\]").expect("metadata regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#([\p{L}\p{N}][\p{L}\p{N}_\-]*(?:/[\p{L}\p{N}_\-]+)*)$").expect("tag regex")
});
static PERSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@([\p{L}\p{N}_][\p{L}\p{N}_.\-]*)$").expect("person regex")
});
static COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/([A-Za-z][A-Za-z0-9_\-]*)$").expect("command regex"));

/// Parse hint syntax out of `text`.
pub fn parse(text: &str) -> ParsedHints {
    let mut hints = ParsedHints::default();

    // Bracketed metadata may contain spaces, so it is lifted out first.
    let without_metadata = METADATA_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let key = caps[1].to_ascii_lowercase();
        let value = caps[2].trim().to_string();
        if value.is_empty() {
            return caps[0].to_string();
        }
        hints.metadata.insert(key, value);
        String::new()
    });

    let mut lines: Vec<String> = Vec::new();
    for line in without_metadata.lines() {
        let mut kept: Vec<&str> = Vec::new();
        let mut removed_any = false;
        for token in line.split_whitespace() {
            if take_hint(token, &mut hints) {
                removed_any = true;
            } else {
                kept.push(token);
            }
        }
        if kept.is_empty() {
            // Keep paragraph breaks, drop lines that held only hints.
            if !removed_any {
                lines.push(String::new());
            }
            continue;
        }
        lines.push(kept.join(" "));
    }

    hints.residual_text = collapse_blank_lines(&lines);
    hints
}

/// Try to consume one whitespace-delimited token as a hint.
fn take_hint(token: &str, hints: &mut ParsedHints) -> bool {
    // Trailing sentence punctuation does not belong to the hint.
    let core = token.trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
    if core.is_empty() {
        return false;
    }

    if let Some(caps) = TAG_RE.captures(core) {
        hints.tags.insert(caps[1].to_string());
        return true;
    }
    if let Some(caps) = PERSON_RE.captures(core) {
        let handle = caps[1].trim_end_matches(['.', '-']);
        if handle.is_empty() {
            return false;
        }
        hints.people.insert(handle.to_string());
        return true;
    }
    if let Some(caps) = COMMAND_RE.captures(core) {
        hints.commands.push(caps[1].to_ascii_lowercase());
        return true;
    }
    match core {
        "~private" => {
            hints.scope = Scope::Private;
            true
        }
        "~work" => {
            hints.scope = Scope::Work;
            true
        }
        _ => false,
    }
}

fn collapse_blank_lines(lines: &[String]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in lines {
        if line.is_empty() && out.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}
