//! Fuzzy tag correction against a configured vocabulary.
//!
//! Dictated tags come through transcription misspelled (`#recipies`,
//! `#projekt/alpha`). Each tag outside the vocabulary is compared with every
//! vocabulary entry by normalised Levenshtein similarity:
//!
//! - no candidate at or above the threshold: kept as written
//! - one clear best candidate: applied when `auto_correct` is on, otherwise
//!   kept and queued for review as a suggestion
//! - two candidates within [`AMBIGUITY_MARGIN`] of each other: kept and
//!   queued for review, never auto-corrected

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::TagsConfig;

/// Candidates closer than this are a tie.
pub const AMBIGUITY_MARGIN: f64 = 0.05;

/// A tag rewritten to its vocabulary form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagCorrection {
    pub from: String,
    pub to: String,
    pub similarity: f64,
}

/// A tag that needs a human decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagReview {
    pub tag: String,
    pub candidates: Vec<(String, f64)>,
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagOutcome {
    pub tags: BTreeSet<String>,
    pub corrections: Vec<TagCorrection>,
    pub reviews: Vec<TagReview>,
}

pub struct TagCorrector {
    vocabulary: Vec<String>,
    threshold: f64,
    auto_correct: bool,
}

impl TagCorrector {
    pub fn from_config(config: &TagsConfig) -> Self {
        Self {
            vocabulary: config
                .vocabulary
                .iter()
                .map(|t| t.trim().trim_start_matches('#').to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            threshold: config.similarity_threshold,
            auto_correct: config.auto_correct,
        }
    }

    pub fn apply(&self, tags: &BTreeSet<String>) -> TagOutcome {
        let mut outcome = TagOutcome::default();
        for tag in tags {
            let normalized = tag.to_lowercase();
            if self.vocabulary.is_empty()
                || normalized.starts_with("scope/")
                || self.vocabulary.contains(&normalized)
            {
                outcome.tags.insert(tag.clone());
                continue;
            }

            let mut candidates: Vec<(String, f64)> = self
                .vocabulary
                .iter()
                .map(|v| (v.clone(), similarity(&normalized, v)))
                .filter(|(_, s)| *s >= self.threshold)
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

            let Some((best, best_score)) = candidates.first().cloned() else {
                outcome.tags.insert(tag.clone());
                continue;
            };
            let ambiguous = candidates
                .get(1)
                .is_some_and(|(_, s)| best_score - s < AMBIGUITY_MARGIN);

            if self.auto_correct && !ambiguous {
                outcome.tags.insert(best.clone());
                outcome.corrections.push(TagCorrection {
                    from: tag.clone(),
                    to: best,
                    similarity: round3(best_score),
                });
            } else {
                outcome.tags.insert(tag.clone());
                candidates.truncate(3);
                outcome.reviews.push(TagReview {
                    tag: tag.clone(),
                    candidates: candidates.into_iter().map(|(c, s)| (c, round3(s))).collect(),
                    ambiguous,
                });
            }
        }
        outcome
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// `1 - distance / max_len` over chars; 1.0 for two empty strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
