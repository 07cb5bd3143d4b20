//! Issue correlation: decides whether two issues describe the same problem.
//!
//! Grouping is deliberately permissive. Any single signal is enough once the two
//! issues fall inside the time window.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::Issue;

/// Domain vocabulary used for keyword overlap.
pub const DOMAIN_KEYWORDS: &[&str] = &[
    "pot",
    "chips",
    "timer",
    "timeout",
    "validation",
    "mismatch",
    "lost",
    "bet",
    "player",
    "table",
    "hand",
];

/// Tunable thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Maximum distance between two issues' timestamps.
    pub window_seconds: u64,
    /// Minimum number of shared domain keywords.
    pub min_shared_keywords: usize,
    /// Same-source similarity must exceed this.
    pub related_similarity: f64,
    /// Similarity above this marks a duplicate.
    pub duplicate_similarity: f64,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            window_seconds: 30,
            min_shared_keywords: 2,
            related_similarity: 0.5,
            duplicate_similarity: 0.8,
        }
    }
}

/// Which signal linked two issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    ResourceId,
    IssueType,
    StackLocation,
    SharedKeywords,
    SimilarText,
}

/// `related()` with the default settings and an explicit window.
pub fn related(a: &Issue, b: &Issue, window_seconds: u64) -> bool {
    let settings = CorrelationSettings {
        window_seconds,
        ..CorrelationSettings::default()
    };
    relation(a, b, &settings).is_some()
}

/// The first signal (in evaluation order) that links `a` and `b`, or `None`.
pub fn relation(a: &Issue, b: &Issue, settings: &CorrelationSettings) -> Option<Relation> {
    let gap = (a.detected_at - b.detected_at).num_milliseconds().unsigned_abs();
    if gap > settings.window_seconds.saturating_mul(1000) {
        return None;
    }

    if a.resource_id.is_some() && a.resource_id == b.resource_id {
        return Some(Relation::ResourceId);
    }
    if a.issue_type != "general" && a.issue_type == b.issue_type {
        return Some(Relation::IssueType);
    }
    if a.stack_location.is_some() && a.stack_location == b.stack_location {
        return Some(Relation::StackLocation);
    }
    if shared_keywords(&a.message, &b.message) >= settings.min_shared_keywords {
        return Some(Relation::SharedKeywords);
    }
    if a.source == b.source && similarity(&a.message, &b.message) > settings.related_similarity {
        return Some(Relation::SimilarText);
    }
    None
}

/// Whether `candidate` duplicates `existing` (text similarity above threshold).
pub fn is_duplicate(existing: &Issue, candidate: &Issue, threshold: f64) -> bool {
    similarity(&existing.message, &candidate.message) > threshold
}

/// Word-overlap ratio: shared distinct words over the larger word set, counting
/// only words longer than two characters. Returns 0.0 when either side is empty.
pub fn similarity(a: &str, b: &str) -> f64 {
    let wa = words(a);
    let wb = words(b);
    let larger = wa.len().max(wb.len());
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    wa.intersection(&wb).count() as f64 / larger as f64
}

/// Number of domain keywords present in both messages.
pub fn shared_keywords(a: &str, b: &str) -> usize {
    let wa = tokens(a);
    let wb = tokens(b);
    DOMAIN_KEYWORDS
        .iter()
        .filter(|k| wa.contains(**k) && wb.contains(**k))
        .count()
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn words(text: &str) -> HashSet<String> {
    tokens(text)
        .into_iter()
        .filter(|w| w.chars().count() > 2)
        .collect()
}
