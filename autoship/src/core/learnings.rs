//! Heuristic mining of "learnings" from free-text agent transcripts.
//!
//! This is best-effort enrichment for future prompts. False positives and
//! misses are expected; nothing downstream depends on the result for
//! correctness.

use std::sync::LazyLock;

use regex::Regex;

/// Marker the coding agent prints once it considers the task done.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

pub const MAX_LEARNINGS: usize = 10;
const MIN_LEN: usize = 10;
const MAX_LEN: usize = 200;

static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:discovered|learned) that\s+([^.\n]+)",
        r"(?i)\bpattern:\s*([^\n]+)",
        r"(?i)\bnote:\s*([^\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("learning pattern should be valid"))
    .collect()
});

/// True if the transcript contains the completion marker.
pub fn is_complete(transcript: &str) -> bool {
    transcript.contains(COMPLETION_MARKER)
}

/// Extract up to [`MAX_LEARNINGS`] short declarative sentences from `text`.
///
/// Matches are trimmed, stripped of a trailing period, kept only when 10–200
/// characters long, and deduplicated in first-seen order (patterns are applied
/// in turn, so earlier patterns win ordering).
pub fn extract_learnings(text: &str) -> Vec<String> {
    let mut learnings: Vec<String> = Vec::new();
    for pattern in PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            let Some(m) = caps.get(1) else {
                continue;
            };
            let candidate = m.as_str().trim().trim_end_matches('.').trim();
            let len = candidate.chars().count();
            if !(MIN_LEN..=MAX_LEN).contains(&len) {
                continue;
            }
            if learnings.iter().any(|l| l == candidate) {
                continue;
            }
            learnings.push(candidate.to_string());
            if learnings.len() == MAX_LEARNINGS {
                return learnings;
            }
        }
    }
    learnings
}
