//! Compiled regex patterns for reading assistant output.
//!
//! The limit phrases are the only contract we have with the assistant's
//! free-text log and CLI output. Update these when its wording changes.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

// ═══════════════════════════════════════════════════════════════════════════════
// Rate-Limit / Cooldown Phrases
// ═══════════════════════════════════════════════════════════════════════════════

const LIMIT_PHRASES: &[&str] = &[
    r"(?i)5\s*-?\s*hour\s+limit\s+reached",
    r"(?i)you'?ve\s+reached[\s\S]{0,40}limit",
    r"(?i)rate\s*limit[\s\S]{0,20}reached",
    r"(?i)session\s+limit[\s\S]{0,20}reached",
    r"(?i)cool\s*down|cooldown",
    r"(?i)come\s+back\s+in\s+\d+",
    r"(?i)try\s+again\s+in\s+\d+",
];

pub static RE_LIMIT_PHRASES: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new(LIMIT_PHRASES).unwrap());

/// Returns true if any limit phrase occurs in `text`.
pub fn contains_limit_phrase(text: &str) -> bool {
    RE_LIMIT_PHRASES.is_match(text)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Process Listing
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
