//! Candidate short codes for engine keys that must be unique across tenants
//! (company abbreviations and the like).
//!
//! Sequence for base `AC`: `AC`, `AC2`..`AC6`, `AC` + last four timestamp
//! digits, `AC` + four entropy chars, `T` + eight entropy chars, then further
//! entropy-derived ids. Everything here is pure; the caller supplies the seed.

use chrono::Utc;
use uuid::Uuid;

const NUMBERED_SUFFIXES: std::ops::RangeInclusive<u32> = 2..=6;
const MAX_ABBREVIATION_LEN: usize = 5;

/// Inputs for the non-numbered candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSeed {
    pub timestamp: i64,
    /// Uppercase ASCII hex, at least 8 chars.
    entropy: String,
}

impl CandidateSeed {
    /// Non-hex characters in `entropy` are dropped; short input is padded
    /// with `0`.
    pub fn new(timestamp: i64, entropy: impl AsRef<str>) -> Self {
        let mut entropy: String = entropy
            .as_ref()
            .chars()
            .filter(char::is_ascii_hexdigit)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        while entropy.len() < 8 {
            entropy.push('0');
        }
        Self { timestamp, entropy }
    }

    pub fn entropy(&self) -> &str {
        &self.entropy
    }

    pub fn fresh() -> Self {
        Self::new(Utc::now().timestamp(), Uuid::new_v4().simple().to_string())
    }
}

/// First candidate in the sequence that is not in `already_tried`.
pub fn next_candidate(base: &str, already_tried: &[String], seed: &CandidateSeed) -> String {
    let base = base.trim().to_uppercase();
    let tried = |candidate: &String| already_tried.iter().any(|t| t.eq_ignore_ascii_case(candidate));

    let numbered = std::iter::once(base.clone())
        .chain(NUMBERED_SUFFIXES.map(|n| format!("{base}{n}")));
    let seeded = [
        format!("{base}{:04}", seed.timestamp.rem_euclid(10_000)),
        format!("{base}{}", &seed.entropy[..4]),
        format!("T{}", &seed.entropy[..8]),
    ];
    let windows = (1..=seed.entropy.len().saturating_sub(8))
        .map(|start| format!("T{}", &seed.entropy[start..start + 8]));
    let counter = (1u64..).map(|n| format!("T{}{n}", &seed.entropy[..4]));

    numbered
        .chain(seeded)
        .chain(windows)
        .chain(counter)
        .find(|candidate| !candidate.is_empty() && !tried(candidate))
        .unwrap_or_else(|| format!("T{}", seed.entropy))
}

/// Derive an abbreviation from a human-readable name: word initials, or the
/// first letters of a single-word name.
pub fn abbreviate(name: &str) -> String {
    let words: Vec<&str> = name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let initials: String = words
        .iter()
        .filter_map(|w| w.chars().next())
        .take(MAX_ABBREVIATION_LEN)
        .collect();

    let abbr = if initials.chars().count() >= 2 {
        initials
    } else {
        words.concat().chars().take(3).collect()
    };

    if abbr.is_empty() {
        "T".to_string()
    } else {
        abbr.to_uppercase()
    }
}
