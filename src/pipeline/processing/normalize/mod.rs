//! Identifier normalization ladder.
//!
//! Every raw identifier is expanded into an ordered list of comparison keys,
//! each one more permissive than the last. The rung that produced a key is
//! kept so callers can report how much normalization a match needed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::MatchStage;

static SEPARATOR_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_\s]+").expect("separator pattern is a valid regex"));
static OUTSIDE_KEY_ALPHABET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9-]").expect("key alphabet pattern is a valid regex"));

/// Rungs of the ladder, in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationStage {
    /// Trimmed of surrounding whitespace, otherwise untouched
    Verbatim,
    /// `/` becomes `-`, runs of `-`, `_` and whitespace collapse to one `-`
    Separators,
    /// Everything outside `[A-Za-z0-9-]` removed
    Punctuation,
    /// Lowercased
    CaseFold,
}

impl NormalizationStage {
    pub const ALL: [NormalizationStage; 4] = [
        NormalizationStage::Verbatim,
        NormalizationStage::Separators,
        NormalizationStage::Punctuation,
        NormalizationStage::CaseFold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizationStage::Verbatim => "verbatim",
            NormalizationStage::Separators => "separators",
            NormalizationStage::Punctuation => "punctuation",
            NormalizationStage::CaseFold => "case_fold",
        }
    }

    /// Confidence bucket reported on resolved relationships.
    pub fn match_stage(&self) -> MatchStage {
        match self {
            NormalizationStage::Verbatim => MatchStage::Direct,
            NormalizationStage::Separators | NormalizationStage::Punctuation => MatchStage::Normalized,
            NormalizationStage::CaseFold => MatchStage::Fuzzy,
        }
    }
}

impl fmt::Display for NormalizationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One comparison key and the rung that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub stage: NormalizationStage,
    pub key: String,
}

/// Expand a raw identifier into its candidate ladder.
///
/// Deterministic and total: the result always holds at least one candidate,
/// and a key that an earlier rung already produced is not repeated.
pub fn normalize(raw: &str) -> Vec<Candidate> {
    let verbatim = raw.trim().to_string();
    let separators = canonicalize_separators(&verbatim);
    let punctuation = strip_punctuation(&separators);
    let case_folded = punctuation.to_lowercase();

    let mut ladder: Vec<Candidate> = Vec::with_capacity(NormalizationStage::ALL.len());
    for (stage, key) in NormalizationStage::ALL
        .into_iter()
        .zip([verbatim, separators, punctuation, case_folded])
    {
        if !ladder.iter().any(|candidate| candidate.key == key) {
            ladder.push(Candidate { stage, key });
        }
    }
    ladder
}

/// The most permissive key for a value, used where two values should be
/// treated as equal whenever the last rung says so.
pub fn loosest_key(raw: &str) -> String {
    strip_punctuation(&canonicalize_separators(raw.trim())).to_lowercase()
}

fn canonicalize_separators(value: &str) -> String {
    SEPARATOR_RUN.replace_all(&value.replace('/', "-"), "-").into_owned()
}

fn strip_punctuation(value: &str) -> String {
    OUTSIDE_KEY_ALPHABET.replace_all(value, "").into_owned()
}
