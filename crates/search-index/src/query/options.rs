//! Match modes, search options and query normalization.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// How the raw query is widened before it reaches the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The query is passed through unchanged.
    Exact,
    /// The last word matches as a prefix.
    #[default]
    TrailingFuzzy,
    /// The first word matches as a suffix.
    LeadingFuzzy,
}

impl MatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::TrailingFuzzy => "trailing_fuzzy",
            Self::LeadingFuzzy => "leading_fuzzy",
        }
    }
}

bitflags! {
    /// Engine search options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SearchOptions: u32 {
        /// Every hit scores zero.
        const NO_RELEVANCE_SCORE = 1;
        /// Any query term may match instead of all of them.
        const SPACE_MEANS_OR     = 2;
        /// Like `SPACE_MEANS_OR`, ranking documents that match more terms higher.
        const FIND_SIMILAR       = 4;
    }
}

/// Rewrites `query` for `mode`. Returns an empty string when nothing is left
/// to search for.
pub fn normalize_query(query: &str, mode: MatchMode) -> String {
    let trimmed = query.trim_matches(|c: char| c.is_whitespace() || c == '*');
    if trimmed.is_empty() {
        return String::new();
    }
    match mode {
        MatchMode::Exact => query.to_string(),
        MatchMode::TrailingFuzzy => format!("{trimmed}*"),
        MatchMode::LeadingFuzzy => format!("*{trimmed}"),
    }
}
