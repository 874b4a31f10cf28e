//! Term extraction shared by indexing and query parsing.
//!
//! A term is a lowercase run of alphanumerics. `.`, `_`, `-` and `'` stay
//! inside a term when both neighbours are alphanumeric, so `report.txt`,
//! `snake_case` and `don't` are single terms. Combining marks stay attached
//! to the letter they follow.

use std::iter::Peekable;
use std::str::Chars;

use super::text::is_combining_mark;

fn is_joiner(c: char) -> bool {
    matches!(c, '.' | '_' | '-' | '\'')
}

/// Splits `text` into lowercase terms, in order, duplicates kept.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut chars: Peekable<Chars<'_>> = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || (is_combining_mark(c) && !current.is_empty()) {
            current.extend(c.to_lowercase());
            continue;
        }
        let joins = is_joiner(c)
            && !current.is_empty()
            && chars.peek().is_some_and(|next| next.is_alphanumeric());
        if joins {
            current.push(c);
        } else if !current.is_empty() {
            terms.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms
}

/// How a query term matches index terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermMatch {
    Exact,
    Prefix,
    Suffix,
    Substring,
}

/// One query term with its wildcard placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermPattern {
    pub text: String,
    pub matching: TermMatch,
}

impl TermPattern {
    pub fn matches(&self, term: &str) -> bool {
        match self.matching {
            TermMatch::Exact => term == self.text,
            TermMatch::Prefix => term.starts_with(&self.text),
            TermMatch::Suffix => term.ends_with(&self.text),
            TermMatch::Substring => term.contains(&self.text),
        }
    }
}

/// Parses a query into term patterns.
///
/// Whitespace separates query words. A `*` at the start or end of a word
/// turns it into a suffix, prefix or substring match. A word that tokenizes
/// into several terms (`foo/bar`) keeps the leading wildcard on its first
/// term and the trailing wildcard on its last.
pub fn parse_query(query: &str) -> Vec<TermPattern> {
    let mut patterns = Vec::new();
    for word in query.split_whitespace() {
        let leading = word.starts_with('*');
        let trailing = word.ends_with('*');
        let core = word.trim_matches('*');

        let terms = tokenize(core);
        let last = terms.len().saturating_sub(1);
        for (position, text) in terms.into_iter().enumerate() {
            let open_start = leading && position == 0;
            let open_end = trailing && position == last;
            let matching = match (open_start, open_end) {
                (false, false) => TermMatch::Exact,
                (false, true) => TermMatch::Prefix,
                (true, false) => TermMatch::Suffix,
                (true, true) => TermMatch::Substring,
            };
            patterns.push(TermPattern { text, matching });
        }
    }
    patterns
}
