//! Line filtering by keyword.
//!
//! Matching is a case-sensitive substring test. Keyword sets come from
//! validated configuration and never contain the empty string.

use std::collections::BTreeSet;

/// Returns `false` iff `line` contains any of `exclude_keywords`.
///
/// An empty keyword set keeps every line.
pub fn should_keep(line: &str, exclude_keywords: &BTreeSet<String>) -> bool {
    !exclude_keywords.iter().any(|k| line.contains(k.as_str()))
}

/// First keyword (in set order) contained in `line`.
pub fn first_match<'k>(line: &str, keywords: &'k BTreeSet<String>) -> Option<&'k str> {
    keywords
        .iter()
        .map(String::as_str)
        .find(|k| line.contains(k))
}
