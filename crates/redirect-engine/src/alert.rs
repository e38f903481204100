//! Failure-pattern matching on kept lines.
//!
//! [`AlertMatcher`] checks each line against a source's alert keywords and
//! suppresses repeats of the same keyword inside the dedup window.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::filter::first_match;

/// A keyword hit that passed deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub keyword: String,
    pub line: String,
}

/// Per-source alert matcher.
#[derive(Debug)]
pub struct AlertMatcher {
    keywords: BTreeSet<String>,
    dedup_window: Duration,
    /// keyword -> last time it fired
    last_fired: HashMap<String, Instant>,
}

impl AlertMatcher {
    pub fn new(keywords: BTreeSet<String>, dedup_window: Duration) -> Self {
        Self {
            keywords,
            dedup_window,
            last_fired: HashMap::new(),
        }
    }

    /// Returns a hit when `line` contains an alert keyword that has not
    /// fired within the dedup window.
    pub fn check(&mut self, line: &str) -> Option<PatternHit> {
        let keyword = first_match(line, &self.keywords)?;
        let now = Instant::now();

        if let Some(last) = self.last_fired.get(keyword)
            && now.duration_since(*last) < self.dedup_window
        {
            tracing::debug!(keyword, "pattern alert suppressed by dedup window");
            return None;
        }

        let keyword = keyword.to_owned();
        self.last_fired.insert(keyword.clone(), now);
        Some(PatternHit {
            keyword,
            line: line.to_owned(),
        })
    }
}
