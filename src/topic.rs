//! Hierarchical topics and wildcard matching.
//!
//! A topic is a `/`-delimited string such as `metrics/cpu/host-a`. The same
//! type is used for subscription patterns, which may contain two wildcard
//! tokens:
//!
//! - `?` matches exactly one level
//! - `*` matches everything from its position on
//!
//! Matching is a single lock-step walk without backtracking. The first `*`
//! reached ends the walk positively, so `a/*/c` behaves exactly like `a/*`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Level separator.
pub const SEPARATOR: char = '/';

/// Matches the remainder of a topic.
pub const MATCH_ALL: &str = "*";

/// Matches exactly one level.
pub const MATCH_ONE: &str = "?";

/// A parsed topic or topic pattern.
///
/// Equality, ordering and hashing use the raw string only.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct Topic {
    raw: String,
    levels: Vec<String>,
}

impl Topic {
    /// Parse a topic. No validation is performed; empty levels are kept.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let levels = raw.split(SEPARATOR).map(str::to_owned).collect();
        Self { raw, levels }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Whether any level is a wildcard token.
    pub fn is_pattern(&self) -> bool {
        self.levels
            .iter()
            .any(|level| level == MATCH_ALL || level == MATCH_ONE)
    }

    /// Check whether `self`, read as a pattern, matches the literal `topic`.
    pub fn matches(&self, topic: &Topic) -> bool {
        let mut pattern_levels = self.levels.iter();
        let mut topic_levels = topic.levels.iter();

        loop {
            match (pattern_levels.next(), topic_levels.next()) {
                (Some(p), _) if p == MATCH_ALL => return true,
                (Some(p), Some(_)) if p == MATCH_ONE => {}
                (Some(p), Some(t)) if p == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

/// Check whether `pattern` matches the literal `topic`.
pub fn matches(pattern: &Topic, topic: &Topic) -> bool {
    pattern.matches(topic)
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Topic {}

impl PartialOrd for Topic {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Topic {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.raw)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl From<&str> for Topic {
    fn from(raw: &str) -> Self {
        Topic::parse(raw)
    }
}

impl From<String> for Topic {
    fn from(raw: String) -> Self {
        Topic::parse(raw)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.raw
    }
}

impl FromStr for Topic {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Topic::parse(s))
    }
}
