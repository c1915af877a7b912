//! MQTT topic pattern matching
//!
//! Compiles MQTT wildcard expressions (`+` = one level, `#` = trailing
//! multi-level) into matchers shared by the subscription, mapper, alert and
//! prune paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when compiling a topic pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty topic pattern")]
    Empty,
    #[error("'#' is only valid as the last segment: {0}")]
    MultiLevelNotLast(String),
    #[error("wildcard must occupy a whole segment: {0}")]
    EmbeddedWildcard(String),
}

/// A compiled MQTT topic pattern.
///
/// Matching follows the MQTT 3.1.1 rules: `+` matches exactly one level,
/// `#` matches the remainder of the topic (including zero levels).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

impl TopicPattern {
    /// Compile a wildcard expression, validating wildcard placement.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            match *part {
                "#" => {
                    if i != last {
                        return Err(PatternError::MultiLevelNotLast(pattern.to_string()));
                    }
                    segments.push(Segment::MultiLevel);
                }
                "+" => segments.push(Segment::SingleLevel),
                lit => {
                    if lit.contains('#') || lit.contains('+') {
                        return Err(PatternError::EmbeddedWildcard(pattern.to_string()));
                    }
                    segments.push(Segment::Literal(lit.to_string()));
                }
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// Test a concrete (wildcard-free) topic against this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        let mut idx = 0;

        for level in levels.by_ref() {
            match self.segments.get(idx) {
                Some(Segment::MultiLevel) => return true,
                Some(Segment::SingleLevel) => idx += 1,
                Some(Segment::Literal(lit)) => {
                    if lit != level {
                        return false;
                    }
                    idx += 1;
                }
                None => return false,
            }
        }

        // Topic exhausted: either the pattern is exhausted too, or a single
        // trailing `#` remains (which matches zero levels).
        match self.segments.get(idx) {
            None => true,
            Some(Segment::MultiLevel) => idx == self.segments.len() - 1,
            Some(_) => false,
        }
    }

    /// True when the pattern contains no wildcards (i.e. names one topic).
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// The literal prefix before the first wildcard, used to narrow SQL
    /// candidate scans with a `LIKE 'prefix%'` clause.
    pub fn literal_prefix(&self) -> String {
        let mut prefix = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(lit) => {
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(lit);
                }
                _ => break,
            }
        }
        prefix
    }

    /// The original wildcard expression.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::compile(&value)
    }
}

impl From<TopicPattern> for String {
    fn from(value: TopicPattern) -> Self {
        value.raw
    }
}

/// True when a concrete topic is a Sparkplug-B namespace topic.
pub fn is_sparkplug_topic(topic: &str) -> bool {
    topic == "spBv1.0" || topic.starts_with("spBv1.0/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_itself_only() {
        let p = TopicPattern::compile("plant/a/temp").unwrap();
        assert!(p.is_exact());
        assert!(p.matches("plant/a/temp"));
        assert!(!p.matches("plant/a/temp/x"));
        assert!(!p.matches("plant/a"));
        assert!(!p.matches("plant/b/temp"));
    }

    #[test]
    fn single_level_wildcard() {
        let p = TopicPattern::compile("factory/+/temp").unwrap();
        assert!(p.matches("factory/1/temp"));
        assert!(p.matches("factory/line-2/temp"));
        assert!(!p.matches("factory/1/2/temp"));
        assert!(!p.matches("factory/temp"));
    }

    #[test]
    fn multi_level_wildcard() {
        let p = TopicPattern::compile("a/1/#").unwrap();
        assert!(p.matches("a/1/x"));
        assert!(p.matches("a/1/x/y/z"));
        // `#` also matches the parent level itself
        assert!(p.matches("a/1"));
        assert!(!p.matches("a/2/x"));
    }

    #[test]
    fn bare_multi_level_matches_everything() {
        let p = TopicPattern::compile("#").unwrap();
        assert!(p.matches("a"));
        assert!(p.matches("a/b/c"));
    }

    #[test]
    fn hash_must_be_last() {
        assert_eq!(
            TopicPattern::compile("a/#/b").unwrap_err(),
            PatternError::MultiLevelNotLast("a/#/b".to_string())
        );
    }

    #[test]
    fn embedded_wildcards_rejected() {
        assert!(TopicPattern::compile("a/b+/c").is_err());
        assert!(TopicPattern::compile("a/b#").is_err());
        assert!(TopicPattern::compile("").is_err());
    }

    #[test]
    fn literal_prefix_stops_at_first_wildcard() {
        assert_eq!(
            TopicPattern::compile("plant/a/+/x").unwrap().literal_prefix(),
            "plant/a"
        );
        assert_eq!(TopicPattern::compile("#").unwrap().literal_prefix(), "");
        assert_eq!(
            TopicPattern::compile("a/b/c").unwrap().literal_prefix(),
            "a/b/c"
        );
    }

    #[test]
    fn serde_round_trip() {
        let p = TopicPattern::compile("f/+/temp").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"f/+/temp\"");
        let back: TopicPattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn sparkplug_prefix_detection() {
        assert!(is_sparkplug_topic("spBv1.0/group/NDATA/node"));
        assert!(is_sparkplug_topic("spBv1.0"));
        assert!(!is_sparkplug_topic("spBv1.0x/group"));
        assert!(!is_sparkplug_topic("uns/a/temp"));
    }
}
