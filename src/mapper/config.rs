//! Versioned mapper configuration
//!
//! The authoritative mutable structure: an ordered sequence of versions,
//! exactly one active, each holding rules keyed by exact source topic.
//! Validation runs on every write; normalisation prunes empty rules before
//! a version is persisted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topic::is_sparkplug_topic;

/// Validation failures, surfaced as 400 on the config write path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapperConfigError {
    #[error("active_version_id '{0}' does not name a version")]
    UnknownActiveVersion(String),
    #[error("version '{version}' has duplicate rule for source topic '{source_topic}'")]
    DuplicateSource {
        version: String,
        source_topic: String,
    },
    #[error("source topic '{0}' must be exact (no wildcards)")]
    WildcardSource(String),
    #[error("rule '{source_topic}' has duplicate target id '{target_id}'")]
    DuplicateTargetId {
        source_topic: String,
        target_id: String,
    },
    #[error("target '{target_id}' has an empty output topic")]
    EmptyOutputTopic { target_id: String },
    #[error("output topic '{0}' must be exact (no wildcards)")]
    WildcardOutput(String),
    #[error(
        "rule '{source_topic}': Sparkplug-B source cannot republish into the Sparkplug-B namespace"
    )]
    SparkplugToSparkplug { source_topic: String },
    #[error("target '{target_id}' references unknown broker '{broker_id}'")]
    UnknownBroker {
        target_id: String,
        broker_id: String,
    },
}

/// One output binding of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub enabled: bool,
    pub output_topic: String,
    /// Destination broker; `None` republishes on the source's broker.
    #[serde(default)]
    pub target_broker_id: Option<String>,
    /// Untrusted script fragment (sandbox semantics: return `msg`).
    pub code: String,
}

impl Target {
    /// Fresh target with a generated id.
    pub fn new(output_topic: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: format!("tgt_{}", uuid::Uuid::new_v4().simple()),
            enabled: true,
            output_topic: output_topic.into(),
            target_broker_id: None,
            code: code.into(),
        }
    }
}

/// One source topic and its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub source_topic: String,
    pub targets: Vec<Target>,
}

/// A named, immutable-once-saved rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub rules: Vec<Rule>,
}

/// The full persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperConfig {
    pub active_version_id: String,
    pub versions: Vec<Version>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            active_version_id: "v_1".to_string(),
            versions: vec![Version {
                id: "v_1".to_string(),
                name: "default".to_string(),
                created_at: Utc::now(),
                rules: Vec::new(),
            }],
        }
    }
}

fn has_wildcard(topic: &str) -> bool {
    topic.split('/').any(|seg| seg == "+" || seg == "#")
        || topic.contains('+')
        || topic.contains('#')
}

impl MapperConfig {
    /// The active version. Only valid after `validate`.
    pub fn active_version(&self) -> Option<&Version> {
        self.versions.iter().find(|v| v.id == self.active_version_id)
    }

    /// Drop rules with zero targets from every version. Idempotent; runs
    /// before each save so persisted versions contain no empty rules.
    pub fn normalize(&mut self) {
        for version in &mut self.versions {
            version.rules.retain(|rule| !rule.targets.is_empty());
        }
    }

    /// Validate the whole document against the configured broker ids.
    pub fn validate(&self, known_brokers: &[String]) -> Result<(), MapperConfigError> {
        if self.active_version().is_none() {
            return Err(MapperConfigError::UnknownActiveVersion(
                self.active_version_id.clone(),
            ));
        }

        for version in &self.versions {
            let mut sources = HashSet::new();
            for rule in &version.rules {
                if has_wildcard(&rule.source_topic) {
                    return Err(MapperConfigError::WildcardSource(rule.source_topic.clone()));
                }
                if !sources.insert(rule.source_topic.as_str()) {
                    return Err(MapperConfigError::DuplicateSource {
                        version: version.id.clone(),
                        source_topic: rule.source_topic.clone(),
                    });
                }

                let mut target_ids = HashSet::new();
                for target in &rule.targets {
                    if !target_ids.insert(target.id.as_str()) {
                        return Err(MapperConfigError::DuplicateTargetId {
                            source_topic: rule.source_topic.clone(),
                            target_id: target.id.clone(),
                        });
                    }
                    if target.output_topic.is_empty() {
                        return Err(MapperConfigError::EmptyOutputTopic {
                            target_id: target.id.clone(),
                        });
                    }
                    if has_wildcard(&target.output_topic) {
                        return Err(MapperConfigError::WildcardOutput(
                            target.output_topic.clone(),
                        ));
                    }
                    if is_sparkplug_topic(&rule.source_topic)
                        && is_sparkplug_topic(&target.output_topic)
                    {
                        return Err(MapperConfigError::SparkplugToSparkplug {
                            source_topic: rule.source_topic.clone(),
                        });
                    }
                    if let Some(broker_id) = &target.target_broker_id {
                        if !known_brokers.iter().any(|b| b == broker_id) {
                            return Err(MapperConfigError::UnknownBroker {
                                target_id: target.id.clone(),
                                broker_id: broker_id.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Cap the number of retained versions, dropping the oldest inactive
    /// ones first.
    pub fn cap_versions(&mut self, max_versions: usize) {
        while self.versions.len() > max_versions.max(1) {
            let Some(idx) = self
                .versions
                .iter()
                .position(|v| v.id != self.active_version_id)
            else {
                break;
            };
            let removed = self.versions.remove(idx);
            tracing::debug!(version_id = %removed.id, "Dropped old mapper version");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brokers() -> Vec<String> {
        vec!["b1".to_string(), "b2".to_string()]
    }

    fn config_with_rule(rule: Rule) -> MapperConfig {
        let mut config = MapperConfig::default();
        config.versions[0].rules.push(rule);
        config
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(MapperConfig::default().validate(&brokers()), Ok(()));
    }

    #[test]
    fn normalize_prunes_empty_rules() {
        let mut config = config_with_rule(Rule {
            source_topic: "a/b".to_string(),
            targets: Vec::new(),
        });
        config.normalize();
        assert!(config.versions[0].rules.is_empty());

        // Idempotent
        config.normalize();
        assert!(config.versions[0].rules.is_empty());
    }

    #[test]
    fn duplicate_source_rejected() {
        let mut config = config_with_rule(Rule {
            source_topic: "a/b".to_string(),
            targets: vec![Target::new("u/v", "return msg")],
        });
        config.versions[0].rules.push(Rule {
            source_topic: "a/b".to_string(),
            targets: vec![Target::new("u/w", "return msg")],
        });

        assert!(matches!(
            config.validate(&brokers()),
            Err(MapperConfigError::DuplicateSource { .. })
        ));
    }

    #[test]
    fn wildcard_source_rejected() {
        let config = config_with_rule(Rule {
            source_topic: "a/+/b".to_string(),
            targets: vec![Target::new("u/v", "return msg")],
        });
        assert!(matches!(
            config.validate(&brokers()),
            Err(MapperConfigError::WildcardSource(_))
        ));
    }

    #[test]
    fn duplicate_target_ids_rejected() {
        let mut target = Target::new("u/v", "return msg");
        target.id = "tgt_dup".to_string();
        let mut other = Target::new("u/w", "return msg");
        other.id = "tgt_dup".to_string();

        let config = config_with_rule(Rule {
            source_topic: "a/b".to_string(),
            targets: vec![target, other],
        });
        assert!(matches!(
            config.validate(&brokers()),
            Err(MapperConfigError::DuplicateTargetId { .. })
        ));
    }

    #[test]
    fn sparkplug_to_sparkplug_rejected() {
        let config = config_with_rule(Rule {
            source_topic: "spBv1.0/grp/NDATA/node".to_string(),
            targets: vec![Target::new("spBv1.0/grp/NDATA/other", "return msg")],
        });
        assert!(matches!(
            config.validate(&brokers()),
            Err(MapperConfigError::SparkplugToSparkplug { .. })
        ));

        // Sparkplug source into a plain namespace is fine
        let config = config_with_rule(Rule {
            source_topic: "spBv1.0/grp/NDATA/node".to_string(),
            targets: vec![Target::new("uns/grp/node", "return msg")],
        });
        assert_eq!(config.validate(&brokers()), Ok(()));
    }

    #[test]
    fn unknown_broker_rejected() {
        let mut target = Target::new("u/v", "return msg");
        target.target_broker_id = Some("b9".to_string());
        let config = config_with_rule(Rule {
            source_topic: "a/b".to_string(),
            targets: vec![target],
        });
        assert!(matches!(
            config.validate(&brokers()),
            Err(MapperConfigError::UnknownBroker { .. })
        ));
    }

    #[test]
    fn unknown_active_version_rejected() {
        let mut config = MapperConfig::default();
        config.active_version_id = "v_missing".to_string();
        assert!(matches!(
            config.validate(&brokers()),
            Err(MapperConfigError::UnknownActiveVersion(_))
        ));
    }

    #[test]
    fn cap_versions_keeps_the_active_one() {
        let mut config = MapperConfig::default();
        for i in 2..=5 {
            config.versions.push(Version {
                id: format!("v_{i}"),
                name: format!("v{i}"),
                created_at: Utc::now(),
                rules: Vec::new(),
            });
        }
        config.active_version_id = "v_1".to_string();

        config.cap_versions(2);
        assert_eq!(config.versions.len(), 2);
        assert!(config.versions.iter().any(|v| v.id == "v_1"));
    }
}
