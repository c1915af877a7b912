//! Conditional alerting
//!
//! Alert rules carry an untrusted predicate evaluated in the sandbox per
//! inbound message. Truthy evaluations materialize [`Alert`] records, with
//! duplicate suppression inside a debounce window, optional webhook
//! notification and optional LLM enrichment.

pub mod engine;

pub use engine::AlertEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::topic::TopicPattern;

/// Alert severity, declared on the rule and copied onto each alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Alert lifecycle status.
///
/// `Resolved` is absorbing: no transition leads out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    New,
    Analyzing,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    /// Operator-driven transition legality. Enrichment-driven moves
    /// (`new ⇄ analyzing`) are handled internally by the engine.
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::New, AlertStatus::Acknowledged)
                | (AlertStatus::New, AlertStatus::Resolved)
                | (AlertStatus::Analyzing, AlertStatus::Acknowledged)
                | (AlertStatus::Analyzing, AlertStatus::Resolved)
                | (AlertStatus::Acknowledged, AlertStatus::Resolved)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Analyzing => "analyzing",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

/// Webhook (and future channel) settings for a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
}

/// A pattern-keyed alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub topic_pattern: TopicPattern,
    pub severity: Severity,
    pub condition_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_prompt: Option<String>,
    #[serde(default)]
    pub notifications: Notifications,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Rule fields accepted on create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertRuleSpec {
    pub name: String,
    pub topic_pattern: TopicPattern,
    pub severity: Severity,
    pub condition_code: String,
    #[serde(default)]
    pub workflow_prompt: Option<String>,
    #[serde(default)]
    pub notifications: Notifications,
}

/// A materialized alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub topic: String,
    /// Payload snapshot at trigger time.
    pub trigger_value: serde_json::Value,
    pub severity: Severity,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<String>,
}
