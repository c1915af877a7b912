//! Registered tool catalogue
//!
//! Each tool is a named function with a declared input schema backed by a
//! handler over the query surface, the mapper and the sandbox. The enabled
//! set is configuration-driven: a disabled category simply never enters
//! the catalogue the model is shown.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::mapper::{MapperEngine, Rule, Target};
use crate::mqtt::BrokerPool;
use crate::sandbox::{Outcome, Sandbox, ScriptMsg};
use crate::store::Store;
use crate::topic::TopicPattern;
use crate::types::{Event, Identity};

/// Tool capability switches from the environment
/// (`LLM_TOOL_ENABLE_{READ,SEMANTIC,PUBLISH,FILES,SIMULATOR,MAPPER,ADMIN}`).
#[derive(Debug, Clone, Copy)]
pub struct ToolCapabilities {
    pub read: bool,
    pub semantic: bool,
    pub publish: bool,
    /// Parsed but registers no tools: file surfaces are external.
    pub files: bool,
    /// Parsed but registers no tools: simulators are external producers.
    pub simulator: bool,
    pub mapper: bool,
    pub admin: bool,
}

impl Default for ToolCapabilities {
    fn default() -> Self {
        Self {
            read: true,
            semantic: true,
            publish: false,
            files: false,
            simulator: false,
            mapper: false,
            admin: false,
        }
    }
}

/// Declared shape of one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

impl ToolSpec {
    /// OpenAI-compatible wire representation.
    pub fn wire_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Tool invocation failures, returned to the model as tool output.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    GetTopics,
    GetTopicLatest,
    GetTopicHistory,
    SearchEvents,
    SearchByTemplate,
    PublishMessage,
    GetMapperConfig,
    UpsertMapperTarget,
    TestMapperScript,
    PruneTopic,
    GetDbStatus,
}

struct RegisteredTool {
    spec: ToolSpec,
    kind: ToolKind,
    requires_admin: bool,
}

/// The catalogue presented to the model, with dispatch.
pub struct ToolCatalog {
    store: Arc<Store>,
    pool: Arc<BrokerPool>,
    mapper: Arc<MapperEngine>,
    sandbox: Sandbox,
    tools: Vec<RegisteredTool>,
}

impl ToolCatalog {
    pub fn build(
        store: Arc<Store>,
        pool: Arc<BrokerPool>,
        mapper: Arc<MapperEngine>,
        sandbox: Sandbox,
        caps: ToolCapabilities,
    ) -> Self {
        let mut tools = Vec::new();

        if caps.read {
            tools.push(RegisteredTool {
                kind: ToolKind::GetTopics,
                requires_admin: false,
                spec: ToolSpec {
                    name: "get_topics",
                    description: "List known (broker_id, topic) pairs, most recent first.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "limit": {"type": "integer", "description": "Max pairs to return"}
                        }
                    }),
                },
            });
            tools.push(RegisteredTool {
                kind: ToolKind::GetTopicLatest,
                requires_admin: false,
                spec: ToolSpec {
                    name: "get_topic_latest",
                    description: "Latest event for an exact topic.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "topic": {"type": "string"},
                            "broker_id": {"type": "string"}
                        },
                        "required": ["topic"]
                    }),
                },
            });
            tools.push(RegisteredTool {
                kind: ToolKind::GetTopicHistory,
                requires_admin: false,
                spec: ToolSpec {
                    name: "get_topic_history",
                    description: "Newest-first history for an exact topic.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "topic": {"type": "string"},
                            "broker_id": {"type": "string"},
                            "limit": {"type": "integer"}
                        },
                        "required": ["topic"]
                    }),
                },
            });
            tools.push(RegisteredTool {
                kind: ToolKind::SearchEvents,
                requires_admin: false,
                spec: ToolSpec {
                    name: "search_events",
                    description: "Full-text search over topics and payloads (min 2 chars).",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "q": {"type": "string"},
                            "broker_id": {"type": "string"}
                        },
                        "required": ["q"]
                    }),
                },
            });
        }

        if caps.semantic {
            tools.push(RegisteredTool {
                kind: ToolKind::SearchByTemplate,
                requires_admin: false,
                spec: ToolSpec {
                    name: "search_by_template",
                    description:
                        "Find events whose topic matches an MQTT wildcard template, with \
                         optional per-key equality filters on the decoded payload.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "topic_template": {"type": "string"},
                            "filters": {"type": "object"},
                            "broker_id": {"type": "string"}
                        },
                        "required": ["topic_template"]
                    }),
                },
            });
        }

        if caps.publish {
            tools.push(RegisteredTool {
                kind: ToolKind::PublishMessage,
                requires_admin: false,
                spec: ToolSpec {
                    name: "publish_message",
                    description: "Publish a message through the broker pool.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "broker_id": {"type": "string"},
                            "topic": {"type": "string"},
                            "payload": {},
                            "qos": {"type": "integer"},
                            "retain": {"type": "boolean"}
                        },
                        "required": ["broker_id", "topic", "payload"]
                    }),
                },
            });
        }

        if caps.mapper {
            tools.push(RegisteredTool {
                kind: ToolKind::GetMapperConfig,
                requires_admin: false,
                spec: ToolSpec {
                    name: "get_mapper_config",
                    description: "Read the full mapper configuration.",
                    parameters: json!({"type": "object", "properties": {}}),
                },
            });
            tools.push(RegisteredTool {
                kind: ToolKind::UpsertMapperTarget,
                requires_admin: false,
                spec: ToolSpec {
                    name: "upsert_mapper_target",
                    description:
                        "Add or replace a mapper target for a source topic in the active version.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "source_topic": {"type": "string"},
                            "output_topic": {"type": "string"},
                            "code": {"type": "string"},
                            "target_broker_id": {"type": "string"},
                            "enabled": {"type": "boolean"}
                        },
                        "required": ["source_topic", "output_topic", "code"]
                    }),
                },
            });
            tools.push(RegisteredTool {
                kind: ToolKind::TestMapperScript,
                requires_admin: false,
                spec: ToolSpec {
                    name: "test_mapper_script",
                    description:
                        "Dry-run a script fragment in the sandbox against the latest event of a \
                         topic. Nothing is published.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "code": {"type": "string"},
                            "topic": {"type": "string"},
                            "payload": {"description": "Override payload instead of the latest event"}
                        },
                        "required": ["code", "topic"]
                    }),
                },
            });
        }

        if caps.admin {
            tools.push(RegisteredTool {
                kind: ToolKind::PruneTopic,
                requires_admin: true,
                spec: ToolSpec {
                    name: "prune_topic",
                    description: "Delete stored events matching an MQTT wildcard pattern.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "pattern": {"type": "string"},
                            "broker_id": {"type": "string"}
                        },
                        "required": ["pattern"]
                    }),
                },
            });
            tools.push(RegisteredTool {
                kind: ToolKind::GetDbStatus,
                requires_admin: true,
                spec: ToolSpec {
                    name: "get_db_status",
                    description: "Event store statistics.",
                    parameters: json!({"type": "object", "properties": {}}),
                },
            });
        }

        Self {
            store,
            pool,
            mapper,
            sandbox,
            tools,
        }
    }

    /// Specs for the enabled tools.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invoke one tool under the caller's identity.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &Value,
        identity: &Identity,
    ) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.spec.name == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        if tool.requires_admin && !identity.admin {
            return Err(ToolError::Denied(format!("'{name}' requires admin")));
        }

        let str_arg = |key: &str| -> Result<String, ToolError> {
            args.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ToolError::InvalidArgs(format!("missing '{key}'")))
        };
        let opt_str = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
        let failed = |e: &dyn std::fmt::Display| ToolError::Failed(e.to_string());

        match tool.kind {
            ToolKind::GetTopics => {
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(200) as usize;
                let topics = self
                    .store
                    .distinct_topics(limit.min(1_000))
                    .map_err(|e| failed(&e))?;
                Ok(serde_json::to_value(topics).map_err(|e| failed(&e))?)
            }

            ToolKind::GetTopicLatest => {
                let topic = str_arg("topic")?;
                let broker = opt_str("broker_id");
                let latest = self
                    .store
                    .get_latest(broker.as_deref(), &topic)
                    .map_err(|e| failed(&e))?;
                Ok(latest.map(|e| e.wire_json()).unwrap_or(Value::Null))
            }

            ToolKind::GetTopicHistory => {
                let topic = str_arg("topic")?;
                let broker = opt_str("broker_id");
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
                let events = self
                    .store
                    .get_history(broker.as_deref(), &topic, limit.min(1_000))
                    .map_err(|e| failed(&e))?;
                Ok(Value::Array(events.iter().map(Event::wire_json).collect()))
            }

            ToolKind::SearchEvents => {
                let q = str_arg("q")?;
                let broker = opt_str("broker_id");
                let events = self
                    .store
                    .search_fulltext(&q, broker.as_deref(), None, None, 50)
                    .map_err(|e| failed(&e))?;
                Ok(Value::Array(events.iter().map(Event::wire_json).collect()))
            }

            ToolKind::SearchByTemplate => {
                let template = str_arg("topic_template")?;
                let pattern = TopicPattern::compile(&template)
                    .map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
                let filters = args
                    .get("filters")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let broker = opt_str("broker_id");
                let events = self
                    .store
                    .search_by_template(&pattern, &filters, broker.as_deref(), 50)
                    .map_err(|e| failed(&e))?;
                Ok(Value::Array(events.iter().map(Event::wire_json).collect()))
            }

            ToolKind::PublishMessage => {
                let broker = str_arg("broker_id")?;
                let topic = str_arg("topic")?;
                let payload = args
                    .get("payload")
                    .ok_or_else(|| ToolError::InvalidArgs("missing 'payload'".to_string()))?;
                let bytes = match payload {
                    Value::String(s) => s.clone().into_bytes(),
                    other => serde_json::to_vec(other).map_err(|e| failed(&e))?,
                };
                let qos = args.get("qos").and_then(Value::as_u64).unwrap_or(0) as u8;
                let retain = args
                    .get("retain")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                self.pool
                    .publish(&broker, &topic, &bytes, qos, retain)
                    .await
                    .map_err(|e| failed(&e))?;
                Ok(json!({"published": true, "broker_id": broker, "topic": topic}))
            }

            ToolKind::GetMapperConfig => {
                Ok(serde_json::to_value(self.mapper.config()).map_err(|e| failed(&e))?)
            }

            ToolKind::UpsertMapperTarget => {
                let source_topic = str_arg("source_topic")?;
                let output_topic = str_arg("output_topic")?;
                let code = str_arg("code")?;

                let mut target = Target::new(output_topic, code);
                target.target_broker_id = opt_str("target_broker_id");
                target.enabled = args
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let target_id = target.id.clone();

                let mut config = self.mapper.config();
                let active_id = config.active_version_id.clone();
                let Some(version) = config.versions.iter_mut().find(|v| v.id == active_id) else {
                    return Err(ToolError::Failed("active version missing".to_string()));
                };
                match version
                    .rules
                    .iter_mut()
                    .find(|r| r.source_topic == source_topic)
                {
                    Some(rule) => {
                        // Replace any target for the same output topic.
                        rule.targets.retain(|t| t.output_topic != target.output_topic);
                        rule.targets.push(target);
                    }
                    None => version.rules.push(Rule {
                        source_topic: source_topic.clone(),
                        targets: vec![target],
                    }),
                }

                self.mapper
                    .replace_config(config)
                    .await
                    .map_err(|e| failed(&e))?;
                Ok(json!({"source_topic": source_topic, "target_id": target_id}))
            }

            ToolKind::TestMapperScript => {
                let code = str_arg("code")?;
                let topic = str_arg("topic")?;

                let payload = match args.get("payload") {
                    Some(p) => p.clone(),
                    None => self
                        .store
                        .get_latest(None, &topic)
                        .map_err(|e| failed(&e))?
                        .map(|e| e.decode_payload().to_json())
                        .unwrap_or(Value::Null),
                };

                let outcome = self
                    .sandbox
                    .evaluate(
                        &code,
                        ScriptMsg {
                            topic,
                            payload,
                            broker_id: "test".to_string(),
                        },
                    )
                    .await;

                Ok(match outcome {
                    Outcome::Ok(value) => json!({"outcome": "ok", "value": value}),
                    Outcome::Skipped => json!({"outcome": "skipped"}),
                    Outcome::Timeout => json!({"outcome": "timeout"}),
                    Outcome::SandboxError(e) => json!({"outcome": "script_error", "error": e}),
                    Outcome::SqlError(e) => json!({"outcome": "sql_error", "error": e}),
                })
            }

            ToolKind::PruneTopic => {
                let pattern = TopicPattern::compile(&str_arg("pattern")?)
                    .map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
                let broker = opt_str("broker_id");
                let count = self
                    .store
                    .prune_pattern(&pattern, broker.as_deref())
                    .map_err(|e| failed(&e))?;
                Ok(json!({"deleted": count}))
            }

            ToolKind::GetDbStatus => {
                Ok(serde_json::to_value(self.store.stats().map_err(|e| failed(&e))?)
                    .map_err(|e| failed(&e))?)
            }
        }
    }
}
