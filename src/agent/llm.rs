//! LLM backend
//!
//! The provider is a remote OpenAI-compatible chat-completions endpoint.
//! Requests are made with `stream: true`; the SSE delta stream is
//! accumulated into one assistant turn (content plus tool calls) so the
//! agent loop works with complete turns while the upstream read stays
//! incremental.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::store::sessions::ChatMessage;

use super::tools::ToolSpec;

/// Errors from the upstream provider. These surface as `error` stream
/// chunks; the assistant message is not persisted.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm endpoint returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("llm stream error: {0}")]
    Stream(String),
    #[error("no LLM endpoint configured")]
    Disabled,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments as produced by the model.
    pub arguments: String,
}

/// A complete assistant turn.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Backend seam, so tests can drive the agent loop without a network.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<AssistantTurn, LlmError>;

    /// Plain-text completion used by alert enrichment.
    async fn complete_text(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: json!(system),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            ChatMessage {
                role: "user".to_string(),
                content: json!(prompt),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
        ];
        let turn = self.complete(&messages, &[]).await?;
        Ok(turn.content.unwrap_or_default())
    }
}

/// Settings for the remote endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct LlmClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self { http, settings })
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolSpec::wire_format).collect());
        }
        body
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<AssistantTurn, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&self.request_body(messages, tools))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut accumulator = DeltaAccumulator::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(accumulator.finish());
                }
                let delta: Value = serde_json::from_str(data)
                    .map_err(|e| LlmError::Stream(format!("bad delta frame: {e}")))?;
                accumulator.push(&delta);
            }
        }

        Ok(accumulator.finish())
    }
}

/// Accumulates OpenAI streaming deltas into a complete turn.
#[derive(Default)]
struct DeltaAccumulator {
    content: String,
    saw_content: bool,
    tool_calls: Vec<ToolCallRequest>,
}

impl DeltaAccumulator {
    fn push(&mut self, frame: &Value) {
        let Some(delta) = frame
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
        else {
            return;
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            self.content.push_str(text);
            self.saw_content = true;
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ToolCallRequest {
                        id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                    });
                }
                let slot = &mut self.tool_calls[index];
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    slot.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        slot.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        slot.arguments.push_str(args);
                    }
                }
            }
        }
    }

    fn finish(self) -> AssistantTurn {
        AssistantTurn {
            content: self.saw_content.then_some(self.content),
            tool_calls: self
                .tool_calls
                .into_iter()
                .filter(|c| !c.name.is_empty())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn accumulates_content_deltas() {
        let mut acc = DeltaAccumulator::default();
        acc.push(&frame(
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
        ));
        acc.push(&frame(
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        ));

        let turn = acc.finish();
        assert_eq!(turn.content.as_deref(), Some("Hello"));
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn accumulates_tool_call_fragments() {
        let mut acc = DeltaAccumulator::default();
        acc.push(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_topics","arguments":"{\""}}]}}]}"#,
        ));
        acc.push(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"limit\":5}"}}]}}]}"#,
        ));

        let turn = acc.finish();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "get_topics");
        assert_eq!(turn.tool_calls[0].arguments, r#"{"limit":5}"#);
    }

    #[test]
    fn empty_stream_yields_empty_turn() {
        let turn = DeltaAccumulator::default().finish();
        assert_eq!(turn.content, None);
        assert!(turn.tool_calls.is_empty());
    }
}
