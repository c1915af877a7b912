//! Agent turn loop
//!
//! Turns one user message into a (possibly multi-step) tool-call loop: the
//! model is called with the session transcript and the enabled tool specs;
//! requested tools run under the caller's identity; results loop back as
//! `tool` messages up to a step ceiling. Progress streams as NDJSON chunks
//! with stable ids, mirrored onto the hub so a side channel can carry the
//! same stream.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::hub::{Hub, ServerMessage};
use crate::store::sessions::ChatMessage;
use crate::store::Store;
use crate::types::Identity;

use super::llm::{ChatBackend, ToolCallRequest};
use super::tools::ToolCatalog;

/// NDJSON chunk kinds.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Status,
    ToolStart,
    ToolResult,
    Message,
    Error,
}

/// One NDJSON stream chunk. Ids are stable so a concurrently-open side
/// channel can carry the same stream and clients dedupe by id.
#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChunkType,
    pub content: Value,
}

impl StreamChunk {
    fn new(kind: ChunkType, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content,
        }
    }
}

/// The agent surface: backend + catalogue + cancel registry.
pub struct AgentRunner {
    backend: Option<Arc<dyn ChatBackend>>,
    catalog: Arc<ToolCatalog>,
    store: Arc<Store>,
    hub: Arc<Hub>,
    max_steps: usize,
    cancels: DashMap<String, CancellationToken>,
}

impl AgentRunner {
    pub fn new(
        backend: Option<Arc<dyn ChatBackend>>,
        catalog: Arc<ToolCatalog>,
        store: Arc<Store>,
        hub: Arc<Hub>,
        max_steps: usize,
    ) -> Self {
        Self {
            backend,
            catalog,
            store,
            hub,
            max_steps,
            cancels: DashMap::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// Abort the in-flight stream for a client id, if any.
    pub fn stop(&self, client_id: &str) -> bool {
        if let Some((_, token)) = self.cancels.remove(client_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Run one turn, emitting chunks on `tx` until done or cancelled.
    pub async fn run_turn(
        &self,
        identity: Identity,
        session_id: String,
        user_message: String,
        client_id: String,
        tx: mpsc::Sender<StreamChunk>,
    ) {
        let cancel = CancellationToken::new();
        self.cancels.insert(client_id.clone(), cancel.clone());

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!(client_id, "Chat turn cancelled");
                Ok(())
            }
            result = self.turn_inner(&identity, &session_id, &user_message, &tx) => result,
        };

        if let Err(message) = result {
            self.emit(&tx, StreamChunk::new(ChunkType::Error, json!(message)))
                .await;
        }
        self.cancels.remove(&client_id);
    }

    async fn turn_inner(
        &self,
        identity: &Identity,
        session_id: &str,
        user_message: &str,
        tx: &mpsc::Sender<StreamChunk>,
    ) -> Result<(), String> {
        let Some(backend) = &self.backend else {
            return Err("no LLM endpoint configured".to_string());
        };

        // Read session history and append the new user message.
        let mut messages = self
            .store
            .get_session(session_id)
            .map_err(|e| e.to_string())?
            .map(|s| s.messages)
            .unwrap_or_default();
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: json!(user_message),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
        self.store
            .put_session(session_id, &identity.user_id, &messages)
            .map_err(|e| e.to_string())?;

        let specs = self.catalog.specs();

        for step in 0..self.max_steps {
            self.emit(
                tx,
                StreamChunk::new(ChunkType::Status, json!({"step": step, "state": "thinking"})),
            )
            .await;

            let turn = backend
                .complete(&messages, &specs)
                .await
                .map_err(|e| e.to_string())?;

            if turn.tool_calls.is_empty() {
                let content = turn.content.unwrap_or_default();
                messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: json!(content),
                    tool_calls: None,
                    tool_call_id: None,
                    name: None,
                });
                self.store
                    .put_session(session_id, &identity.user_id, &messages)
                    .map_err(|e| e.to_string())?;
                self.emit(tx, StreamChunk::new(ChunkType::Message, json!(content)))
                    .await;
                return Ok(());
            }

            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: turn.content.map(|c| json!(c)).unwrap_or(Value::Null),
                tool_calls: serde_json::to_value(&turn.tool_calls).ok(),
                tool_call_id: None,
                name: None,
            });

            for call in &turn.tool_calls {
                messages.push(self.run_tool(identity, call, tx).await);
            }
        }

        Err(format!("step ceiling ({}) reached", self.max_steps))
    }

    async fn run_tool(
        &self,
        identity: &Identity,
        call: &ToolCallRequest,
        tx: &mpsc::Sender<StreamChunk>,
    ) -> ChatMessage {
        self.emit(
            tx,
            StreamChunk::new(
                ChunkType::ToolStart,
                json!({"name": call.name, "arguments": call.arguments}),
            ),
        )
        .await;

        let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
        let result = match self.catalog.dispatch(&call.name, &args, identity).await {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool invocation failed");
                json!({"error": e.to_string()})
            }
        };

        self.emit(
            tx,
            StreamChunk::new(
                ChunkType::ToolResult,
                json!({"name": call.name, "result": result}),
            ),
        )
        .await;

        ChatMessage {
            role: "tool".to_string(),
            content: result,
            tool_calls: None,
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.to_string()),
        }
    }

    async fn emit(&self, tx: &mpsc::Sender<StreamChunk>, chunk: StreamChunk) {
        // Mirror onto the hub so the duplex channel carries the same
        // stream; clients dedupe by chunk id.
        if let Ok(value) = serde_json::to_value(&chunk) {
            self.hub.broadcast(&ServerMessage::ChatChunk { chunk: value });
        }
        let _ = tx.send(chunk).await;
    }
}
