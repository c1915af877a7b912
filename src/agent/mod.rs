//! Chat agent surface
//!
//! Turns user input into tool-call loops against a registered tool
//! catalogue, streaming progress as NDJSON chunks. The LLM itself is a
//! remote endpoint; the catalogue, the loop and the stream framing live
//! here.

pub mod llm;
pub mod runner;
pub mod tools;

pub use llm::{ChatBackend, LlmClient, LlmError, LlmSettings};
pub use runner::{AgentRunner, ChunkType, StreamChunk};
pub use tools::{ToolCapabilities, ToolCatalog, ToolError, ToolSpec};
