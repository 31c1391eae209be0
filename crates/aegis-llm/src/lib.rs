//! LLM backend interface.
//!
//! `client` holds the provider-neutral message/tool types and the
//! `LlmClient` trait; `ollama` is the production implementation speaking the
//! Ollama `/api/chat` JSON API. Session code depends only on the trait so
//! tests can substitute scripted clients.

pub mod client;
pub mod ollama;

pub use client::{
    ChatMessage, ChatRequest, ChatResponse, LlmClient, LlmError, Role, ToolCall, ToolDefinition,
};
pub use ollama::OllamaClient;
