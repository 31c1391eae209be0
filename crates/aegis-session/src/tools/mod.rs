//! Tool system for LLM tool calling.
//!
//! Each session is constructed with an explicit registry of tool
//! descriptors. Handlers receive a `ToolContext` carrying everything they
//! may touch — sandbox, store, helper fabric — so no tool reaches for
//! process-wide state.

pub mod execute_terminal;
pub mod manage_memory;
pub mod send_to_agent;
pub mod spawn_agent;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use aegis_llm::ToolDefinition;
use aegis_store::Store;
use aegis_vm::Sandbox;

use crate::helpers::HelperFabric;

/// Result of executing a tool. Errors are part of the result, not the
/// control flow: the conversation continues either way.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Everything a tool handler is allowed to touch.
#[derive(Clone)]
pub struct ToolContext {
    pub sandbox: Arc<Sandbox>,
    pub store: Arc<Store>,
    pub username: String,
    pub memory_limit: usize,
    pub memory_template: String,
    /// Absent on helper sessions — helpers cannot spawn further helpers.
    pub helpers: Option<Arc<HelperFabric>>,
}

/// Trait all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name declared to the LLM (e.g. "execute_terminal").
    fn name(&self) -> &str;
    /// Description used to build the LLM tool schema.
    fn description(&self) -> &str;
    /// JSON Schema for the argument object.
    fn parameters(&self) -> Value;
    /// Run the tool. Must not panic; failures become error results.
    async fn execute(&self, ctx: ToolContext, args: serde_json::Map<String, Value>) -> ToolResult;
}

/// The set of tools one session exposes to the LLM.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// API-level declarations for the chat request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }
}

/// Normalize a tool-call argument payload into a plain map.
///
/// Models produce all kinds of shapes: JSON-encoded strings, payloads
/// double-wrapped as `{name, arguments: {...}}`, or scalars. Anything that
/// does not resolve to a mapping becomes an empty map with a warning.
pub fn normalize_args(tool_name: &str, raw: Value) -> serde_json::Map<String, Value> {
    let value = match raw {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    };

    let Value::Object(map) = value else {
        warn!(tool = tool_name, "non-mapping tool arguments, defaulting to empty");
        return serde_json::Map::new();
    };

    // Unwrap the double-wrapped form {name, arguments: {...}}.
    let wrapped = map.contains_key("arguments")
        && map.keys().all(|k| k == "name" || k == "arguments");
    if wrapped {
        if let Some(Value::Object(inner)) = map.get("arguments") {
            return inner.clone();
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_object_passes_through() {
        let args = normalize_args("t", serde_json::json!({"command": "ls"}));
        assert_eq!(args["command"], "ls");
    }

    #[test]
    fn json_string_payload_is_parsed() {
        let args = normalize_args("t", Value::String(r#"{"command":"ls"}"#.into()));
        assert_eq!(args["command"], "ls");
    }

    #[test]
    fn double_wrapped_payload_is_unwrapped() {
        let args = normalize_args(
            "t",
            serde_json::json!({"name": "execute_terminal", "arguments": {"command": "ls"}}),
        );
        assert_eq!(args["command"], "ls");
        assert!(args.get("name").is_none());
    }

    #[test]
    fn wrapper_with_extra_keys_is_not_unwrapped() {
        let args = normalize_args(
            "t",
            serde_json::json!({"name": "x", "arguments": {"a": 1}, "other": true}),
        );
        assert!(args.contains_key("other"));
    }

    #[test]
    fn scalar_payload_defaults_to_empty() {
        assert!(normalize_args("t", serde_json::json!(42)).is_empty());
        assert!(normalize_args("t", Value::String("not json".into())).is_empty());
    }
}
