//! `spawn_agent` — create a named helper agent for delegated work.

use async_trait::async_trait;
use serde_json::Value;

use super::{Tool, ToolContext, ToolResult};

pub struct SpawnAgentTool;

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Create a short-lived helper agent that works for you in parallel. \
         Give it a unique name, a description of its job, and any context it \
         needs. Talk to it afterwards with send_to_agent. Helpers can run \
         terminal commands but never address the user."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Unique name for the helper."
                },
                "details": {
                    "type": "string",
                    "description": "What the helper is responsible for."
                },
                "context": {
                    "type": "string",
                    "description": "Background information the helper should know."
                }
            },
            "required": ["name", "details"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(helpers) = ctx.helpers.as_ref() else {
            return ToolResult::error("Helper agents cannot spawn further agents.");
        };
        let Some(name) = args.get("name").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: name");
        };
        let details = args
            .get("details")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let context = args
            .get("context")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match helpers.spawn(name, details, context).await {
            Ok(()) => ToolResult::success(format!("Agent '{name}' is ready.")),
            Err(reason) => ToolResult::error(reason),
        }
    }
}
