//! `send_to_agent` — message a helper agent and wait for its reply.

use async_trait::async_trait;
use serde_json::Value;

use super::{Tool, ToolContext, ToolResult};

pub struct SendToAgentTool;

#[async_trait]
impl Tool for SendToAgentTool {
    fn name(&self) -> &str {
        "send_to_agent"
    }

    fn description(&self) -> &str {
        "Send a message to a helper agent created with spawn_agent and wait \
         for its reply. The reply also lands in the conversation as a tool \
         message named after the helper."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Name of the helper to message."
                },
                "message": {
                    "type": "string",
                    "description": "Instruction or question for the helper."
                }
            },
            "required": ["name", "message"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(helpers) = ctx.helpers.as_ref() else {
            return ToolResult::error("No helper agents are available in this session.");
        };
        let Some(name) = args.get("name").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: name");
        };
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match helpers.send(name, message, true).await {
            Ok(reply) => ToolResult::success(reply),
            Err(reason) => ToolResult::error(reason),
        }
    }
}
