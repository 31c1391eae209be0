//! `manage_memory` — edit the user's persistent memory JSON.

use async_trait::async_trait;
use serde_json::Value;

use aegis_store::memory;

use super::{Tool, ToolContext, ToolResult};

pub struct ManageMemoryTool;

#[async_trait]
impl Tool for ManageMemoryTool {
    fn name(&self) -> &str {
        "manage_memory"
    }

    fn description(&self) -> &str {
        "Modify persistent user memory. Provide a field name and optionally a \
         value; omitting the value deletes the field. The memory JSON is \
         already inlined in your system prompt, so there is nothing to read \
         back. Record every durable fact you learn. The protected_memory \
         section is read-only."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "field": {
                    "type": "string",
                    "description": "Memory field to set or remove."
                },
                "value": {
                    "type": "string",
                    "description": "New value; omit to remove the field."
                }
            },
            "required": ["field"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(field) = args.get("field").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: field");
        };
        let value = args.get("value").and_then(|v| v.as_str());

        match memory::edit_memory(
            &ctx.store,
            &ctx.username,
            field,
            value,
            &ctx.memory_template,
            ctx.memory_limit,
        ) {
            Ok(_) => ToolResult::success("Memory updated successfully."),
            Err(e) => ToolResult::error(format!("Error updating memory: {e}")),
        }
    }
}
