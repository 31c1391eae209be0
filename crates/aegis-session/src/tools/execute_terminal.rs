//! `execute_terminal` — one-shot command execution in the session's sandbox.

use async_trait::async_trait;
use serde_json::Value;

use aegis_vm::ExecOptions;

use super::{Tool, ToolContext, ToolResult};

pub struct ExecuteTerminalTool;

#[async_trait]
impl Tool for ExecuteTerminalTool {
    fn name(&self) -> &str {
        "execute_terminal"
    }

    fn description(&self) -> &str {
        "Execute a shell command in your private Linux machine and return its \
         output. Uploaded documents live under /data. Network access is \
         enabled, so curl, wget, apt and pip all work. The user cannot see \
         this machine; use it for every real operation instead of guessing."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run via bash -lc."
                },
                "stdin_data": {
                    "type": "string",
                    "description": "Optional text written to the command's stdin."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Map<String, Value>) -> ToolResult {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if command.trim().is_empty() {
            return ToolResult::success("No command provided.");
        }

        let opts = ExecOptions {
            stdin_data: args
                .get("stdin_data")
                .and_then(|v| v.as_str())
                .map(String::from),
            ..ExecOptions::default()
        };

        // The transcript carries its own diagnostics on failure; the
        // conversation continues regardless.
        ToolResult::success(ctx.sandbox.execute(command, opts).await)
    }
}
