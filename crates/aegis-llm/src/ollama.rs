use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::{
    ChatMessage, ChatRequest, ChatResponse, LlmClient, LlmError, Role, ToolCall,
};

/// Chat backend speaking the Ollama `/api/chat` JSON API.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = build_request_body(req);
        let url = format!("{}/api/chat", self.base_url);

        debug!(model = %req.model, messages = req.messages.len(), "sending chat request");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // Surface connection errors distinctly so callers can tell a
                // dead backend from a bad request.
                if e.is_connect() || e.is_timeout() {
                    LlmError::Unavailable(e.to_string())
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "chat backend error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(wire_message).collect();

    let tools: Vec<serde_json::Value> = req
        .tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect();

    serde_json::json!({
        "model": req.model,
        "messages": messages,
        "stream": false,
        "think": req.think,
        "tools": tools,
        "keep_alive": -1,
        "options": {
            "num_ctx": req.num_ctx,
            "temperature": 0,
        },
    })
}

fn wire_message(m: &ChatMessage) -> serde_json::Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut obj = serde_json::json!({ "role": role, "content": m.content });
    if let Some(ref name) = m.name {
        obj["tool_name"] = serde_json::Value::String(name.clone());
    }
    if !m.tool_calls.is_empty() {
        obj["tool_calls"] = serde_json::Value::Array(
            m.tool_calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "function": { "name": c.name, "arguments": c.arguments }
                    })
                })
                .collect(),
        );
    }
    obj
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let tool_calls = resp
        .message
        .tool_calls
        .into_iter()
        .map(|c| ToolCall {
            name: c.function.name,
            arguments: c.function.arguments,
        })
        .collect();

    ChatResponse {
        message: ChatMessage {
            role: Role::Assistant,
            content: resp.message.content,
            name: None,
            tool_calls,
        },
    }
}

// API response types (deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ToolDefinition;

    #[test]
    fn request_body_carries_tools_and_options() {
        let req = ChatRequest {
            model: "qwen3".into(),
            messages: vec![
                ChatMessage::system("be useful"),
                ChatMessage::user("hi"),
            ],
            tools: vec![ToolDefinition {
                name: "execute_terminal".into(),
                description: "run a command".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            think: true,
            num_ctx: 4096,
        };

        let body = build_request_body(&req);
        assert_eq!(body["model"], "qwen3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["think"], true);
        assert_eq!(body["keep_alive"], -1);
        assert_eq!(body["options"]["num_ctx"], 4096);
        assert_eq!(body["options"]["temperature"], 0);
        assert_eq!(body["tools"][0]["function"]["name"], "execute_terminal");
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn tool_role_message_keeps_display_name() {
        let msg = ChatMessage::tool("researcher", "done");
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_name"], "researcher");
    }

    #[test]
    fn response_parses_tool_calls() {
        let raw = r#"{
            "message": {
                "content": "",
                "tool_calls": [
                    {"function": {"name": "execute_terminal",
                                  "arguments": {"command": "echo hi"}}}
                ]
            }
        }"#;
        let api: ApiResponse = serde_json::from_str(raw).unwrap();
        let resp = parse_response(api);
        assert!(resp.has_tool_calls());
        assert_eq!(resp.message.tool_calls[0].name, "execute_terminal");
        assert_eq!(
            resp.message.tool_calls[0].arguments["command"],
            "echo hi"
        );
    }

    #[test]
    fn response_without_tool_calls_parses() {
        let raw = r#"{"message": {"content": "hello"}}"#;
        let api: ApiResponse = serde_json::from_str(raw).unwrap();
        let resp = parse_response(api);
        assert!(!resp.has_tool_calls());
        assert_eq!(resp.content(), "hello");
    }
}
