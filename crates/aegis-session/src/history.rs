//! Message persistence forms.
//!
//! User messages persist as plain text. Assistant messages persist as JSON
//! `{content?, tool_calls?}` so tool invocations survive restarts; tool
//! messages persist as JSON `{name, content}` so the producing tool's
//! display name survives. Loading tolerates plain-text rows from older data.

use aegis_llm::{ChatMessage, Role, ToolCall};
use aegis_store::MessageRecord;
use serde_json::Value;

/// Persisted form of an assistant message, or `None` when there is nothing
/// meaningful to store.
pub fn encode_assistant(message: &ChatMessage) -> Option<String> {
    if message.content.is_empty() && message.tool_calls.is_empty() {
        return None;
    }
    let mut data = serde_json::Map::new();
    if !message.content.is_empty() {
        data.insert("content".into(), Value::String(message.content.clone()));
    }
    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|c| {
                serde_json::json!({ "name": c.name, "arguments": c.arguments })
            })
            .collect();
        data.insert("tool_calls".into(), Value::Array(calls));
    }
    Some(Value::Object(data).to_string())
}

/// Persisted form of a tool message.
pub fn encode_tool(name: &str, content: &str) -> String {
    serde_json::json!({ "name": name, "content": content }).to_string()
}

/// Rebuild the in-memory message from a stored row. System rows are skipped
/// (the system prompt is recomputed each request, never replayed).
pub fn decode_record(record: &MessageRecord) -> Option<ChatMessage> {
    match record.role.as_str() {
        "system" => None,
        "user" => Some(ChatMessage::user(record.content.clone())),
        "assistant" => Some(decode_assistant(&record.content)),
        _ => Some(decode_tool(&record.content)),
    }
}

fn decode_assistant(content: &str) -> ChatMessage {
    let Ok(Value::Object(data)) = serde_json::from_str::<Value>(content) else {
        return ChatMessage::assistant(content);
    };

    let text = data
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_calls = data
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    Some(ToolCall {
                        name: c.get("name")?.as_str()?.to_string(),
                        arguments: c.get("arguments").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ChatMessage {
        role: Role::Assistant,
        content: text,
        name: None,
        tool_calls,
    }
}

fn decode_tool(content: &str) -> ChatMessage {
    let Ok(Value::Object(data)) = serde_json::from_str::<Value>(content) else {
        return ChatMessage {
            role: Role::Tool,
            content: content.to_string(),
            name: None,
            tool_calls: Vec::new(),
        };
    };

    ChatMessage {
        role: Role::Tool,
        content: data
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        name: data
            .get("name")
            .and_then(|v| v.as_str())
            .map(String::from),
        tool_calls: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(role: &str, content: &str) -> MessageRecord {
        MessageRecord {
            id: 1,
            session_id: 1,
            role: role.to_string(),
            content: content.to_string(),
            created_at: String::new(),
        }
    }

    #[test]
    fn assistant_round_trip_with_tool_calls() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: "checking".into(),
            name: None,
            tool_calls: vec![ToolCall {
                name: "execute_terminal".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
        };
        let encoded = encode_assistant(&msg).unwrap();
        let decoded = decode_record(&record("assistant", &encoded)).unwrap();
        assert_eq!(decoded.content, "checking");
        assert_eq!(decoded.tool_calls.len(), 1);
        assert_eq!(decoded.tool_calls[0].name, "execute_terminal");
    }

    #[test]
    fn empty_assistant_message_is_not_stored() {
        assert!(encode_assistant(&ChatMessage::assistant("")).is_none());
    }

    #[test]
    fn tool_round_trip_keeps_display_name() {
        let encoded = encode_tool("researcher", "found it");
        let decoded = decode_record(&record("tool", &encoded)).unwrap();
        assert_eq!(decoded.role, Role::Tool);
        assert_eq!(decoded.name.as_deref(), Some("researcher"));
        assert_eq!(decoded.content, "found it");
    }

    #[test]
    fn plain_text_rows_survive_decoding() {
        let decoded = decode_record(&record("assistant", "not json")).unwrap();
        assert_eq!(decoded.content, "not json");
        let decoded = decode_record(&record("tool", "raw output")).unwrap();
        assert_eq!(decoded.content, "raw output");
    }

    #[test]
    fn system_rows_are_skipped() {
        assert!(decode_record(&record("system", "prompt")).is_none());
    }
}
