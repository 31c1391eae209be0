use base64::Engine;
use serde::Deserialize;
use serde_json::json;

/// One inbound client request.
///
/// A bare (non-JSON) text message is treated as a chat prompt by the
/// gateway; `InboundRequest::fallback_chat` builds that form.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundRequest {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

fn default_command() -> String {
    "chat".to_string()
}

impl InboundRequest {
    /// Parse a text frame. Non-JSON input becomes a `chat` request carrying
    /// the raw text as the prompt.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_else(|_| Self::fallback_chat(text))
    }

    pub fn fallback_chat(prompt: &str) -> Self {
        Self {
            command: default_command(),
            args: json!({ "prompt": prompt }),
        }
    }

    /// Required string argument, or a BadRequest-shaped error message.
    pub fn str_arg(&self, key: &str) -> Result<&str, String> {
        self.args
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("missing or non-string argument '{key}'"))
    }

    /// Optional string argument.
    pub fn opt_str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }

    /// Optional integer argument.
    pub fn opt_u64_arg(&self, key: &str) -> Option<u64> {
        self.args.get(key).and_then(|v| v.as_u64())
    }

    /// Optional boolean argument.
    pub fn opt_bool_arg(&self, key: &str) -> Option<bool> {
        self.args.get(key).and_then(|v| v.as_bool())
    }
}

/// One outbound frame. `render` produces the exact bytes sent on the wire:
/// raw text for `Text`, compact JSON for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Assistant narration or shell output chunk, forwarded verbatim.
    Text(String),
    /// Terminal response to a non-streaming command.
    Result(serde_json::Value),
    /// Error for the most recent command.
    Error(String),
    /// The persistent shell is waiting for input.
    StdinRequest(String),
    /// A file surfaced from the sandbox's return directory.
    ReturnedFile { name: String, data: Vec<u8> },
}

impl OutboundFrame {
    pub fn render(&self) -> String {
        match self {
            OutboundFrame::Text(text) => text.clone(),
            OutboundFrame::Result(value) => json!({ "result": value }).to_string(),
            OutboundFrame::Error(message) => json!({ "error": message }).to_string(),
            OutboundFrame::StdinRequest(prompt) => {
                json!({ "stdin_request": prompt }).to_string()
            }
            OutboundFrame::ReturnedFile { name, data } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                json!({ "returned_file": name, "data": encoded }).to_string()
            }
        }
    }

    pub fn ok(value: impl Into<serde_json::Value>) -> Self {
        OutboundFrame::Result(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error(message.into())
    }
}
