//! Typed event stream produced by a session.
//!
//! Everything a session can emit — assistant narration, shell output,
//! stdin requests from the persistent shell, files surfaced from the
//! sandbox, command results, errors — flows through this one sum type.
//! Transport adapters render it to wire JSON; core code never formats
//! frames itself.

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Assistant narration or shell output chunk.
    Text(String),
    /// The persistent shell is waiting for input.
    StdinRequest(String),
    /// A file surfaced from the sandbox's return directory.
    ReturnedFile { name: String, data: Vec<u8> },
    /// Terminal response to a non-streaming command.
    Result(serde_json::Value),
    /// Error for the current operation.
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;

/// Collect the `Text` events already buffered in `rx` into one string.
/// Used by callers that want a command's full textual output.
pub fn drain_text(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<String> {
    let mut parts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::Text(text) = event {
            parts.push(text);
        }
    }
    parts
}
