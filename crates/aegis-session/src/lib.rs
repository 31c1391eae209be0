//! The session state machine and everything that hangs off it: the tool
//! registry and built-in tools, the helper-agent fabric, message history
//! persistence, and the typed event stream surfaced to transport adapters.

pub mod error;
pub mod events;
pub mod helpers;
pub mod history;
pub mod session;
pub mod state;
pub mod tools;

pub use error::{Result, SessionError};
pub use events::{AgentEvent, EventSender};
pub use helpers::HelperFabric;
pub use session::{ChatSession, SessionParams};
pub use state::Status;
pub use tools::{Tool, ToolContext, ToolRegistry, ToolResult};
