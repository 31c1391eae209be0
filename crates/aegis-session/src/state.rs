//! Per-session turn state.

use futures_util::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;

/// Where a session currently is in its turn cycle. Transitions happen only
/// under the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Generating,
    AwaitingTool,
}

/// Handle to the tool currently racing the speculative follow-up request.
///
/// The result future is shared so the interleaved-prompt path can await the
/// same tool the original turn is waiting on.
#[derive(Clone)]
pub struct ActiveTool {
    pub result: Shared<BoxFuture<'static, String>>,
    pub abort: AbortHandle,
    pub display_name: String,
}

pub struct TurnState {
    pub status: Status,
    pub tool: Option<ActiveTool>,
}

impl TurnState {
    pub fn new() -> Self {
        Self {
            status: Status::Idle,
            tool: None,
        }
    }
}

impl Default for TurnState {
    fn default() -> Self {
        Self::new()
    }
}
