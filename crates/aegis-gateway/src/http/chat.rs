//! One-shot chat endpoint — POST /chat.
//!
//! A non-streaming facade over the same session machinery the WebSocket
//! uses; handy for curl and scripting. The session is opened for the
//! duration of the request; the registry keeps the sandbox alive across
//! requests when the persist policy is on.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use aegis_session::{AgentEvent, ChatSession};

use crate::app::AppState;

#[derive(Deserialize)]
pub struct ChatBody {
    pub prompt: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub think: Option<bool>,
}

#[derive(Serialize)]
pub struct ChatReply {
    pub reply: String,
}

#[derive(Serialize)]
pub struct ChatError {
    pub error: String,
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatReply>, (StatusCode, Json<ChatError>)> {
    let user = body.user.as_deref().unwrap_or("default");
    let session_name = body.session.as_deref().unwrap_or("default");

    let session = ChatSession::connect(
        Arc::clone(&state.config),
        Arc::clone(&state.store),
        Arc::clone(&state.llm),
        Arc::clone(&state.registry),
        user,
        session_name,
        body.think.unwrap_or(true),
    )
    .await
    .map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ChatError {
                error: e.to_string(),
            }),
        )
    })?;

    let mut rx = session.chat_stream(body.prompt, None);
    let mut parts = Vec::new();
    let mut error = None;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Text(text) => parts.push(text),
            AgentEvent::Error(message) => error = Some(message),
            _ => {}
        }
    }
    session.close().await;

    match error {
        Some(error) => Err((StatusCode::BAD_GATEWAY, Json(ChatError { error }))),
        None => Ok(Json(ChatReply {
            reply: parts.join(""),
        })),
    }
}
