//! Per-connection WebSocket lifecycle.
//!
//! Each connection carries (user, session, think) query parameters and gets
//! its own `ChatSession`; the VM registry deduplicates the underlying
//! sandbox across connections to the same (user, session). Outbound frames
//! flow through a single queue so streamed turns and notification frames
//! never interleave mid-message.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use aegis_protocol::frames::{InboundRequest, OutboundFrame};
use aegis_session::{AgentEvent, ChatSession};

use crate::app::AppState;
use crate::ws::dispatch;

/// Render a session event as its wire form.
pub fn render_event(event: AgentEvent) -> String {
    match event {
        AgentEvent::Text(text) => OutboundFrame::Text(text),
        AgentEvent::StdinRequest(prompt) => OutboundFrame::StdinRequest(prompt),
        AgentEvent::ReturnedFile { name, data } => OutboundFrame::ReturnedFile { name, data },
        AgentEvent::Result(value) => OutboundFrame::Result(value),
        AgentEvent::Error(message) => OutboundFrame::Error(message),
    }
    .render()
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, params, state))
}

async fn handle_connection(
    socket: WebSocket,
    params: HashMap<String, String>,
    state: Arc<AppState>,
) {
    let user = params
        .get("user")
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    let session_name = params
        .get("session")
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    let think = params
        .get("think")
        .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
        .unwrap_or(true);

    info!(%user, session = %session_name, "new WS connection");

    let (mut sink, mut stream) = socket.split();

    let session = match ChatSession::connect(
        Arc::clone(&state.config),
        Arc::clone(&state.store),
        Arc::clone(&state.llm),
        Arc::clone(&state.registry),
        &user,
        &session_name,
        think,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(%user, "session open failed: {e}");
            let frame = OutboundFrame::Error(e.to_string()).render();
            let _ = sink.send(Message::Text(frame.into())).await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Single writer to the socket.
    let sender = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Surface notifications and returned files while the connection lives.
    let poller = {
        let session = Arc::clone(&session);
        let out = out_tx.clone();
        let interval = std::time::Duration::from_secs(
            state.config.session.notification_poll_interval.max(1),
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for event in session.poll_notifications(true).await {
                    if out.send(render_event(event)).is_err() {
                        return;
                    }
                }
            }
        })
    };

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let request = InboundRequest::parse(&text);
                dispatch::handle(&state, &session, request, &out_tx).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    poller.abort();
    // session close unwinds any in-flight turn; the sender then drains
    session.close().await;
    drop(out_tx);
    let _ = sender.await;
    info!(%user, session = %session_name, "WS connection closed");
}
