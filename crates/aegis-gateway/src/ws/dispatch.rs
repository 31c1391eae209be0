//! WS command dispatch.
//!
//! Translates inbound `{command, args}` requests into core operations and
//! streams the results back as wire frames. Streaming commands (`chat`,
//! `vm_execute_stream`) run as background tasks so the read loop stays
//! responsive — `vm_input` must be deliverable while a stream is running.

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use aegis_protocol::frames::{InboundRequest, OutboundFrame};
use aegis_session::{AgentEvent, ChatSession};
use aegis_store::memory;
use aegis_vm::{ExecOptions, ShellEvent};

use crate::app::AppState;
use crate::ws::connection::render_event;

type Out = mpsc::UnboundedSender<String>;

fn send_result(out: &Out, value: Value) {
    let _ = out.send(OutboundFrame::Result(value).render());
}

fn send_error(out: &Out, message: impl Into<String>) {
    let _ = out.send(OutboundFrame::Error(message.into()).render());
}

pub async fn handle(state: &Arc<AppState>, session: &Arc<ChatSession>, req: InboundRequest, out: &Out) {
    match req.command.as_str() {
        "team_chat" | "chat" => chat(session, &req, out),
        "upload_document" => upload_document(state, session, &req, out).await,
        "list_dir" => list_dir(session, &req, out).await,
        "read_file" => read_file(session, &req, out).await,
        "write_file" => write_file(session, &req, out).await,
        "delete_path" => delete_path(session, &req, out).await,
        "download_file" => download_file(session, &req, out).await,
        "vm_execute" => vm_execute(session, &req, out).await,
        "vm_execute_stream" => vm_execute_stream(session, &req, out),
        "vm_input" => vm_input(session, &req, out).await,
        "vm_keys" => vm_keys(session, &req, out).await,
        "send_notification" => send_notification(session, &req, out).await,
        "list_sessions" => match state.store.list_sessions(session.username()) {
            Ok(names) => send_result(out, json!(names)),
            Err(e) => send_error(out, e.to_string()),
        },
        "list_sessions_info" => match state.store.list_sessions_info(session.username()) {
            Ok(info) => send_result(out, json!(info)),
            Err(e) => send_error(out, e.to_string()),
        },
        "list_documents" => match state.store.list_documents(session.username()) {
            Ok(docs) => send_result(out, json!(docs)),
            Err(e) => send_error(out, e.to_string()),
        },
        "get_memory" => {
            let template = &state.config.session.default_memory_template;
            match memory::get_memory(&state.store, session.username(), template) {
                Ok(text) => send_result(out, json!(text)),
                Err(e) => send_error(out, e.to_string()),
            }
        }
        "set_memory" => {
            let Ok(text) = req.str_arg("memory") else {
                return send_error(out, "missing or non-string argument 'memory'");
            };
            let limit = state.config.session.memory_limit;
            match memory::set_memory(&state.store, session.username(), text, limit) {
                Ok(stored) => send_result(out, json!(stored)),
                Err(e) => send_error(out, e.to_string()),
            }
        }
        "reset_memory" => {
            let template = &state.config.session.default_memory_template;
            match memory::reset_memory(&state.store, session.username(), template) {
                Ok(text) => send_result(out, json!(text)),
                Err(e) => send_error(out, e.to_string()),
            }
        }
        "restart_terminal" => match session.sandbox().restart().await {
            Ok(()) => send_result(out, json!("restarted")),
            Err(e) => send_error(out, e.to_string()),
        },
        other => send_error(out, format!("Unknown command: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

fn chat(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let prompt = req.opt_str_arg("prompt").unwrap_or_default().to_string();
    let extra = req
        .args
        .get("extra")
        .and_then(|v| v.as_object())
        .cloned();

    let mut rx = session.chat_stream(prompt, extra);
    let out = out.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if out.send(render_event(event)).is_err() {
                break;
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Documents and sandbox files
// ---------------------------------------------------------------------------

async fn upload_document(
    state: &Arc<AppState>,
    session: &Arc<ChatSession>,
    req: &InboundRequest,
    out: &Out,
) {
    let dest_dir = Path::new(&state.config.storage.upload_dir).join(session.username());
    if let Err(e) = std::fs::create_dir_all(&dest_dir) {
        return send_error(out, format!("upload failed: {e}"));
    }

    let (target, name) = if let Some(file_path) = req.opt_str_arg("file_path") {
        // host-side path: copy into the user's upload directory
        let src = Path::new(file_path);
        let Some(name) = src.file_name().and_then(|n| n.to_str()).map(String::from) else {
            return send_error(out, "invalid file_path");
        };
        let target = dest_dir.join(&name);
        if let Err(e) = std::fs::copy(src, &target) {
            return send_error(out, format!("upload failed: {e}"));
        }
        (target, name)
    } else {
        // inline payload: file_name + base64 file_data
        let Ok(name) = req.str_arg("file_name") else {
            return send_error(out, "upload requires file_path or file_name + file_data");
        };
        let Ok(data) = req.str_arg("file_data") else {
            return send_error(out, "upload requires file_path or file_name + file_data");
        };
        let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => return send_error(out, format!("invalid file_data: {e}")),
        };
        let name = name.to_string();
        let target = dest_dir.join(&name);
        if let Err(e) = std::fs::write(&target, bytes) {
            return send_error(out, format!("upload failed: {e}"));
        }
        (target, name)
    };

    let vm_path = format!("/data/{name}");
    let sandbox = session.sandbox();
    if let Err(e) = sandbox.copy_to(&target, &vm_path).await {
        return send_error(out, e.to_string());
    }
    // verify the file actually landed
    let check = sandbox
        .execute(
            &format!("test -f {} && echo OK", shell_quote(&vm_path)),
            ExecOptions::default(),
        )
        .await;
    if !check.contains("OK") {
        return send_error(out, format!("Copy failed: {vm_path} missing after copy"));
    }

    if let Err(e) = state
        .store
        .add_document(session.username(), &target.display().to_string(), &name)
    {
        warn!("document record failed: {e}");
    }
    send_result(out, json!(vm_path));
}

async fn list_dir(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(path) = req.str_arg("path") else {
        return send_error(out, "missing or non-string argument 'path'");
    };
    let output = session
        .sandbox()
        .execute(
            &format!("ls -1ap {}", shell_quote(path)),
            ExecOptions::default(),
        )
        .await;
    if output.starts_with("ls:") {
        return send_result(out, json!([]));
    }
    let entries: Vec<Value> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "./" && *line != "../")
        .map(|line| {
            let is_dir = line.ends_with('/');
            let name = if is_dir { &line[..line.len() - 1] } else { line };
            json!({ "name": name, "is_dir": is_dir })
        })
        .collect();
    send_result(out, json!(entries));
}

async fn read_file(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(path) = req.str_arg("path") else {
        return send_error(out, "missing or non-string argument 'path'");
    };
    let content = session
        .sandbox()
        .execute(&format!("cat {}", shell_quote(path)), ExecOptions::default())
        .await;
    send_result(out, json!(content));
}

async fn write_file(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(path) = req.str_arg("path") else {
        return send_error(out, "missing or non-string argument 'path'");
    };
    let content = req.opt_str_arg("content").unwrap_or_default();
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    let cmd = format!(
        "echo {} | base64 -d > {}",
        shell_quote(&encoded),
        shell_quote(path)
    );
    session.sandbox().execute(&cmd, ExecOptions::default()).await;
    send_result(out, json!("Saved"));
}

async fn delete_path(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(path) = req.str_arg("path") else {
        return send_error(out, "missing or non-string argument 'path'");
    };
    let q = shell_quote(path);
    let cmd = format!(
        "if [ -d {q} ]; then rm -rf {q} && echo Deleted; \
         elif [ -e {q} ]; then rm -f {q} && echo Deleted; \
         else echo File not found; fi"
    );
    let output = session.sandbox().execute(&cmd, ExecOptions::default()).await;
    send_result(out, json!(output));
}

async fn download_file(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(path) = req.str_arg("path") else {
        return send_error(out, "missing or non-string argument 'path'");
    };
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let sandbox = session.sandbox();
    let dest = match req.opt_str_arg("dest") {
        Some(dest) => Path::new(dest).to_path_buf(),
        None => sandbox.return_dir().join(name),
    };
    match sandbox.copy_from(path, &dest).await {
        Ok(()) => send_result(out, json!(dest.display().to_string())),
        Err(e) => send_error(out, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

async fn vm_execute(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(command) = req.str_arg("command") else {
        return send_error(out, "missing or non-string argument 'command'");
    };
    let opts = ExecOptions {
        timeout_secs: req.opt_u64_arg("timeout"),
        ..ExecOptions::default()
    };
    let transcript = session.sandbox().execute(command, opts).await;
    send_result(out, json!(transcript));
}

fn vm_execute_stream(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(command) = req.str_arg("command") else {
        return send_error(out, "missing or non-string argument 'command'");
    };
    let command = command.to_string();
    let raw = req.opt_bool_arg("raw").unwrap_or(true);
    let sandbox = session.sandbox();
    let out = out.clone();

    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = {
            let out = out.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let frame = match event {
                        ShellEvent::Line(line) => AgentEvent::Text(line),
                        ShellEvent::Raw(c) => AgentEvent::Text(c.to_string()),
                        ShellEvent::StdinRequest(prompt) => AgentEvent::StdinRequest(prompt),
                    };
                    if out.send(render_event(frame)).is_err() {
                        break;
                    }
                }
            })
        };

        if let Err(e) = sandbox.shell_execute_stream(&command, None, raw, tx).await {
            send_error(&out, e.to_string());
        }
        let _ = forward.await;
    });
}

async fn vm_input(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(data) = req.str_arg("data") else {
        return send_error(out, "missing or non-string argument 'data'");
    };
    match session.sandbox().shell_send_input(data).await {
        Ok(()) => send_result(out, json!("ok")),
        Err(e) => send_error(out, e.to_string()),
    }
}

async fn vm_keys(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(data) = req.str_arg("data") else {
        return send_error(out, "missing or non-string argument 'data'");
    };
    let delay_ms = req
        .args
        .get("delay")
        .and_then(|v| v.as_f64())
        .map(|secs| (secs * 1_000.0) as u64)
        .unwrap_or(50);
    match session.sandbox().shell_send_keys(data, delay_ms).await {
        Ok(()) => send_result(out, json!("ok")),
        Err(e) => send_error(out, e.to_string()),
    }
}

async fn send_notification(session: &Arc<ChatSession>, req: &InboundRequest, out: &Out) {
    let Ok(message) = req.str_arg("message") else {
        return send_error(out, "missing or non-string argument 'message'");
    };
    match session.send_notification(message).await {
        Ok(()) => send_result(out, json!("ok")),
        Err(e) => send_error(out, e.to_string()),
    }
}

/// Single-quote `s` for safe interpolation into `bash -lc`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::shell_quote;

    #[test]
    fn quoting_wraps_and_escapes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
