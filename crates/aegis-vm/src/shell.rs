//! Persistent interactive shell.
//!
//! One long-lived `bash -i` per sandbox, attached to a PTY. A unique
//! sentinel echoed after each command marks completion, so no prompt
//! parsing is needed to know when output ends. Completed lines that look
//! like interactive input prompts are offered to a responder; unanswered
//! prompts surface as `StdinRequest` events for the client to handle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, VmError};
use crate::pty::PtyProcess;

/// Default inter-character delay for `send_keys`, modeling human typing.
const DEFAULT_KEY_DELAY_MS: u64 = 50;

/// Event stream emitted by `execute_stream`.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellEvent {
    /// A completed output line (non-raw mode), terminator included.
    Line(String),
    /// One character of raw output (raw mode).
    Raw(char),
    /// A detected input prompt no responder answered.
    StdinRequest(String),
}

/// Answers interactive prompts on behalf of the caller.
#[async_trait]
pub trait InputResponder: Send + Sync {
    /// Return the reply to type, or `None` to surface a `StdinRequest`.
    async fn respond(&self, prompt: &str) -> Option<String>;
}

/// Answers `y` to yes/no prompts and an empty line to press-enter prompts.
pub struct DefaultResponder;

#[async_trait]
impl InputResponder for DefaultResponder {
    async fn respond(&self, prompt: &str) -> Option<String> {
        default_reply(prompt)
    }
}

enum ShellTarget {
    /// `docker exec -it <container> bash --noprofile --norc -i`
    Container {
        name: String,
        env: HashMap<String, String>,
    },
    /// A local interactive shell; used when no sandbox is involved.
    Local { shell: String },
}

pub struct PersistentShell {
    target: ShellTarget,
    proc: tokio::sync::Mutex<Option<Arc<PtyProcess>>>,
    chars: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<char>>>,
    /// Serializes `execute_stream`: one command at a time per shell.
    exec_lock: tokio::sync::Mutex<()>,
}

impl PersistentShell {
    /// Shell running inside the named container.
    pub fn new(container: String, env: HashMap<String, String>) -> Self {
        Self {
            target: ShellTarget::Container {
                name: container,
                env,
            },
            proc: tokio::sync::Mutex::new(None),
            chars: tokio::sync::Mutex::new(None),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Shell running directly on the host.
    pub fn local(shell: impl Into<String>) -> Self {
        Self {
            target: ShellTarget::Local {
                shell: shell.into(),
            },
            proc: tokio::sync::Mutex::new(None),
            chars: tokio::sync::Mutex::new(None),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn build_command(&self) -> CommandBuilder {
        match &self.target {
            ShellTarget::Container { name, env } => {
                let mut cmd = CommandBuilder::new("docker");
                cmd.args(["exec", "-it", name.as_str(), "bash", "--noprofile", "--norc", "-i"]);
                for (k, v) in env {
                    cmd.env(k, v);
                }
                cmd
            }
            ShellTarget::Local { shell } => {
                let mut cmd = CommandBuilder::new(shell);
                cmd.args(["--noprofile", "--norc", "-i"]);
                cmd
            }
        }
    }

    /// Spawn the shell if it is not already running. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.proc.lock().await;
        if guard.as_ref().is_some_and(|p| p.is_alive()) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let proc = PtyProcess::spawn(self.build_command(), Some(tx))?;
        *guard = Some(Arc::new(proc));
        *self.chars.lock().await = Some(rx);
        debug!("persistent shell started");
        Ok(())
    }

    /// Terminate the shell process and drop the reader channel.
    pub async fn stop(&self) {
        if let Some(proc) = self.proc.lock().await.take() {
            proc.kill();
        }
        *self.chars.lock().await = None;
    }

    async fn current_proc(&self) -> Result<Arc<PtyProcess>> {
        self.start().await?;
        self.proc
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or(VmError::ShellClosed)
    }

    /// Raw write to the shell's stdin.
    pub async fn send_input(&self, data: &str) -> Result<()> {
        let proc = self.current_proc().await?;
        proc.write(data)
    }

    /// Write one character at a time with a delay, for CLIs that poll the
    /// tty instead of reading lines.
    pub async fn send_keys(&self, data: &str, delay_ms: u64) -> Result<()> {
        let proc = self.current_proc().await?;
        let mut buf = [0u8; 4];
        for ch in data.chars() {
            proc.write(ch.encode_utf8(&mut buf))?;
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        Ok(())
    }

    /// Run `command` and return the collected line output.
    pub async fn execute(
        &self,
        command: &str,
        responder: Option<&dyn InputResponder>,
    ) -> Result<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = self.execute_stream(command, responder, false, tx);
        let collect = async move {
            let mut out = String::new();
            while let Some(event) = rx.recv().await {
                if let ShellEvent::Line(line) = event {
                    out.push_str(&line);
                }
            }
            out
        };
        let (result, output) = tokio::join!(run, collect);
        result?;
        Ok(output)
    }

    /// Run `command`, streaming output into `tx` as it arrives.
    ///
    /// Serialized per shell: a second caller waits until the first command's
    /// sentinel is seen. Lines classified as input prompts are offered to
    /// `responder` (the default responder when `None`); replies are written
    /// back as if typed. Unanswered prompts yield `StdinRequest`.
    pub async fn execute_stream(
        &self,
        command: &str,
        responder: Option<&dyn InputResponder>,
        raw: bool,
        tx: mpsc::UnboundedSender<ShellEvent>,
    ) -> Result<()> {
        let _serial = self.exec_lock.lock().await;
        let proc = self.current_proc().await?;

        let sentinel = format!("__CMD_DONE_{}__", uuid::Uuid::new_v4().simple());
        proc.write(&format!("{command}\necho {sentinel}\n"))?;

        let mut chars_guard = self.chars.lock().await;
        let chars = chars_guard.as_mut().ok_or(VmError::ShellClosed)?;

        let default = DefaultResponder;
        let responder = responder.unwrap_or(&default);

        let mut line = String::new();
        loop {
            let Some(ch) = chars.recv().await else {
                warn!("shell reader channel closed mid-command");
                return Err(VmError::ShellClosed);
            };

            if raw {
                let _ = tx.send(ShellEvent::Raw(ch));
            }

            if ch == '\u{8}' {
                line.pop();
                continue;
            }
            line.push(ch);

            if ch != '\n' && ch != '\r' {
                continue;
            }

            let stripped = line.trim();
            if stripped == sentinel {
                return Ok(());
            }

            if is_input_prompt(&line) {
                if !raw {
                    let _ = tx.send(ShellEvent::Line(line.clone()));
                }
                let prompt = line.trim().to_string();
                match responder.respond(&prompt).await {
                    Some(reply) => {
                        let reply = if reply.ends_with('\n') {
                            reply
                        } else {
                            format!("{reply}\n")
                        };
                        if raw {
                            self.send_keys(&reply, DEFAULT_KEY_DELAY_MS).await?;
                        } else {
                            proc.write(&reply)?;
                        }
                    }
                    None => {
                        let _ = tx.send(ShellEvent::StdinRequest(prompt));
                    }
                }
            } else if !raw {
                let _ = tx.send(ShellEvent::Line(line.clone()));
            }
            line.clear();
        }
    }
}

/// Heuristic prompt classifier, applied to each completed line.
///
/// Interactive CLIs rarely mark their prompts; these rules catch the common
/// shapes (yes/no questions, trailing question marks, "press enter" gates,
/// and `field:` style requests that are not URLs).
pub fn is_input_prompt(text: &str) -> bool {
    let stripped = text.trim_end();
    if stripped.trim().is_empty() {
        return false;
    }
    let s = stripped.to_lowercase();

    if s.ends_with("(y/n)") || s.ends_with("[y/n]") || s.ends_with("yes/no?") {
        return true;
    }
    if s.ends_with('?') {
        return true;
    }
    if s.ends_with('>') && s.contains("enter") {
        return true;
    }
    if s.ends_with(':') && (s.contains("password") || !s.contains("//")) {
        return true;
    }
    false
}

/// Stock replies for the most common prompt shapes.
pub fn default_reply(prompt: &str) -> Option<String> {
    let s = prompt.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }
    if s.contains("[y/n]") || s.contains("(y/n)") || s.ends_with("yes/no?") {
        return Some("y".to_string());
    }
    if s.contains("press enter") || s.contains("press return") || s.contains("any key") {
        return Some(String::new());
    }
    if s.contains("default") && (s.contains("enter") || s.contains("return")) {
        return Some(String::new());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // The grammar below is load-bearing: clients key stdin_request handling
    // off it, so each rule is pinned individually.

    #[test]
    fn yes_no_prompts_detected() {
        assert!(is_input_prompt("Proceed with installation? (y/n)"));
        assert!(is_input_prompt("Overwrite [y/n]"));
        assert!(is_input_prompt("Delete all files yes/no?"));
    }

    #[test]
    fn question_mark_prompts_detected() {
        assert!(is_input_prompt("What is your name?"));
        assert!(is_input_prompt("Continue?  "));
    }

    #[test]
    fn enter_angle_prompts_detected() {
        assert!(is_input_prompt("Press enter to continue >"));
        // a bare `>` without "enter" is not a prompt
        assert!(!is_input_prompt("stdout redirected >"));
    }

    #[test]
    fn colon_prompts_detected_except_urls() {
        assert!(is_input_prompt("Password:"));
        assert!(is_input_prompt("Enter your username:"));
        // URL-bearing lines ending in ":" are output, not prompts
        assert!(!is_input_prompt("see https://example.com:"));
        // unless they ask for a password
        assert!(is_input_prompt("password for https://example.com:"));
    }

    #[test]
    fn ordinary_output_not_detected() {
        assert!(!is_input_prompt(""));
        assert!(!is_input_prompt("   \n"));
        assert!(!is_input_prompt("compiling module"));
        assert!(!is_input_prompt("done."));
    }

    #[test]
    fn default_reply_answers_yes_no() {
        assert_eq!(default_reply("Proceed? [y/n]").as_deref(), Some("y"));
        assert_eq!(default_reply("ok (y/n)").as_deref(), Some("y"));
        assert_eq!(default_reply("sure yes/no?").as_deref(), Some("y"));
    }

    #[test]
    fn default_reply_answers_press_enter() {
        assert_eq!(default_reply("Press enter to continue").as_deref(), Some(""));
        assert_eq!(default_reply("press RETURN to scroll").as_deref(), Some(""));
        assert_eq!(default_reply("hit any key").as_deref(), Some(""));
        assert_eq!(
            default_reply("accept default and press enter").as_deref(),
            Some("")
        );
    }

    #[test]
    fn default_reply_declines_unknown_prompts() {
        assert_eq!(default_reply("What is your name?"), None);
        assert_eq!(default_reply("Password:"), None);
        assert_eq!(default_reply(""), None);
    }
}
