// Exercises the persistent shell against a real local bash under a PTY.
// No container runtime involved — `PersistentShell::local` spawns bash the
// same way the sandbox path does, minus the `docker exec` prefix.

use std::sync::Mutex;
use std::time::Duration;

use aegis_vm::shell::{InputResponder, PersistentShell, ShellEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn run(
    shell: &PersistentShell,
    command: &str,
    responder: Option<&dyn InputResponder>,
) -> Vec<ShellEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let exec = shell.execute_stream(command, responder, false, tx);
    let collect = async move {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    };
    let (result, events) = tokio::join!(exec, collect);
    result.expect("execute_stream failed");
    events
}

fn joined_lines(events: &[ShellEvent]) -> String {
    events
        .iter()
        .filter_map(|ev| match ev {
            ShellEvent::Line(line) => Some(line.as_str()),
            _ => None,
        })
        .collect()
}

/// Records every prompt it is offered; replies with a fixed answer.
struct RecordingResponder {
    seen: Mutex<Vec<String>>,
    reply: Option<&'static str>,
}

#[async_trait]
impl InputResponder for RecordingResponder {
    async fn respond(&self, prompt: &str) -> Option<String> {
        self.seen.lock().unwrap().push(prompt.to_string());
        self.reply.map(String::from)
    }
}

#[tokio::test]
async fn command_output_streams_until_sentinel() {
    let shell = PersistentShell::local("bash");
    let events = timeout(
        Duration::from_secs(30),
        run(&shell, "echo streamed-marker", None),
    )
    .await
    .expect("command timed out");

    let output = joined_lines(&events);
    assert!(
        output.contains("streamed-marker"),
        "missing output in: {output:?}"
    );
    // the sentinel line itself is never yielded
    for ev in &events {
        if let ShellEvent::Line(line) = ev {
            assert!(
                !line.trim().starts_with("__CMD_DONE_") || line.contains("echo"),
                "sentinel leaked: {line:?}"
            );
        }
    }
    shell.stop().await;
}

#[tokio::test]
async fn shell_state_persists_across_commands() {
    let shell = PersistentShell::local("bash");
    timeout(
        Duration::from_secs(30),
        run(&shell, "AEGIS_TEST_VAR=42", None),
    )
    .await
    .expect("assignment timed out");
    let events = timeout(
        Duration::from_secs(30),
        run(&shell, "echo value=$AEGIS_TEST_VAR", None),
    )
    .await
    .expect("readback timed out");

    assert!(joined_lines(&events).contains("value=42"));
    shell.stop().await;
}

#[tokio::test]
async fn prompt_lines_are_offered_to_the_responder() {
    let shell = PersistentShell::local("bash");
    let responder = RecordingResponder {
        seen: Mutex::new(Vec::new()),
        reply: Some("y"),
    };

    let events = timeout(
        Duration::from_secs(30),
        run(&shell, r"printf 'Continue? [y/n]\n'", Some(&responder as &dyn InputResponder)),
    )
    .await
    .expect("prompted command timed out");

    let seen = responder.seen.lock().unwrap();
    assert!(
        seen.iter().any(|p| p.contains("Continue? [y/n]")),
        "responder never consulted: {seen:?}"
    );
    // an answered prompt does not surface as a stdin request
    assert!(!events
        .iter()
        .any(|ev| matches!(ev, ShellEvent::StdinRequest(_))));
    shell.stop().await;
}

#[tokio::test]
async fn unanswered_prompt_surfaces_stdin_request() {
    let shell = PersistentShell::local("bash");
    let responder = RecordingResponder {
        seen: Mutex::new(Vec::new()),
        reply: None,
    };

    let events = timeout(
        Duration::from_secs(30),
        run(
            &shell,
            r"printf 'Enter deploy target:\n'",
            Some(&responder as &dyn InputResponder),
        ),
    )
    .await
    .expect("prompted command timed out");

    let request = events
        .iter()
        .find_map(|ev| match ev {
            ShellEvent::StdinRequest(prompt) => Some(prompt.clone()),
            _ => None,
        })
        .expect("no stdin_request emitted");
    assert!(request.contains("deploy target"));
    // the prompt line itself was still yielded as output first
    assert!(joined_lines(&events).contains("Enter deploy target:"));
    shell.stop().await;
}

#[tokio::test]
async fn raw_mode_emits_characters() {
    let shell = PersistentShell::local("bash");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let exec = shell.execute_stream("echo raw-xyz", None, true, tx);
    let collect = async move {
        let mut chars = String::new();
        while let Some(ev) = rx.recv().await {
            if let ShellEvent::Raw(c) = ev {
                chars.push(c);
            }
        }
        chars
    };
    let (result, chars) = timeout(Duration::from_secs(30), async { tokio::join!(exec, collect) })
        .await
        .expect("raw stream timed out");
    result.expect("execute_stream failed");
    assert!(chars.contains("raw-xyz"), "raw chars missing: {chars:?}");
    shell.stop().await;
}
