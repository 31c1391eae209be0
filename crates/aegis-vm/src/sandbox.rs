//! Docker-backed sandbox driver.
//!
//! One `Sandbox` per (user, session): a container named from the configured
//! template, with the user's upload directory mounted at `/data`, a state
//! directory at `/state`, and a return queue at `/return`. Container
//! lifecycle goes through the external `docker` CLI; interactive command
//! execution goes through a PTY so CLIs that prompt actually emit their
//! prompts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use portable_pty::CommandBuilder;
use tokio::process::Command;
use tracing::{debug, error, warn};

use aegis_core::config::VmConfig;

use crate::error::{Result, VmError};
use crate::pty::PtyProcess;
use crate::sanitize_name;
use crate::shell::{InputResponder, PersistentShell, ShellEvent};
use crate::truncate;

/// Knobs for a single `execute` call.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overrides the configured `hard_timeout` when set.
    pub timeout_secs: Option<u64>,
    /// Fire-and-forget: schedule the command and return immediately.
    pub detach: bool,
    /// Bytes written to the command's terminal right after spawn.
    pub stdin_data: Option<String>,
}

pub struct Sandbox {
    config: VmConfig,
    image: String,
    name: String,
    running: AtomicBool,

    host_data_dir: PathBuf,
    state_dir: PathBuf,
    notifications_dir: PathBuf,
    return_queue_dir: PathBuf,
    return_dir: PathBuf,

    env: HashMap<String, String>,
    shell: tokio::sync::Mutex<Option<std::sync::Arc<PersistentShell>>>,
    /// Suffix appended to notification filenames so two posts in the same
    /// microsecond still order correctly.
    note_seq: AtomicU64,
}

impl Sandbox {
    /// Prepare the host-side directory layout for `username`. Does not touch
    /// the container runtime; `start` does.
    pub fn new(username: &str, config: VmConfig, upload_dir: &str) -> Result<Self> {
        let sanitized = sanitize_name(username);
        let name = config.container_template.replace("{user}", &sanitized);

        let host_data_dir = Path::new(upload_dir).join(username);
        let state_dir = Path::new(&config.state_dir).join(&sanitized);
        let notifications_dir = state_dir.join("notifications");
        let return_queue_dir = state_dir.join("return");
        let return_dir = Path::new(&config.return_dir).join(&sanitized);

        for dir in [
            &host_data_dir,
            &state_dir,
            &notifications_dir,
            &return_queue_dir,
            &return_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        let mut env = HashMap::new();
        if let Some(ref docker_host) = config.docker_host {
            debug!("using custom container runtime endpoint: {docker_host}");
            env.insert("DOCKER_HOST".to_string(), docker_host.clone());
        }

        Ok(Self {
            image: config.image.clone(),
            name,
            config,
            running: AtomicBool::new(false),
            host_data_dir,
            state_dir,
            notifications_dir,
            return_queue_dir,
            return_dir,
            env,
            shell: tokio::sync::Mutex::new(None),
            note_seq: AtomicU64::new(0),
        })
    }

    pub fn container_name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn persist(&self) -> bool {
        self.config.persist_vms
    }

    /// Host directory backing the container's `/return` queue.
    pub fn return_queue_dir(&self) -> &Path {
        &self.return_queue_dir
    }

    /// Host-side destination the return watcher moves surfaced files into.
    pub fn return_dir(&self) -> &Path {
        &self.return_dir
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.envs(&self.env);
        cmd.kill_on_drop(true);
        cmd
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the sandbox if it is not already running. Idempotent: attaches
    /// to an existing running container, restarts a stopped one, or creates
    /// a fresh one with the bind mounts.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let inspect = self
            .docker()
            .args(["inspect", "-f", "{{.State.Running}}", self.name.as_str()])
            .output()
            .await
            .map_err(|e| VmError::Unavailable(format!("container runtime not reachable: {e}")))?;

        if inspect.status.success() {
            let state = String::from_utf8_lossy(&inspect.stdout);
            if state.trim() == "true" {
                self.running.store(true, Ordering::Release);
                return Ok(());
            }
            let started = self
                .docker()
                .args(["start", self.name.as_str()])
                .output()
                .await
                .map_err(|e| VmError::Unavailable(e.to_string()))?;
            if !started.status.success() {
                return Err(VmError::Unavailable(
                    String::from_utf8_lossy(&started.stderr).into_owned(),
                ));
            }
            self.running.store(true, Ordering::Release);
            return Ok(());
        }

        // Best-effort pull; `docker run` pulls anyway when the image is absent.
        let _ = self.docker().args(["pull", self.image.as_str()]).output().await;

        let run = self
            .docker()
            .args(["run", "-d", "--name", self.name.as_str()])
            .arg("-v")
            .arg(format!("{}:/data", self.host_data_dir.display()))
            .arg("-v")
            .arg(format!("{}:/state", self.state_dir.display()))
            .arg("-v")
            .arg(format!("{}:/return", self.return_queue_dir.display()))
            .args([self.image.as_str(), "sleep", "infinity"])
            .output()
            .await
            .map_err(|e| VmError::Unavailable(e.to_string()))?;

        if !run.status.success() {
            let stderr = String::from_utf8_lossy(&run.stderr).into_owned();
            error!(container = %self.name, "failed to start sandbox: {stderr}");
            return Err(VmError::Unavailable(stderr));
        }

        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the sandbox: tear down the persistent shell, then pause the
    /// container (persist policy on) or remove it entirely.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }

        if let Some(shell) = self.shell.lock().await.take() {
            shell.stop().await;
        }

        let result = if self.config.persist_vms {
            self.docker().args(["stop", self.name.as_str()]).output().await
        } else {
            self.docker().args(["rm", "-f", self.name.as_str()]).output().await
        };
        if let Err(e) = result {
            warn!(container = %self.name, "sandbox teardown failed: {e}");
        }

        self.running.store(false, Ordering::Release);
    }

    /// Stop then start. The persistent shell is discarded.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    // -----------------------------------------------------------------------
    // One-shot exec
    // -----------------------------------------------------------------------

    /// Run a command inside the sandbox via the runtime's exec facility.
    ///
    /// Never fails: every error path is captured into the returned
    /// transcript, ending with a diagnostic line. Output is tail-truncated
    /// at 10 000 characters.
    pub async fn execute(&self, command: &str, opts: ExecOptions) -> String {
        if !self.is_running() {
            return "Failed to execute command: sandbox is not running".to_string();
        }

        if opts.detach {
            let result = self
                .docker()
                .args(["exec", "-d", self.name.as_str(), "bash", "-lc", command])
                .output()
                .await;
            if let Err(e) = result {
                return format!("Failed to execute command: {e}");
            }
            return String::new();
        }

        let mut cmd = CommandBuilder::new("docker");
        cmd.args(["exec", "-i", self.name.as_str(), "bash", "-lc", command]);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let proc = match PtyProcess::spawn(cmd, None) {
            Ok(p) => p,
            Err(e) => return format!("Failed to execute command: {e}"),
        };

        if let Some(ref data) = opts.stdin_data {
            if let Err(e) = proc.write(data) {
                warn!("stdin write to exec failed: {e}");
            }
        }

        let limit = opts.timeout_secs.or(self.config.hard_timeout);
        let started = tokio::time::Instant::now();

        while proc.is_alive() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if let Some(limit) = limit {
                if started.elapsed().as_secs() >= limit {
                    proc.kill();
                    let partial = proc.drain();
                    let diagnostic = format!("Command timed out after {limit}s: {command}");
                    return truncate::limit_output(
                        &format!("{partial}\n{diagnostic}"),
                        truncate::DEFAULT_MAX_CHARS,
                    );
                }
            }
        }

        truncate::limit_output(&proc.drain(), truncate::DEFAULT_MAX_CHARS)
    }

    // -----------------------------------------------------------------------
    // File transfer
    // -----------------------------------------------------------------------

    /// Copy a host file into the container.
    pub async fn copy_to(&self, local: &Path, remote: &str) -> Result<()> {
        self.start().await?;
        let output = self
            .docker()
            .arg("cp")
            .arg(local)
            .arg(format!("{}:{}", self.name, remote))
            .output()
            .await
            .map_err(|e| VmError::CopyFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(VmError::CopyFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }

    /// Copy a container file out to the host.
    pub async fn copy_from(&self, remote: &str, local: &Path) -> Result<()> {
        self.start().await?;
        let output = self
            .docker()
            .arg("cp")
            .arg(format!("{}:{}", self.name, remote))
            .arg(local)
            .output()
            .await
            .map_err(|e| VmError::CopyFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(VmError::CopyFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        if !local.exists() {
            return Err(VmError::CopyFailed(format!(
                "{} missing after copy",
                local.display()
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Notification / return queues
    // -----------------------------------------------------------------------

    /// Append a notification file named by UTC timestamp plus a monotonic
    /// suffix; lexicographic filename order is chronological order.
    pub fn post_notification(&self, message: &str) -> Result<()> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%6f");
        let seq = self.note_seq.fetch_add(1, Ordering::Relaxed);
        let path = self.notifications_dir.join(format!("{stamp}-{seq:06}.txt"));
        std::fs::write(&path, message)?;
        Ok(())
    }

    /// Drain queued notifications oldest-first. Each entry is removed after
    /// a successful read; unreadable entries are logged and skipped.
    pub fn fetch_notifications(&self) -> Vec<String> {
        let mut notes = Vec::new();
        for path in sorted_files(&self.notifications_dir, Some("txt")) {
            match std::fs::read_to_string(&path) {
                Ok(text) => notes.push(text),
                Err(e) => {
                    error!("failed to read notification {}: {e}", path.display());
                    continue;
                }
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("failed to delete notification {}: {e}", path.display());
            }
        }
        notes
    }

    /// Drain the return queue. Each file is moved to the host return
    /// directory, read, deleted, and handed back as (name, bytes).
    pub fn fetch_returned_files(&self) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        for path in sorted_files(&self.return_queue_dir, None) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            let dest = self.return_dir.join(&name);
            if let Err(e) = move_file(&path, &dest) {
                error!("failed to move returned file {}: {e}", path.display());
                continue;
            }
            let data = match std::fs::read(&dest) {
                Ok(data) => data,
                Err(e) => {
                    error!("failed to read returned file {}: {e}", dest.display());
                    continue;
                }
            };
            if let Err(e) = std::fs::remove_file(&dest) {
                warn!("failed to delete returned file {}: {e}", dest.display());
            }
            files.push((name, data));
        }
        files
    }

    // -----------------------------------------------------------------------
    // Persistent shell passthrough
    // -----------------------------------------------------------------------

    async fn ensure_shell(&self) -> std::sync::Arc<PersistentShell> {
        let mut guard = self.shell.lock().await;
        if let Some(ref shell) = *guard {
            return std::sync::Arc::clone(shell);
        }
        let shell = std::sync::Arc::new(PersistentShell::new(
            self.name.clone(),
            self.env.clone(),
        ));
        *guard = Some(std::sync::Arc::clone(&shell));
        shell
    }

    /// Run `command` in the persistent shell, collecting the full output.
    pub async fn shell_execute(
        &self,
        command: &str,
        responder: Option<&dyn InputResponder>,
    ) -> Result<String> {
        let shell = self.ensure_shell().await;
        shell.execute(command, responder).await
    }

    /// Run `command` in the persistent shell, streaming events into `tx`.
    pub async fn shell_execute_stream(
        &self,
        command: &str,
        responder: Option<&dyn InputResponder>,
        raw: bool,
        tx: tokio::sync::mpsc::UnboundedSender<ShellEvent>,
    ) -> Result<()> {
        let shell = self.ensure_shell().await;
        shell.execute_stream(command, responder, raw, tx).await
    }

    /// Forward raw bytes to the persistent shell's stdin.
    pub async fn shell_send_input(&self, data: &str) -> Result<()> {
        let shell = self.ensure_shell().await;
        shell.send_input(data).await
    }

    /// Simulate typing into the persistent shell.
    pub async fn shell_send_keys(&self, data: &str, delay_ms: u64) -> Result<()> {
        let shell = self.ensure_shell().await;
        shell.send_keys(data, delay_ms).await
    }
}

/// Regular files in `dir`, sorted by name. Optionally filtered by extension.
fn sorted_files(dir: &Path, ext: Option<&str>) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| match ext {
            Some(ext) => p.extension().and_then(|e| e.to_str()) == Some(ext),
            None => true,
        })
        .collect();
    paths.sort();
    paths
}

/// Rename, falling back to copy+remove for cross-device moves.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::config::VmConfig;

    fn sandbox_in(dir: &Path) -> Sandbox {
        let config = VmConfig {
            state_dir: dir.join("state").display().to_string(),
            return_dir: dir.join("returned").display().to_string(),
            ..VmConfig::default()
        };
        Sandbox::new("tester", config, &dir.join("uploads").display().to_string()).unwrap()
    }

    #[test]
    fn container_name_uses_sanitized_template() {
        let dir = tempfile::tempdir().unwrap();
        let config = VmConfig {
            state_dir: dir.path().join("s").display().to_string(),
            return_dir: dir.path().join("r").display().to_string(),
            ..VmConfig::default()
        };
        let vm = Sandbox::new(
            "we/ird user",
            config,
            &dir.path().join("u").display().to_string(),
        )
        .unwrap();
        assert_eq!(vm.container_name(), "aegis-vm-we_ird_user");
    }

    #[test]
    fn notification_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vm = sandbox_in(dir.path());

        vm.post_notification("hello").unwrap();
        assert_eq!(vm.fetch_notifications(), vec!["hello".to_string()]);
        // queue is drained
        assert!(vm.fetch_notifications().is_empty());
    }

    #[test]
    fn notifications_preserve_post_order() {
        let dir = tempfile::tempdir().unwrap();
        let vm = sandbox_in(dir.path());

        for i in 0..10 {
            vm.post_notification(&format!("n{i}")).unwrap();
        }
        let notes = vm.fetch_notifications();
        let expected: Vec<String> = (0..10).map(|i| format!("n{i}")).collect();
        // the monotonic suffix keeps same-microsecond posts ordered
        assert_eq!(notes, expected);
    }

    #[test]
    fn returned_files_are_moved_read_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let vm = sandbox_in(dir.path());

        std::fs::write(vm.return_queue_dir().join("report.txt"), b"data").unwrap();
        let files = vm.fetch_returned_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "report.txt");
        assert_eq!(files[0].1, b"data");
        // consumed from both the queue and the host-side destination
        assert!(vm.fetch_returned_files().is_empty());
        assert!(!vm.return_dir().join("report.txt").exists());
    }

    #[tokio::test]
    async fn execute_on_stopped_sandbox_reports_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let vm = sandbox_in(dir.path());
        let out = vm.execute("echo hi", ExecOptions::default()).await;
        assert!(out.contains("not running"));
    }
}
