//! Return-directory watcher.
//!
//! Surfaces files dropped into the sandbox's return queue. Uses a
//! filesystem-notification backend when one can be set up, and falls back to
//! interval polling otherwise. Each new regular file is moved to the
//! host-side return directory, read, deleted, and handed to the callback as
//! (name, bytes). Callback failures are logged and never stop the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Invoked once per surfaced file.
pub type ReturnCallback = Arc<dyn Fn(&str, Vec<u8>) -> std::result::Result<(), String> + Send + Sync>;

pub struct ReturnWatcher {
    queue_dir: PathBuf,
    dest_dir: PathBuf,
    interval_secs: u64,
    callback: ReturnCallback,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReturnWatcher {
    pub fn new(
        queue_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
        interval_secs: u64,
        callback: ReturnCallback,
    ) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            dest_dir: dest_dir.into(),
            interval_secs,
            callback,
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Begin monitoring. Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            this.run().await;
        }));
    }

    /// Stop monitoring and wait for the loop to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn run(self: Arc<Self>) {
        // Catch anything that landed before we started watching.
        self.process_queue();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watcher = {
            let tx = event_tx.clone();
            let result = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = tx.send(());
                }
            });
            match result {
                Ok(mut w) => match w.watch(&self.queue_dir, RecursiveMode::NonRecursive) {
                    Ok(()) => Some(w),
                    Err(e) => {
                        warn!("fs watch setup failed ({e}), falling back to polling");
                        None
                    }
                },
                Err(e) => {
                    warn!("fs watcher unavailable ({e}), falling back to polling");
                    None
                }
            }
        };
        // only the notify handler holds a sender now; the loop ends when the
        // watcher is dropped
        drop(event_tx);

        if watcher.is_some() {
            debug!(dir = %self.queue_dir.display(), "watching return queue");
            self.event_loop(event_rx).await;
        } else {
            debug!(
                dir = %self.queue_dir.display(),
                interval = self.interval_secs,
                "polling return queue"
            );
            self.poll_loop().await;
        }
        // watcher dropped here, after the loop exits
    }

    async fn event_loop(&self, mut events: mpsc::UnboundedReceiver<()>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    if event.is_none() {
                        break;
                    }
                    self.process_queue();
                }
            }
        }
    }

    async fn poll_loop(&self) {
        let interval = std::time::Duration::from_secs(self.interval_secs.max(1));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.process_queue(),
            }
        }
    }

    fn process_queue(&self) {
        let Ok(entries) = std::fs::read_dir(&self.queue_dir) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            let dest = self.dest_dir.join(&name);

            let data = match move_and_read(&path, &dest) {
                Ok(data) => data,
                Err(e) => {
                    error!("failed to process returned file {}: {e}", path.display());
                    continue;
                }
            };

            if let Err(e) = (self.callback)(&name, data) {
                error!("return watcher callback failed for {name}: {e}");
            }
        }
    }
}

fn move_and_read(from: &Path, to: &Path) -> std::io::Result<Vec<u8>> {
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    let data = std::fs::read(to)?;
    std::fs::remove_file(to)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector() -> (ReturnCallback, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
        let seen: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: ReturnCallback = Arc::new(move |name, data| {
            sink.lock().unwrap().push((name.to_string(), data));
            Ok(())
        });
        (cb, seen)
    }

    #[tokio::test]
    async fn preexisting_files_surface_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(queue.join("early.txt"), b"payload").unwrap();

        let (cb, seen) = collector();
        let watcher = Arc::new(ReturnWatcher::new(&queue, &dest, 1, cb));
        watcher.start();

        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        watcher.stop().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "early.txt");
        assert_eq!(seen[0].1, b"payload");
        // consumed everywhere
        assert!(!queue.join("early.txt").exists());
        assert!(!dest.join("early.txt").exists());
    }

    #[tokio::test]
    async fn files_created_after_start_surface() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&dest).unwrap();

        let (cb, seen) = collector();
        let watcher = Arc::new(ReturnWatcher::new(&queue, &dest, 1, cb));
        watcher.start();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        std::fs::write(queue.join("late.bin"), [1u8, 2, 3]).unwrap();

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        watcher.stop().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "late.bin");
    }

    #[tokio::test]
    async fn callback_error_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(queue.join("a.txt"), b"a").unwrap();
        std::fs::write(queue.join("b.txt"), b"b").unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let cb: ReturnCallback = Arc::new(move |_, _| {
            *sink.lock().unwrap() += 1;
            Err("synthetic failure".to_string())
        });

        let watcher = Arc::new(ReturnWatcher::new(&queue, &dest, 1, cb));
        watcher.start();
        for _ in 0..100 {
            if *count.lock().unwrap() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        watcher.stop().await;

        assert_eq!(*count.lock().unwrap(), 2);
    }
}
