//! PTY-backed child process.
//!
//! Each `PtyProcess` owns a pseudo-terminal pair, a spawned child, and a
//! background thread that continuously drains the master read-end. The
//! drained bytes go two places: an ANSI-stripped transcript buffer (for
//! one-shot command capture) and an optional raw character tap (for the
//! persistent shell's streaming reader).

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, VmError};

pub struct PtyProcess {
    /// Write half — bytes sent here arrive as typed input.
    writer: Mutex<Box<dyn Write + Send>>,

    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// Accumulated ANSI-stripped output.
    output: Arc<Mutex<String>>,

    /// Cleared by the reader thread when the child exits or errors.
    alive: Arc<AtomicBool>,

    /// Keeps the master side of the PTY open for the child's lifetime.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyProcess {
    /// Spawn `cmd` under a fresh PTY.
    ///
    /// When `tap` is given, every decoded character of the raw output is also
    /// forwarded there as it arrives; the sender is dropped when the child
    /// exits, closing the channel.
    pub fn spawn(cmd: CommandBuilder, tap: Option<mpsc::UnboundedSender<char>>) -> Result<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| VmError::PtySpawn(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| VmError::PtySpawn(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| VmError::PtySpawn(e.to_string()))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| VmError::PtySpawn(e.to_string()))?;

        let output: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let buf_clone = Arc::clone(&output);
        let alive_clone = Arc::clone(&alive);

        // Blocking I/O runs in a dedicated OS thread so it never blocks Tokio.
        std::thread::spawn(move || {
            let mut raw = [0u8; 4096];
            loop {
                match reader.read(&mut raw) {
                    Ok(0) => break, // EOF — child exited
                    Ok(n) => {
                        if let Some(ref tx) = tap {
                            let text = String::from_utf8_lossy(&raw[..n]);
                            for ch in text.chars() {
                                if tx.send(ch).is_err() {
                                    break;
                                }
                            }
                        }

                        let clean = strip_ansi_escapes::strip(&raw[..n]);
                        let text = String::from_utf8_lossy(&clean).into_owned();
                        buf_clone.lock().unwrap().push_str(&text);
                    }
                    Err(e) => {
                        warn!("PTY reader error: {e}");
                        break;
                    }
                }
            }
            alive_clone.store(false, Ordering::Release);
            debug!("PTY reader thread exited");
        });

        Ok(Self {
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            output,
            alive,
            _master: Mutex::new(pair.master),
        })
    }

    /// Write `input` to the child's terminal.
    pub fn write(&self, input: &str) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        guard.write_all(input.as_bytes())?;
        guard.flush()?;
        Ok(())
    }

    /// Drain and return the accumulated transcript, clearing the buffer.
    pub fn drain(&self) -> String {
        std::mem::take(&mut *self.output.lock().unwrap())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Terminate the child. Best-effort; the reader thread notices EOF.
    pub fn kill(&self) {
        if let Err(e) = self.child.lock().unwrap().kill() {
            debug!("PTY child kill failed (already gone?): {e}");
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
    }
}
