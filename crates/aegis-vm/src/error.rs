//! Error types for the aegis-vm crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    /// Container failed to start or the runtime CLI failed catastrophically.
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    /// File transfer into/out of the sandbox failed or post-copy
    /// verification missed the file.
    #[error("Copy failed: {0}")]
    CopyFailed(String),

    /// PTY allocation or child-process spawn failed.
    #[error("PTY spawn error: {0}")]
    PtySpawn(String),

    /// The persistent shell process has exited.
    #[error("Shell session closed")]
    ShellClosed,

    /// Operation exceeded its time budget.
    #[error("Operation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;
