//! Sandbox subsystem: docker-backed per-user containers, the persistent
//! interactive shell, the refcounted VM registry, and the return-directory
//! watcher.

pub mod error;
pub mod pty;
pub mod registry;
pub mod sandbox;
pub mod shell;
pub mod truncate;
pub mod watcher;

pub use error::{Result, VmError};
pub use registry::VmRegistry;
pub use sandbox::{ExecOptions, Sandbox};
pub use shell::{DefaultResponder, InputResponder, PersistentShell, ShellEvent};
pub use watcher::ReturnWatcher;

/// Return a container-runtime-safe name fragment.
///
/// Docker names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]*`; everything else maps
/// to `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::sanitize_name;

    #[test]
    fn sanitize_passes_safe_chars() {
        assert_eq!(sanitize_name("alice-2.test_x"), "alice-2.test_x");
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_name("alice@example.com"), "alice_example.com");
        assert_eq!(sanitize_name("ål/ice"), "_l_ice");
    }
}
