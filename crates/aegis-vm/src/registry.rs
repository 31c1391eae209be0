//! Refcounted sandbox registry.
//!
//! Deduplicates sandboxes across concurrent sessions for the same
//! (user, session) key. The map is mutex-guarded; container startup happens
//! outside the lock so a slow pull never blocks unrelated acquisitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use aegis_core::config::VmConfig;
use aegis_core::types::VmKey;

use crate::error::Result;
use crate::sandbox::Sandbox;

struct Entry {
    vm: Arc<Sandbox>,
    count: usize,
}

pub struct VmRegistry {
    config: VmConfig,
    upload_dir: String,
    inner: Mutex<HashMap<VmKey, Entry>>,
}

impl VmRegistry {
    pub fn new(config: VmConfig, upload_dir: impl Into<String>) -> Self {
        Self {
            config,
            upload_dir: upload_dir.into(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Find or create the sandbox for `key` and take one reference.
    /// Does not start the container; `acquire` does.
    pub fn checkout(&self, key: &VmKey) -> Result<Arc<Sandbox>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(key) {
            entry.count += 1;
            debug!(%key, refcount = entry.count, "sandbox checkout");
            return Ok(Arc::clone(&entry.vm));
        }

        let vm = Arc::new(Sandbox::new(
            key.user.as_str(),
            self.config.clone(),
            &self.upload_dir,
        )?);
        inner.insert(
            key.clone(),
            Entry {
                vm: Arc::clone(&vm),
                count: 1,
            },
        );
        debug!(%key, "sandbox created");
        Ok(vm)
    }

    /// Take a reference to a running sandbox, creating and starting it on
    /// first use.
    pub async fn acquire(&self, key: &VmKey) -> Result<Arc<Sandbox>> {
        let vm = self.checkout(key)?;
        // Startup can take seconds (image pull); the map lock is already
        // released here.
        if let Err(e) = vm.start().await {
            self.checkin(key);
            return Err(e);
        }
        Ok(vm)
    }

    /// Drop one reference. Returns the sandbox to stop when the count hit
    /// zero and the persist policy says tear down.
    fn checkin(&self, key: &VmKey) -> Option<Arc<Sandbox>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.get_mut(key)?;
        entry.count = entry.count.saturating_sub(1);
        debug!(%key, refcount = entry.count, "sandbox checkin");
        if entry.count > 0 {
            return None;
        }
        if entry.vm.persist() {
            // persistent sandboxes stay running at refcount zero; the entry
            // is kept for the next acquire
            return None;
        }
        let entry = inner.remove(key)?;
        Some(entry.vm)
    }

    /// Release one reference; stops and removes the sandbox when it was the
    /// last one and the persist policy is off.
    pub async fn release(&self, key: &VmKey) {
        if let Some(vm) = self.checkin(key) {
            info!(%key, "last reference released, tearing down sandbox");
            vm.stop().await;
        }
    }

    /// Current refcount, zero when unknown.
    pub fn refcount(&self, key: &VmKey) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Stop all non-persistent sandboxes and clear the map. Process exit path.
    pub async fn shutdown_all(&self) {
        let vms: Vec<Arc<Sandbox>> = {
            let mut inner = self.inner.lock().unwrap();
            let vms = inner
                .values()
                .filter(|e| !e.vm.persist())
                .map(|e| Arc::clone(&e.vm))
                .collect();
            inner.clear();
            vms
        };
        for vm in vms {
            vm.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::config::VmConfig;

    fn registry(persist: bool, dir: &std::path::Path) -> VmRegistry {
        let config = VmConfig {
            persist_vms: persist,
            state_dir: dir.join("state").display().to_string(),
            return_dir: dir.join("returned").display().to_string(),
            ..VmConfig::default()
        };
        VmRegistry::new(config, dir.join("uploads").display().to_string())
    }

    #[test]
    fn checkout_dedupes_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(false, dir.path());
        let key = VmKey::new("alice", "main");

        let a = reg.checkout(&key).unwrap();
        let b = reg.checkout(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.refcount(&key), 2);

        let other = reg.checkout(&VmKey::new("alice", "side")).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn refcount_tracks_acquire_release_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(false, dir.path());
        let key = VmKey::new("alice", "main");

        for _ in 0..3 {
            reg.checkout(&key).unwrap();
        }
        assert_eq!(reg.refcount(&key), 3);

        reg.release(&key).await;
        reg.release(&key).await;
        assert_eq!(reg.refcount(&key), 1);

        reg.release(&key).await;
        // non-persistent: entry evicted at zero
        assert_eq!(reg.refcount(&key), 0);
    }

    #[tokio::test]
    async fn persistent_entry_survives_last_release() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(true, dir.path());
        let key = VmKey::new("alice", "main");

        let a = reg.checkout(&key).unwrap();
        reg.release(&key).await;
        assert_eq!(reg.refcount(&key), 0);

        // same handle comes back on the next checkout
        let b = reg.checkout(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn release_of_unknown_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(false, dir.path());
        reg.release(&VmKey::new("ghost", "none")).await;
    }

    #[tokio::test]
    async fn interleaved_checkouts_across_tasks_balance() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(registry(false, dir.path()));
        let key = VmKey::new("alice", "main");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                reg.checkout(&key).unwrap();
                tokio::task::yield_now().await;
                reg.release(&key).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(reg.refcount(&key), 0);
    }
}
