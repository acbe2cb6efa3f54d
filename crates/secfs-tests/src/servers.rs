//! Version servers that misbehave on request.
//!
//! SecFS trusts neither server, so the interesting tests are the ones where
//! the version server lies: serves different histories to different
//! clients, rolls a client back, or lets another writer sneak in between a
//! fetch and a publish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use secfs_store::{
    MemoryVersionServer, StoreError, StoreResult, VersionServer, VersionSnapshot,
};
use tracing::info;

/// Copies every entry of `source` into a new in-memory server.
pub fn copy_of(source: &dyn VersionServer) -> StoreResult<MemoryVersionServer> {
    let copy = MemoryVersionServer::new();
    for (user, bytes) in source.fetch_all()?.entries {
        copy.force_entry(user, bytes);
    }
    Ok(copy)
}

/// Forwards to whichever backend is currently selected, letting a test
/// swap the history a session sees without the session noticing.
pub struct SwitchableVersionServer {
    current: RwLock<Arc<dyn VersionServer>>,
}

impl SwitchableVersionServer {
    pub fn new(initial: Arc<dyn VersionServer>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Serves `backend` from now on.
    pub fn switch_to(&self, backend: Arc<dyn VersionServer>) {
        if let Ok(mut current) = self.current.write() {
            *current = backend;
            info!("version server switched backend");
        }
    }

    fn backend(&self) -> StoreResult<Arc<dyn VersionServer>> {
        self.current
            .read()
            .map(|c| c.clone())
            .map_err(|e| StoreError::Unavailable {
                reason: format!("lock poisoned: {}", e),
            })
    }
}

impl VersionServer for SwitchableVersionServer {
    fn fetch_all(&self) -> StoreResult<VersionSnapshot> {
        self.backend()?.fetch_all()
    }

    fn publish(&self, user: u64, expected_generation: u64, bytes: Vec<u8>) -> StoreResult<u64> {
        self.backend()?.publish(user, expected_generation, bytes)
    }
}

/// Honest server that, when armed, lets a phantom writer advance the list
/// right before the next publish, so that publish loses the race.
pub struct InterferingVersionServer {
    inner: MemoryVersionServer,
    armed: AtomicBool,
}

impl InterferingVersionServer {
    pub fn new() -> Self {
        Self {
            inner: MemoryVersionServer::new(),
            armed: AtomicBool::new(false),
        }
    }

    /// Makes the next publish lose its race.
    pub fn interfere_once(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryVersionServer {
        &self.inner
    }
}

impl Default for InterferingVersionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionServer for InterferingVersionServer {
    fn fetch_all(&self) -> StoreResult<VersionSnapshot> {
        self.inner.fetch_all()
    }

    fn publish(&self, user: u64, expected_generation: u64, bytes: Vec<u8>) -> StoreResult<u64> {
        if self.armed.swap(false, Ordering::SeqCst) {
            // Rewriting an existing entry unchanged still advances the
            // generation.
            let snapshot = self.inner.fetch_all()?;
            match snapshot.entries.into_iter().next() {
                Some((other, same)) => self.inner.force_entry(other, same),
                None => self.inner.remove_entry(u64::MAX),
            }
        }
        self.inner.publish(user, expected_generation, bytes)
    }
}
