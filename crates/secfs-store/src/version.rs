//! Server-side storage for signed version structures.
//!
//! The server keeps one opaque byte string per user: the latest signed
//! version structure that user published. It cannot verify or interpret
//! them. The whole list carries a generation number that advances on every
//! publish; publishing is a compare-and-swap on that generation, which
//! serializes honest writers the same way an exclusive server lock would.
//! A client that loses the race gets [`StoreError::Conflict`], re-fetches and
//! retries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Everything the server currently holds, as of one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSnapshot {
    /// Generation of the list; advances on every publish.
    pub generation: u64,
    /// Raw signed entries keyed by user id.
    pub entries: BTreeMap<u64, Vec<u8>>,
}

/// Version structure server boundary.
pub trait VersionServer: Send + Sync {
    /// Returns every user's latest published entry.
    fn fetch_all(&self) -> StoreResult<VersionSnapshot>;

    /// Replaces `user`'s entry with `bytes` if the list is still at
    /// `expected_generation`. Returns the new generation.
    fn publish(&self, user: u64, expected_generation: u64, bytes: Vec<u8>) -> StoreResult<u64>;
}

/// In-memory version server. Thread-safe via RwLock.
pub struct MemoryVersionServer {
    state: RwLock<VersionSnapshot>,
    available: AtomicBool,
}

impl MemoryVersionServer {
    /// Creates a server with no published entries.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(VersionSnapshot::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the server going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the raw entry for `user`, if any.
    pub fn entry(&self, user: u64) -> Option<Vec<u8>> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.entries.get(&user).cloned())
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.state.read().map(|s| s.generation).unwrap_or(0)
    }

    /// Unconditionally replaces `user`'s entry, bypassing the compare-and-swap.
    /// Models a server that rolls back or forges entries.
    pub fn force_entry(&self, user: u64, bytes: Vec<u8>) {
        if let Ok(mut state) = self.state.write() {
            state.entries.insert(user, bytes);
            state.generation += 1;
        }
    }

    /// Drops `user`'s entry, bypassing the compare-and-swap.
    pub fn remove_entry(&self, user: u64) {
        if let Ok(mut state) = self.state.write() {
            state.entries.remove(&user);
            state.generation += 1;
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "version server unreachable".to_string(),
            })
        }
    }
}

impl Default for MemoryVersionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionServer for MemoryVersionServer {
    fn fetch_all(&self) -> StoreResult<VersionSnapshot> {
        self.check_available()?;
        let state = self.state.read().map_err(|e| StoreError::Unavailable {
            reason: format!("lock poisoned: {}", e),
        })?;
        Ok(state.clone())
    }

    fn publish(&self, user: u64, expected_generation: u64, bytes: Vec<u8>) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().map_err(|e| StoreError::Unavailable {
            reason: format!("lock poisoned: {}", e),
        })?;
        if state.generation != expected_generation {
            warn!(
                user,
                expected_generation,
                current = state.generation,
                "rejected stale version structure publish"
            );
            return Err(StoreError::Conflict {
                user,
                reason: format!(
                    "list advanced from generation {} to {}",
                    expected_generation, state.generation
                ),
            });
        }
        state.entries.insert(user, bytes);
        state.generation += 1;
        debug!(user, generation = state.generation, "published version structure");
        Ok(state.generation)
    }
}
