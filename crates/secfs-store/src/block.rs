//! Content-addressed block storage.
//!
//! Blocks are immutable byte strings named by the BLAKE3 hash of their
//! contents. The server side only keeps bytes and reference counts; clients
//! never trust returned bytes without re-hashing them (see
//! [`BlockStore::fetch_verified`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// A 32-byte BLAKE3 hash identifying a block's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Computes the content address of `data`.
    pub fn of(data: &[u8]) -> Self {
        BlockHash(*blake3::hash(data).as_bytes())
    }

    /// Returns the hash as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", &self.to_hex()[..16])
    }
}

/// Content-addressed block store boundary.
///
/// Implementations may live across a network; every call may fail with
/// [`StoreError::Unavailable`], which is never used for a missing block.
pub trait BlockStore: Send + Sync {
    /// Stores `data` and returns its content hash. Storing identical bytes
    /// twice yields the same hash and no new data.
    fn store(&self, data: &[u8]) -> StoreResult<BlockHash>;

    /// Returns the bytes stored under `hash`.
    fn fetch(&self, hash: &BlockHash) -> StoreResult<Vec<u8>>;

    /// Signals that one reference to `hash` is gone. Reclamation is
    /// best-effort and may be deferred.
    fn free(&self, hash: &BlockHash) -> StoreResult<()>;

    /// Fetches `hash` and checks the returned bytes actually hash to it.
    fn fetch_verified(&self, hash: &BlockHash) -> StoreResult<Vec<u8>> {
        let data = self.fetch(hash)?;
        let actual = BlockHash::of(&data);
        if actual != *hash {
            return Err(StoreError::HashMismatch {
                expected: *hash,
                actual,
            });
        }
        Ok(data)
    }
}

struct StoredBlock {
    data: Vec<u8>,
    refs: u64,
}

/// Counters describing store traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStoreStats {
    /// Number of `store` calls.
    pub stores: u64,
    /// Number of `store` calls whose content was already present.
    pub dedup_hits: u64,
    /// Number of `free` calls.
    pub frees: u64,
    /// Number of blocks reclaimed after their last reference was freed.
    pub reclaimed: u64,
}

/// In-memory reference-counted block store. Thread-safe via RwLock.
///
/// Stands in for the remote block server in tests and the bootstrap binary.
/// Availability can be toggled to simulate transport outages.
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<BlockHash, StoredBlock>>,
    stats: RwLock<BlockStoreStats>,
    available: AtomicBool,
}

impl MemoryBlockStore {
    /// Creates a new empty in-memory block store.
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            stats: RwLock::new(BlockStoreStats::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the server going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current reference count for `hash` (0 if absent).
    pub fn refcount(&self, hash: &BlockHash) -> u64 {
        self.blocks
            .read()
            .map(|b| b.get(hash).map(|s| s.refs).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Returns true if the block is currently held.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.refcount(hash) > 0
    }

    /// Number of distinct blocks held.
    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of traffic counters.
    pub fn stats(&self) -> BlockStoreStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Overwrites the bytes under `hash` without re-hashing, modelling a
    /// server that tampers with stored content.
    pub fn corrupt(&self, hash: &BlockHash, data: Vec<u8>) -> StoreResult<()> {
        let mut blocks = self.blocks.write().map_err(poisoned)?;
        match blocks.get_mut(hash) {
            Some(block) => {
                block.data = data;
                Ok(())
            }
            None => Err(StoreError::BlockNotFound { hash: *hash }),
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "block server unreachable".to_string(),
            })
        }
    }

    fn bump<F: FnOnce(&mut BlockStoreStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: fmt::Display>(e: E) -> StoreError {
    StoreError::Unavailable {
        reason: format!("lock poisoned: {}", e),
    }
}

impl BlockStore for MemoryBlockStore {
    fn store(&self, data: &[u8]) -> StoreResult<BlockHash> {
        self.check_available()?;
        let hash = BlockHash::of(data);
        let mut blocks = self.blocks.write().map_err(poisoned)?;
        let dedup = match blocks.get_mut(&hash) {
            Some(block) => {
                block.refs += 1;
                true
            }
            None => {
                blocks.insert(
                    hash,
                    StoredBlock {
                        data: data.to_vec(),
                        refs: 1,
                    },
                );
                false
            }
        };
        drop(blocks);
        self.bump(|s| {
            s.stores += 1;
            if dedup {
                s.dedup_hits += 1;
            }
        });
        debug!(hash = %hash, size = data.len(), dedup, "stored block");
        Ok(hash)
    }

    fn fetch(&self, hash: &BlockHash) -> StoreResult<Vec<u8>> {
        self.check_available()?;
        let blocks = self.blocks.read().map_err(poisoned)?;
        blocks
            .get(hash)
            .map(|b| b.data.clone())
            .ok_or(StoreError::BlockNotFound { hash: *hash })
    }

    fn free(&self, hash: &BlockHash) -> StoreResult<()> {
        self.check_available()?;
        let mut blocks = self.blocks.write().map_err(poisoned)?;
        let reclaimed = match blocks.get_mut(hash) {
            Some(block) if block.refs <= 1 => {
                blocks.remove(hash);
                true
            }
            Some(block) => {
                block.refs -= 1;
                false
            }
            None => {
                debug!(hash = %hash, "free of unknown block ignored");
                false
            }
        };
        drop(blocks);
        self.bump(|s| {
            s.frees += 1;
            if reclaimed {
                s.reclaimed += 1;
            }
        });
        Ok(())
    }
}
