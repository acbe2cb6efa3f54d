//! Inodes: per-object metadata plus the list of data blocks.
//!
//! An inode is stored as one content-addressed block (bincode encoding), so
//! it is immutable once written. Changing a file means building a new inode,
//! storing it, and pointing the owner's i-table slot at the new hash.
//! Metadata is never encrypted; only the data blocks are, when
//! `encrypted` is set.

use secfs_crypto::{open, seal, EncryptionAlgorithm, SymmetricKey};
use secfs_store::{BlockHash, BlockStore};
use serde::{Deserialize, Serialize};

use crate::types::{IHandle, MetaError, Timestamp};

/// Type of object an inode describes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// Per-object metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// File or directory
    pub kind: InodeKind,
    /// Execute permission bit
    pub executable: bool,
    /// Creation time
    pub ctime: Timestamp,
    /// Last modification time
    pub mtime: Timestamp,
    /// Plaintext payload length in bytes
    pub size: u64,
    /// Whether the data blocks are encrypted
    pub encrypted: bool,
    /// Content hashes of the data blocks, in order
    pub blocks: Vec<BlockHash>,
}

impl Inode {
    /// Creates an empty inode stamped with the current time.
    pub fn new(kind: InodeKind, encrypted: bool) -> Self {
        let now = Timestamp::now();
        Self {
            kind,
            executable: kind == InodeKind::Directory,
            ctime: now,
            mtime: now,
            size: 0,
            encrypted,
            blocks: Vec::new(),
        }
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    /// Serializes this inode for block storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes an inode from block storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetaError> {
        bincode::deserialize(bytes)
            .map_err(|e| MetaError::IntegrityFailure(format!("undecodable inode: {}", e)))
    }

    /// Fetches and decodes the inode stored under `hash`.
    pub fn load(store: &dyn BlockStore, hash: &BlockHash) -> Result<Self, MetaError> {
        let bytes = store.fetch_verified(hash)?;
        Self::from_bytes(&bytes)
    }

    /// Stores this inode and returns its hash.
    pub fn store(&self, store: &dyn BlockStore) -> Result<BlockHash, MetaError> {
        Ok(store.store(&self.to_bytes()?)?)
    }

    /// Reads and, if needed, decrypts the whole payload.
    ///
    /// `owner` only names the object in errors. A payload whose length
    /// differs from `size` is an `IntegrityFailure`.
    pub fn read_payload(
        &self,
        store: &dyn BlockStore,
        owner: &IHandle,
        key: Option<&SymmetricKey>,
    ) -> Result<Vec<u8>, MetaError> {
        let key = match (self.encrypted, key) {
            (true, None) => return Err(MetaError::MissingKey(*owner)),
            (true, Some(k)) => Some(k),
            (false, _) => None,
        };
        let mut out = Vec::new();
        for hash in &self.blocks {
            let raw = store.fetch_verified(hash)?;
            match key {
                Some(k) => out.extend_from_slice(&open(&raw, k)?),
                None => out.extend_from_slice(&raw),
            }
        }
        if out.len() as u64 != self.size {
            return Err(MetaError::IntegrityFailure(format!(
                "{} records {} bytes but its blocks hold {}",
                owner,
                self.size,
                out.len()
            )));
        }
        Ok(out)
    }

    /// Stores `contents` as this inode's new payload.
    ///
    /// Updates `blocks`, `size` and `mtime`. The previous payload blocks are
    /// returned so the caller can free them once the change is committed.
    pub fn write_payload(
        &mut self,
        store: &dyn BlockStore,
        owner: &IHandle,
        contents: &[u8],
        key: Option<&SymmetricKey>,
        cipher: EncryptionAlgorithm,
    ) -> Result<Vec<BlockHash>, MetaError> {
        let blocks = if contents.is_empty() {
            Vec::new()
        } else if self.encrypted {
            let key = key.ok_or(MetaError::MissingKey(*owner))?;
            vec![store.store(&seal(contents, key, cipher)?)?]
        } else {
            vec![store.store(contents)?]
        };
        self.size = contents.len() as u64;
        self.mtime = Timestamp::now();
        Ok(std::mem::replace(&mut self.blocks, blocks))
    }
}
