//! Directories: an ordered list of (name, i-handle) entries.
//!
//! The entry list is the payload of a directory inode, so it is stored (and
//! encrypted) exactly like file contents. Entry order is insertion order and
//! is what `readdir` offsets count against.

use secfs_crypto::{EncryptionAlgorithm, SymmetricKey};
use secfs_store::{BlockHash, BlockStore};
use serde::{Deserialize, Serialize};

use crate::inode::Inode;
use crate::types::{IHandle, MetaError};

/// A single directory entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (arbitrary bytes)
    pub name: Vec<u8>,
    /// Target handle
    pub target: IHandle,
}

/// A directory loaded into memory.
#[derive(Clone, Debug)]
pub struct Directory {
    handle: IHandle,
    inode: Inode,
    entries: Vec<DirEntry>,
}

impl Directory {
    /// Loads the directory whose inode is `inode`.
    ///
    /// Encrypted directories need `key`; a wrong key surfaces as an
    /// `IntegrityFailure` from authenticated decryption.
    pub fn load(
        store: &dyn BlockStore,
        handle: IHandle,
        inode: Inode,
        key: Option<&SymmetricKey>,
    ) -> Result<Self, MetaError> {
        if !inode.is_dir() {
            return Err(MetaError::NotADirectory(handle));
        }
        let payload = inode.read_payload(store, &handle, key)?;
        let entries = if payload.is_empty() {
            Vec::new()
        } else {
            bincode::deserialize(&payload).map_err(|e| {
                MetaError::IntegrityFailure(format!("undecodable directory {}: {}", handle, e))
            })?
        };
        Ok(Self {
            handle,
            inode,
            entries,
        })
    }

    /// Starts an empty directory backed by `inode`.
    pub fn empty(handle: IHandle, inode: Inode) -> Self {
        Self {
            handle,
            inode,
            entries: Vec::new(),
        }
    }

    /// Handle this directory was loaded from.
    pub fn handle(&self) -> IHandle {
        self.handle
    }

    /// The directory's inode as of the last load or store.
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Entries from index `offset` on, each tagged with its index plus one.
    ///
    /// A tag is the offset to pass back to continue after that entry, so
    /// listing from 0 tags the first entry 1.
    pub fn listing(&self, offset: usize) -> Vec<(DirEntry, usize)> {
        self.entries
            .iter()
            .enumerate()
            .skip(offset)
            .map(|(n, entry)| (entry.clone(), n + 1))
            .collect()
    }

    /// Returns the target of `name`, if present.
    pub fn find(&self, name: &[u8]) -> Option<IHandle> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.target)
    }

    /// Appends an entry. Names are unique within a directory.
    pub fn add(&mut self, name: &[u8], target: IHandle) -> Result<(), MetaError> {
        if self.find(name).is_some() {
            return Err(MetaError::NameExists {
                parent: self.handle,
                name: String::from_utf8_lossy(name).into_owned(),
            });
        }
        self.entries.push(DirEntry {
            name: name.to_vec(),
            target,
        });
        Ok(())
    }

    /// Writes the entry list as a new payload and stores a new inode.
    ///
    /// Returns the new inode hash and the superseded payload blocks.
    pub fn store(
        &mut self,
        store: &dyn BlockStore,
        key: Option<&SymmetricKey>,
        cipher: EncryptionAlgorithm,
    ) -> Result<(BlockHash, Vec<BlockHash>), MetaError> {
        let payload = bincode::serialize(&self.entries)?;
        let old_blocks = self
            .inode
            .write_payload(store, &self.handle, &payload, key, cipher)?;
        let hash = self.inode.store(store)?;
        Ok((hash, old_blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeKind;
    use crate::types::Principal;
    use secfs_store::MemoryBlockStore;

    fn root() -> IHandle {
        IHandle::allocated(Principal::user(0), 0)
    }

    fn child(slot: u64) -> IHandle {
        IHandle::allocated(Principal::user(0), slot)
    }

    #[test]
    fn test_add_and_find() {
        let mut dir = Directory::empty(root(), Inode::new(InodeKind::Directory, false));
        dir.add(b".", root()).unwrap();
        dir.add(b"a.txt", child(1)).unwrap();
        assert_eq!(dir.find(b"a.txt"), Some(child(1)));
        assert_eq!(dir.find(b"missing"), None);
        assert_eq!(dir.entries().len(), 2);
    }

    #[test]
    fn test_listing_tags_are_index_plus_one() {
        let mut dir = Directory::empty(root(), Inode::new(InodeKind::Directory, false));
        for (slot, name) in [b"x", b"y", b"z"].iter().enumerate() {
            dir.add(*name, child(slot as u64 + 1)).unwrap();
        }

        let tail = dir.listing(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0.name, b"y".to_vec());
        assert_eq!(tail[0].1, 2);
        assert_eq!(tail[1].0.name, b"z".to_vec());
        assert_eq!(tail[1].1, 3);

        let tags: Vec<usize> = dir.listing(0).iter().map(|(_, n)| *n).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert!(dir.listing(3).is_empty());
        assert!(dir.listing(usize::MAX).is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut dir = Directory::empty(root(), Inode::new(InodeKind::Directory, false));
        dir.add(b"a", child(1)).unwrap();
        match dir.add(b"a", child(2)) {
            Err(MetaError::NameExists { name, .. }) => assert_eq!(name, "a"),
            other => panic!("expected NameExists, got {:?}", other),
        }
        assert_eq!(dir.find(b"a"), Some(child(1)));
    }

    #[test]
    fn test_store_then_load_preserves_order() {
        let store = MemoryBlockStore::new();
        let mut dir = Directory::empty(root(), Inode::new(InodeKind::Directory, false));
        let order: [&[u8]; 3] = [b"c", b"a", b"b"];
        for (n, name) in order.iter().enumerate() {
            dir.add(name, child(n as u64 + 1)).unwrap();
        }
        let (hash, old) = dir
            .store(&store, None, EncryptionAlgorithm::default())
            .unwrap();
        assert!(old.is_empty());

        let inode = Inode::load(&store, &hash).unwrap();
        let loaded = Directory::load(&store, root(), inode, None).unwrap();
        let names: Vec<&[u8]> = loaded.entries().iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, order.to_vec());
    }

    #[test]
    fn test_encrypted_directory() {
        let store = MemoryBlockStore::new();
        let key = SymmetricKey::generate();
        let mut dir = Directory::empty(root(), Inode::new(InodeKind::Directory, true));
        dir.add(b"secret", child(1)).unwrap();
        let (hash, _) = dir
            .store(&store, Some(&key), EncryptionAlgorithm::default())
            .unwrap();
        let inode = Inode::load(&store, &hash).unwrap();

        assert!(matches!(
            Directory::load(&store, root(), inode.clone(), None),
            Err(MetaError::MissingKey(_))
        ));
        assert!(matches!(
            Directory::load(&store, root(), inode.clone(), Some(&SymmetricKey::generate())),
            Err(MetaError::IntegrityFailure(_))
        ));
        let loaded = Directory::load(&store, root(), inode, Some(&key)).unwrap();
        assert_eq!(loaded.find(b"secret"), Some(child(1)));
    }

    #[test]
    fn test_file_is_not_a_directory() {
        let store = MemoryBlockStore::new();
        assert!(matches!(
            Directory::load(&store, child(1), Inode::new(InodeKind::File, false), None),
            Err(MetaError::NotADirectory(_))
        ));
    }
}
