//! I-tables and the client-side pointer table.
//!
//! Every principal owns one i-table mapping slot numbers to targets. A user
//! table maps slots directly to inode hashes. A group table maps slots to
//! user i-handles, so a group file is always stored in some member's own
//! table and the group slot only records which member wrote it last.
//!
//! The [`PointerTable`] holds the tables this client loaded during its last
//! refresh, resolves handles through them and applies `modmap` updates. It
//! records which principals' tables changed so the caller can store the new
//! tables and sign a fresh version structure for each.

use std::collections::{BTreeMap, BTreeSet};

use secfs_store::BlockHash;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::*;

/// Target of an i-table slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mapping {
    /// User tables: the inode stored under this hash
    Inode(BlockHash),
    /// Group tables: the member's handle that holds the inode
    Indirect(IHandle),
}

/// A principal's slot table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Itable {
    mapping: BTreeMap<u64, Mapping>,
}

impl Itable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mapping stored in `slot`.
    pub fn get(&self, slot: u64) -> Option<&Mapping> {
        self.mapping.get(&slot)
    }

    /// Returns true if `slot` is in use.
    pub fn contains(&self, slot: u64) -> bool {
        self.mapping.contains_key(&slot)
    }

    /// Stores `target` in `slot`, replacing any previous value.
    pub fn set(&mut self, slot: u64, target: Mapping) {
        self.mapping.insert(slot, target);
    }

    /// Lowest slot number not yet in use.
    pub fn next_free_slot(&self) -> u64 {
        let mut candidate = 0;
        for slot in self.mapping.keys() {
            if *slot != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }

    /// Number of used slots.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Returns true if no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Serializes the table for block storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a table fetched from block storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetaError> {
        bincode::deserialize(bytes)
            .map_err(|e| MetaError::IntegrityFailure(format!("undecodable i-table: {}", e)))
    }
}

/// The tables this client currently trusts, keyed by owner.
#[derive(Debug, Default)]
pub struct PointerTable {
    tables: BTreeMap<Principal, Itable>,
    dirty: BTreeSet<Principal>,
}

impl PointerTable {
    /// Creates an empty pointer table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every loaded table and pending change.
    pub fn clear(&mut self) {
        self.tables.clear();
        self.dirty.clear();
    }

    /// Installs a table fetched during refresh.
    pub fn load(&mut self, owner: Principal, table: Itable) {
        self.tables.insert(owner, table);
    }

    /// Returns the table owned by `owner`.
    pub fn table(&self, owner: Principal) -> Option<&Itable> {
        self.tables.get(&owner)
    }

    /// Returns the raw mapping in `handle`'s slot, without following groups.
    /// `None` means the slot has never been written.
    pub fn mapping(&self, handle: &IHandle) -> Result<Option<Mapping>, MetaError> {
        let key = handle.key()?;
        let mapping = match self.tables.get(&key.principal).and_then(|t| t.get(key.slot)) {
            Some(m) => *m,
            None => return Ok(None),
        };
        match (key.principal, mapping) {
            (Principal::User(_), Mapping::Inode(_)) => Ok(Some(mapping)),
            (Principal::Group(_), Mapping::Indirect(target))
                if matches!(target.principal(), Principal::User(_)) && target.is_allocated() =>
            {
                Ok(Some(mapping))
            }
            _ => Err(MetaError::IntegrityFailure(format!(
                "slot {} holds a mapping of the wrong shape",
                handle
            ))),
        }
    }

    /// Returns the user handle whose slot actually holds `handle`'s inode.
    pub fn holder(&self, handle: &IHandle) -> Result<Option<IHandle>, MetaError> {
        Ok(self.mapping(handle)?.map(|m| match m {
            Mapping::Inode(_) => *handle,
            Mapping::Indirect(user_handle) => user_handle,
        }))
    }

    /// Resolves `handle` to its current inode hash, following group
    /// indirection. `None` means nothing was ever written there.
    pub fn resolve(&self, handle: &IHandle) -> Result<Option<BlockHash>, MetaError> {
        match self.mapping(handle)? {
            None => Ok(None),
            Some(Mapping::Inode(hash)) => Ok(Some(hash)),
            Some(Mapping::Indirect(user_handle)) => match self.mapping(&user_handle)? {
                None => Ok(None),
                Some(Mapping::Inode(hash)) => Ok(Some(hash)),
                Some(Mapping::Indirect(_)) => Err(MetaError::IntegrityFailure(format!(
                    "{} resolves through more than one level of indirection",
                    handle
                ))),
            },
        }
    }

    /// Points `handle` at `target` on behalf of `actor`.
    ///
    /// An unallocated handle is given the lowest free slot in its owner's
    /// table. A user may only change their own table. For a group handle
    /// and an inode target, the inode lands in the actor's own table first:
    /// if the actor wrote the group slot last, their existing slot is reused,
    /// otherwise a new one is allocated and the group slot is redirected to
    /// it. Returns the (now allocated) handle.
    pub fn modmap(
        &mut self,
        actor: UserId,
        handle: IHandle,
        target: Mapping,
    ) -> Result<IHandle, MetaError> {
        let mut handle = handle;
        let mut target = target;

        match handle.principal() {
            Principal::User(owner) if owner != actor => {
                return Err(MetaError::Conflict(format!(
                    "user {} may not modify the i-table of {}",
                    actor,
                    handle.principal()
                )));
            }
            Principal::User(_) => {
                if let Mapping::Indirect(_) = target {
                    return Err(MetaError::InvalidMapping(format!(
                        "user slot {} cannot point at another handle",
                        handle
                    )));
                }
            }
            Principal::Group(_) => {
                let current = if handle.is_allocated() {
                    self.mapping(&handle)?
                } else {
                    None
                };
                match (current, target) {
                    (_, Mapping::Indirect(user_handle)) => {
                        if !matches!(user_handle.principal(), Principal::User(_))
                            || !user_handle.is_allocated()
                        {
                            return Err(MetaError::InvalidMapping(format!(
                                "group slot {} must point at an allocated user handle, not {}",
                                handle, user_handle
                            )));
                        }
                    }
                    (Some(Mapping::Indirect(user_handle)), Mapping::Inode(_))
                        if user_handle.principal() == Principal::User(actor) =>
                    {
                        trace!(%handle, %user_handle, "reusing own slot behind group handle");
                        return self.modmap(actor, user_handle, target).map(|_| handle);
                    }
                    (_, Mapping::Inode(_)) => {
                        let user_handle =
                            self.modmap(actor, IHandle::new(Principal::User(actor)), target)?;
                        target = Mapping::Indirect(user_handle);
                    }
                }
            }
        }

        let owner = handle.principal();
        if handle.is_allocated() && !self.tables.contains_key(&owner) {
            return Err(MetaError::NotFound(format!("i-table of {}", owner)));
        }
        let table = self.tables.entry(owner).or_default();
        match handle.slot() {
            Some(slot) if !table.contains(slot) => {
                return Err(MetaError::NotFound(format!("slot {}", handle)));
            }
            Some(_) => {}
            None => handle.allocate(table.next_free_slot())?,
        }
        let slot = handle.key()?.slot;
        table.set(slot, target);
        self.dirty.insert(owner);
        debug!(%actor, %handle, ?target, "modmap");
        Ok(handle)
    }

    /// Returns the principals whose tables changed since the last call,
    /// users before groups, and forgets them.
    pub fn take_dirty(&mut self) -> Vec<Principal> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hash(n: u8) -> BlockHash {
        BlockHash::of(&[n])
    }

    fn u(id: u64) -> UserId {
        UserId::new(id)
    }

    #[test]
    fn test_next_free_slot_fills_gaps() {
        let mut t = Itable::new();
        assert_eq!(t.next_free_slot(), 0);
        t.set(0, Mapping::Inode(hash(0)));
        t.set(2, Mapping::Inode(hash(2)));
        assert_eq!(t.next_free_slot(), 1);
        t.set(1, Mapping::Inode(hash(1)));
        assert_eq!(t.next_free_slot(), 3);
    }

    #[test]
    fn test_allocate_and_resolve_user_slot() {
        let mut pt = PointerTable::new();
        let i = pt
            .modmap(u(1), IHandle::new(Principal::user(1)), Mapping::Inode(hash(1)))
            .unwrap();
        assert_eq!(i, IHandle::allocated(Principal::user(1), 0));
        assert_eq!(pt.resolve(&i).unwrap(), Some(hash(1)));
        assert_eq!(pt.take_dirty(), vec![Principal::user(1)]);
        assert!(pt.take_dirty().is_empty());

        let i2 = pt
            .modmap(u(1), IHandle::new(Principal::user(1)), Mapping::Inode(hash(2)))
            .unwrap();
        assert_eq!(i2.slot(), Some(1));
    }

    #[test]
    fn test_overwrite_keeps_slot() {
        let mut pt = PointerTable::new();
        let i = pt
            .modmap(u(1), IHandle::new(Principal::user(1)), Mapping::Inode(hash(1)))
            .unwrap();
        let again = pt.modmap(u(1), i, Mapping::Inode(hash(9))).unwrap();
        assert_eq!(again, i);
        assert_eq!(pt.resolve(&i).unwrap(), Some(hash(9)));
    }

    #[test]
    fn test_foreign_user_table_conflicts() {
        let mut pt = PointerTable::new();
        assert!(matches!(
            pt.modmap(u(2), IHandle::new(Principal::user(1)), Mapping::Inode(hash(1))),
            Err(MetaError::Conflict(_))
        ));
    }

    #[test]
    fn test_unknown_slot_not_found() {
        let mut pt = PointerTable::new();
        let bogus = IHandle::allocated(Principal::user(1), 5);
        assert_eq!(pt.resolve(&bogus).unwrap(), None);
        assert!(matches!(
            pt.modmap(u(1), bogus, Mapping::Inode(hash(1))),
            Err(MetaError::NotFound(_))
        ));
        assert!(matches!(
            pt.resolve(&IHandle::new(Principal::user(1))),
            Err(MetaError::Unallocated(_))
        ));
    }

    #[test]
    fn test_group_write_goes_through_member_slot() {
        let mut pt = PointerTable::new();
        let g = pt
            .modmap(u(1), IHandle::new(Principal::group(7)), Mapping::Inode(hash(1)))
            .unwrap();
        assert_eq!(g, IHandle::allocated(Principal::group(7), 0));
        let holder = pt.holder(&g).unwrap().unwrap();
        assert_eq!(holder, IHandle::allocated(Principal::user(1), 0));
        assert_eq!(pt.resolve(&g).unwrap(), Some(hash(1)));
        assert_eq!(
            pt.take_dirty(),
            vec![Principal::user(1), Principal::group(7)]
        );

        // Same writer again: reuses its slot, group table untouched.
        pt.modmap(u(1), g, Mapping::Inode(hash(2))).unwrap();
        assert_eq!(pt.holder(&g).unwrap(), Some(holder));
        assert_eq!(pt.resolve(&g).unwrap(), Some(hash(2)));
        assert_eq!(pt.take_dirty(), vec![Principal::user(1)]);

        // Another member: gets their own slot, group slot redirected.
        pt.modmap(u(2), g, Mapping::Inode(hash(3))).unwrap();
        assert_eq!(
            pt.holder(&g).unwrap(),
            Some(IHandle::allocated(Principal::user(2), 0))
        );
        assert_eq!(pt.resolve(&g).unwrap(), Some(hash(3)));
        assert_eq!(pt.resolve(&holder).unwrap(), Some(hash(2)));
    }

    #[test]
    fn test_group_slot_linked_to_existing_user_handle() {
        let mut pt = PointerTable::new();
        let i = pt
            .modmap(u(1), IHandle::new(Principal::user(1)), Mapping::Inode(hash(1)))
            .unwrap();
        let g = pt
            .modmap(u(1), IHandle::new(Principal::group(7)), Mapping::Indirect(i))
            .unwrap();
        assert_eq!(pt.resolve(&g).unwrap(), Some(hash(1)));
    }

    #[test]
    fn test_wrong_shapes_rejected() {
        let mut pt = PointerTable::new();
        let g = IHandle::allocated(Principal::group(7), 0);
        assert!(matches!(
            pt.modmap(u(1), IHandle::new(Principal::user(1)), Mapping::Indirect(g)),
            Err(MetaError::InvalidMapping(_))
        ));
        assert!(matches!(
            pt.modmap(
                u(1),
                IHandle::new(Principal::group(7)),
                Mapping::Indirect(IHandle::new(Principal::user(1)))
            ),
            Err(MetaError::InvalidMapping(_))
        ));

        let mut forged = Itable::new();
        forged.set(0, Mapping::Inode(hash(1)));
        pt.load(Principal::group(7), forged);
        assert!(matches!(
            pt.resolve(&g),
            Err(MetaError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_itable_bytes_roundtrip() {
        let mut t = Itable::new();
        t.set(0, Mapping::Inode(hash(0)));
        t.set(3, Mapping::Indirect(IHandle::allocated(Principal::user(2), 1)));
        assert_eq!(Itable::from_bytes(&t.to_bytes().unwrap()).unwrap(), t);
        assert!(Itable::from_bytes(&[0xff]).is_err());
    }

    proptest! {
        #[test]
        fn prop_allocations_are_dense_and_distinct(n in 1usize..64) {
            let mut pt = PointerTable::new();
            let mut slots = Vec::new();
            for k in 0..n {
                let i = pt.modmap(u(1), IHandle::new(Principal::user(1)), Mapping::Inode(hash(k as u8))).unwrap();
                slots.push(i.slot().unwrap());
            }
            let expected: Vec<u64> = (0..n as u64).collect();
            prop_assert_eq!(slots, expected);
        }
    }
}
