//! Principal directories and access checks
//!
//! The user directory maps users to their public keys and the group
//! directory maps groups to member sets. Both are bootstrapped by the share
//! owner and persisted as the root-level `.users` and `.groups` files.
//!
//! Access rules: a user-owned handle may be written
//! only by that user, a group-owned handle by any member. Reads follow the
//! same rule for encrypted objects; unencrypted objects are world-readable.

use std::collections::{BTreeMap, BTreeSet};

use secfs_crypto::PublicKeys;
use serde::{Deserialize, Serialize};

use crate::inode::Inode;
use crate::types::*;

/// Lookup of a user's public keys.
pub trait PublicKeyDirectory {
    /// Returns the keys on record for `user`.
    fn lookup_public_key(&self, user: UserId) -> Result<PublicKeys, MetaError>;
}

/// Lookup of group membership.
pub trait GroupMembership {
    /// Returns the members of `group`, or `None` if the group is unknown.
    fn members_of(&self, group: GroupId) -> Option<BTreeSet<UserId>>;
}

/// Users and their public keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDirectory {
    keys: BTreeMap<UserId, PublicKeys>,
}

impl UserDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records or replaces `user`'s keys.
    pub fn insert(&mut self, user: UserId, keys: PublicKeys) {
        self.keys.insert(user, keys);
    }

    /// Returns true if `user` is known.
    pub fn contains(&self, user: UserId) -> bool {
        self.keys.contains_key(&user)
    }

    /// Iterates over known users in id order.
    pub fn users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.keys.keys().copied()
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no users are known.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Encodes the directory as the contents of `.users`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes the contents of `.users`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetaError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl PublicKeyDirectory for UserDirectory {
    fn lookup_public_key(&self, user: UserId) -> Result<PublicKeys, MetaError> {
        self.keys
            .get(&user)
            .copied()
            .ok_or(MetaError::UnknownPrincipal(Principal::User(user)))
    }
}

/// Groups and their members.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDirectory {
    members: BTreeMap<GroupId, BTreeSet<UserId>>,
}

impl GroupDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records or replaces the member set of `group`.
    pub fn insert(&mut self, group: GroupId, members: impl IntoIterator<Item = UserId>) {
        self.members.insert(group, members.into_iter().collect());
    }

    /// Returns true if `group` is known.
    pub fn contains(&self, group: GroupId) -> bool {
        self.members.contains_key(&group)
    }

    /// Returns true if `user` belongs to `group`.
    pub fn is_member(&self, group: GroupId, user: UserId) -> bool {
        self.members
            .get(&group)
            .map(|m| m.contains(&user))
            .unwrap_or(false)
    }

    /// Iterates over known groups in id order.
    pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.members.keys().copied()
    }

    /// Encodes the directory as the contents of `.groups`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes the contents of `.groups`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetaError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl GroupMembership for GroupDirectory {
    fn members_of(&self, group: GroupId) -> Option<BTreeSet<UserId>> {
        self.members.get(&group).cloned()
    }
}

/// The rule that governs writes to `target`.
pub fn denial_reason(target: &IHandle) -> DenialReason {
    match target.principal() {
        Principal::User(_) => DenialReason::OwnerOnly,
        Principal::Group(_) => DenialReason::GroupMemberOnly,
    }
}

/// Returns true if `user` may modify `target`.
pub fn can_write(groups: &dyn GroupMembership, user: UserId, target: &IHandle) -> bool {
    match target.principal() {
        Principal::User(owner) => owner == user,
        Principal::Group(group) => groups
            .members_of(group)
            .map(|m| m.contains(&user))
            .unwrap_or(false),
    }
}

/// Returns true if `user` may read `target`.
///
/// Unencrypted objects carry no confidentiality, so anyone may read them.
pub fn can_read(
    groups: &dyn GroupMembership,
    user: UserId,
    target: &IHandle,
    encrypted: bool,
) -> bool {
    !encrypted || can_write(groups, user, target)
}

/// Returns true if `user` may execute `target`.
pub fn can_execute(
    groups: &dyn GroupMembership,
    user: UserId,
    target: &IHandle,
    inode: &Inode,
) -> bool {
    inode.executable && can_read(groups, user, target, inode.encrypted)
}

/// Fails with `PermissionDenied` unless `user` may modify `target`.
pub fn check_write(
    groups: &dyn GroupMembership,
    user: UserId,
    target: &IHandle,
    op: &'static str,
) -> Result<(), MetaError> {
    if can_write(groups, user, target) {
        Ok(())
    } else {
        Err(MetaError::PermissionDenied {
            user,
            target: *target,
            op,
            reason: denial_reason(target),
        })
    }
}

/// Fails with `PermissionDenied` unless `user` may read `target`.
pub fn check_read(
    groups: &dyn GroupMembership,
    user: UserId,
    target: &IHandle,
    encrypted: bool,
    op: &'static str,
) -> Result<(), MetaError> {
    if can_read(groups, user, target, encrypted) {
        Ok(())
    } else {
        Err(MetaError::PermissionDenied {
            user,
            target: *target,
            op,
            reason: denial_reason(target),
        })
    }
}
