//! Filesystem session: the user-facing operations.
//!
//! A [`Session`] is one client's view of a share. Every operation follows
//! the same cycle:
//!
//! 1. refresh: fetch all version structures, verify signatures, merge and
//!    check for forks, then load the i-tables the merged view names;
//! 2. run the operation against that view, storing new blocks and updating
//!    the pointer table and the local version structure;
//! 3. commit: publish the actor's new version structure with a
//!    compare-and-swap, then free the blocks the operation superseded.
//!
//! Losing the publish race yields `Conflict`; the session abandons the
//! attempt (releasing the blocks it stored) and reruns the whole operation
//! on a fresh view, up to `max_conflict_retries` times. Read-only
//! operations only refresh.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use secfs_crypto::{SymmetricKey, UserKeys};
use secfs_store::{BlockHash, BlockStore, StoreError, StoreResult, VersionServer};
use tracing::{debug, info, warn};

use crate::access::{self, check_read, check_write, GroupDirectory, GroupMembership, UserDirectory};
use crate::config::SessionConfig;
use crate::directory::{DirEntry, Directory};
use crate::inode::{Inode, InodeKind};
use crate::itable::{Itable, Mapping, PointerTable};
use crate::types::*;
use crate::vsl::{MergedView, VersionStructureList};

/// Root entry holding the encoded [`UserDirectory`].
pub const USERS_FILE: &[u8] = b".users";

/// Root entry holding the encoded [`GroupDirectory`].
pub const GROUPS_FILE: &[u8] = b".groups";

/// Block store wrapper that remembers what the current attempt stored, so an
/// abandoned attempt can release it.
struct JournaledStore {
    inner: Arc<dyn BlockStore>,
    journal: Mutex<Vec<BlockHash>>,
}

impl JournaledStore {
    fn new(inner: Arc<dyn BlockStore>) -> Self {
        Self {
            inner,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Keeps everything stored so far.
    fn forget(&self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.clear();
        }
    }

    /// Releases everything stored since the last `forget`.
    fn roll_back(&self) -> usize {
        let stored = match self.journal.lock() {
            Ok(mut journal) => std::mem::take(&mut *journal),
            Err(_) => return 0,
        };
        for hash in &stored {
            if let Err(e) = self.inner.free(hash) {
                warn!(%hash, error = %e, "could not release block from abandoned attempt");
            }
        }
        stored.len()
    }
}

impl BlockStore for JournaledStore {
    fn store(&self, data: &[u8]) -> StoreResult<BlockHash> {
        let hash = self.inner.store(data)?;
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(hash);
        }
        Ok(hash)
    }

    fn fetch(&self, hash: &BlockHash) -> StoreResult<Vec<u8>> {
        self.inner.fetch(hash)
    }

    fn free(&self, hash: &BlockHash) -> StoreResult<()> {
        self.inner.free(hash)
    }
}

/// One client's session on a share.
pub struct Session {
    config: SessionConfig,
    blocks: JournaledStore,
    versions: Arc<dyn VersionServer>,
    vsl: VersionStructureList,
    tables: PointerTable,
    itable_hashes: BTreeMap<Principal, BlockHash>,
    fresh_itables: BTreeSet<BlockHash>,
    pending_frees: Vec<BlockHash>,
    keys: BTreeMap<UserId, Arc<UserKeys>>,
    users: UserDirectory,
    groups: GroupDirectory,
    root: Option<IHandle>,
}

impl Session {
    /// Opens a session against the given servers. `users` must list every
    /// user whose version structures should be trusted.
    pub fn new(
        config: SessionConfig,
        blocks: Arc<dyn BlockStore>,
        versions: Arc<dyn VersionServer>,
        users: UserDirectory,
        groups: GroupDirectory,
    ) -> Self {
        Self {
            config,
            blocks: JournaledStore::new(blocks),
            versions,
            vsl: VersionStructureList::new(),
            tables: PointerTable::new(),
            itable_hashes: BTreeMap::new(),
            fresh_itables: BTreeSet::new(),
            pending_frees: Vec::new(),
            keys: BTreeMap::new(),
            users,
            groups,
            root: None,
        }
    }

    /// Makes `user`'s private keys available for signing in this session.
    pub fn register_keys(&mut self, user: UserId, keys: Arc<UserKeys>) {
        debug!(%user, "registered signing keys");
        self.keys.insert(user, keys);
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Root directory handle, once known.
    pub fn root(&self) -> Option<IHandle> {
        self.root
    }

    /// Sets the root handle of an existing share.
    pub fn set_root(&mut self, root: IHandle) {
        self.root = Some(root);
    }

    /// Users whose signatures this session accepts.
    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    /// Mutable access to the user directory; see [`Self::save_directories`].
    pub fn users_mut(&mut self) -> &mut UserDirectory {
        &mut self.users
    }

    /// Group membership used for access checks.
    pub fn groups(&self) -> &GroupDirectory {
        &self.groups
    }

    /// Mutable access to the group directory; see [`Self::save_directories`].
    pub fn groups_mut(&mut self) -> &mut GroupDirectory {
        &mut self.groups
    }

    /// The version structure list as of the last refresh.
    pub fn vsl(&self) -> &VersionStructureList {
        &self.vsl
    }

    /// Fetches, verifies and merges the version structures, then loads the
    /// i-tables of the merged view.
    ///
    /// With `strict_integrity` any discarded structure fails the refresh;
    /// otherwise it is logged and that user's table is simply absent. A fork
    /// always fails the refresh and leaves no tables loaded.
    pub fn refresh(&mut self) -> Result<MergedView, MetaError> {
        self.vsl.fetch(self.versions.as_ref())?;
        let events = self.vsl.verify_signatures(&self.users);
        if !events.is_empty() && self.config.strict_integrity {
            let detail: Vec<String> = events.iter().map(|e| e.to_string()).collect();
            return Err(MetaError::IntegrityFailure(detail.join("; ")));
        }

        self.tables.clear();
        self.itable_hashes.clear();
        self.fresh_itables.clear();
        self.pending_frees.clear();

        let view = self.vsl.merge().into_result()?;
        for (user, hash) in &view.user_itables {
            let table = self.load_itable(hash)?;
            self.tables.load(Principal::User(*user), table);
            self.itable_hashes.insert(Principal::User(*user), *hash);
        }
        for (group, (_, hash)) in &view.group_itables {
            let table = self.load_itable(hash)?;
            self.tables.load(Principal::Group(*group), table);
            self.itable_hashes.insert(Principal::Group(*group), *hash);
        }
        debug!(
            generation = self.vsl.generation(),
            users = view.user_itables.len(),
            groups = view.group_itables.len(),
            "refreshed"
        );
        Ok(view)
    }

    fn load_itable(&self, hash: &BlockHash) -> Result<Itable, MetaError> {
        let bytes = self.blocks.fetch_verified(hash).map_err(|e| match e {
            StoreError::BlockNotFound { .. } => {
                MetaError::Conflict(format!("i-table {} vanished during refresh", hash))
            }
            other => other.into(),
        })?;
        Itable::from_bytes(&bytes)
    }

    fn commit(&mut self, actor: UserId) -> Result<(), MetaError> {
        self.vsl.publish(actor, self.versions.as_ref())?;
        self.blocks.forget();
        self.fresh_itables.clear();
        for hash in std::mem::take(&mut self.pending_frees) {
            if let Err(e) = self.blocks.free(&hash) {
                warn!(%hash, error = %e, "could not free superseded block");
            }
        }
        Ok(())
    }

    fn abandon(&mut self) {
        let released = self.blocks.roll_back();
        self.pending_frees.clear();
        self.fresh_itables.clear();
        if released > 0 {
            debug!(released, "abandoned attempt");
        }
    }

    /// Runs a mutating operation as refresh, body, commit, retrying the
    /// whole cycle when it lost a race.
    fn run<T>(
        &mut self,
        actor: UserId,
        op: &'static str,
        mut body: impl FnMut(&mut Self) -> Result<T, MetaError>,
    ) -> Result<T, MetaError> {
        let mut attempt = 0;
        loop {
            let outcome = match self.refresh() {
                Ok(_) => match body(self) {
                    Ok(value) => self.commit(actor).map(|()| value),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.max_conflict_retries && self.lost_race(&e) => {
                    self.abandon();
                    attempt += 1;
                    warn!(op, %actor, attempt, error = %e, "lost a race, retrying");
                }
                Err(e) => {
                    self.abandon();
                    return Err(e);
                }
            }
        }
    }

    /// Runs a read-only operation on a fresh view.
    fn observe<T>(
        &mut self,
        op: &'static str,
        body: impl Fn(&Self) -> Result<T, MetaError>,
    ) -> Result<T, MetaError> {
        let mut attempt = 0;
        loop {
            let outcome = match self.refresh() {
                Ok(_) => body(self),
                Err(e) => Err(e),
            };
            match outcome {
                Err(e) if attempt < self.config.max_conflict_retries && self.lost_race(&e) => {
                    attempt += 1;
                    warn!(op, attempt, error = %e, "view changed underneath, retrying");
                }
                other => return other,
            }
        }
    }

    /// A block that went missing while the list moved on was freed by
    /// another client, so the attempt raced rather than hit a hole.
    fn lost_race(&self, error: &MetaError) -> bool {
        match error {
            MetaError::Conflict(_) => true,
            MetaError::NotFound(_) => self
                .versions
                .fetch_all()
                .map(|snapshot| snapshot.generation != self.vsl.generation())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Points `handle` at `target` and signs a new version structure for
    /// every table that changed.
    fn modmap(
        &mut self,
        actor: UserId,
        handle: IHandle,
        target: Mapping,
    ) -> Result<IHandle, MetaError> {
        let keys = self
            .keys
            .get(&actor)
            .cloned()
            .ok_or(MetaError::SigningKeyUnavailable(actor))?;
        let handle = self.tables.modmap(actor, handle, target)?;

        for principal in self.tables.take_dirty() {
            let bytes = self
                .tables
                .table(principal)
                .ok_or_else(|| MetaError::NotFound(format!("i-table of {}", principal)))?
                .to_bytes()?;
            let hash = self.blocks.store(&bytes)?;
            self.fresh_itables.insert(hash);
            if let Some(old) = self.itable_hashes.insert(principal, hash) {
                // Published group tables stay referenced by other users'
                // structures; only the actor's own or never-published
                // tables are ours to release.
                if self.fresh_itables.contains(&old) || principal == Principal::User(actor) {
                    self.pending_frees.push(old);
                }
            }

            let own = self.itable_hashes.get(&Principal::User(actor)).copied();
            let group_table = if principal.is_group() { Some(hash) } else { None };
            self.vsl
                .update_list(actor, principal, own, group_table, &keys)?;
        }
        Ok(handle)
    }

    /// Re-points an existing handle at `new_hash`. `superseded` is freed
    /// after commit, but only if the same slot was overwritten; when a group
    /// write moved to a new member slot, the old one still references it.
    fn repoint(
        &mut self,
        actor: UserId,
        handle: IHandle,
        new_hash: BlockHash,
        superseded: Vec<BlockHash>,
    ) -> Result<IHandle, MetaError> {
        let before = self.tables.holder(&handle)?;
        let handle = self.modmap(actor, handle, Mapping::Inode(new_hash))?;
        if before.is_some() && self.tables.holder(&handle)? == before {
            self.pending_frees.extend(superseded);
        }
        Ok(handle)
    }

    fn get_inode(&self, handle: &IHandle) -> Result<(BlockHash, Inode), MetaError> {
        let hash = self
            .tables
            .resolve(handle)?
            .ok_or_else(|| MetaError::NotFound(handle.to_string()))?;
        let inode = Inode::load(&self.blocks, &hash)?;
        Ok((hash, inode))
    }

    /// Creates a new share rooted in a directory owned by `owner`.
    ///
    /// The root holds `.` and `..` (both itself) plus the `.users` and
    /// `.groups` files, written from this session's directories.
    pub fn init(&mut self, owner: UserId) -> Result<IHandle, MetaError> {
        if !self.users.contains(owner) {
            return Err(MetaError::UnknownPrincipal(Principal::User(owner)));
        }
        let root = self.run(owner, "init", |s| s.init_inner(owner))?;
        self.root = Some(root);
        info!(%owner, %root, "initialized share");
        Ok(root)
    }

    fn init_inner(&mut self, owner: UserId) -> Result<IHandle, MetaError> {
        let node = Inode::new(InodeKind::Directory, false);
        let first = node.store(&self.blocks)?;
        let root = self.modmap(
            owner,
            IHandle::new(Principal::User(owner)),
            Mapping::Inode(first),
        )?;

        let mut dir = Directory::empty(root, node);
        dir.add(b".", root)?;
        dir.add(b"..", root)?;
        let (hash, mut superseded) = dir.store(&self.blocks, None, self.config.cipher)?;
        superseded.push(first);
        self.repoint(owner, root, hash, superseded)?;

        let files = [
            (USERS_FILE, self.users.to_bytes()?),
            (GROUPS_FILE, self.groups.to_bytes()?),
        ];
        for (name, contents) in files {
            let placeholder = IHandle::new(Principal::User(owner));
            let mut node = Inode::new(InodeKind::File, false);
            node.write_payload(&self.blocks, &placeholder, &contents, None, self.config.cipher)?;
            let hash = node.store(&self.blocks)?;
            let handle = self.modmap(owner, placeholder, Mapping::Inode(hash))?;
            self.link_inner(owner, handle, root, name, None)?;
        }
        Ok(root)
    }

    /// Creates an empty file called `name` in `parent`.
    ///
    /// `owner` is either `actor` or a group `actor` belongs to. For a group
    /// the returned handle is the group handle. `key` encrypts the new file
    /// when `encrypted` is set and is also used for an encrypted parent.
    pub fn create(
        &mut self,
        parent: IHandle,
        name: &[u8],
        actor: UserId,
        owner: Principal,
        encrypted: bool,
        key: Option<&SymmetricKey>,
    ) -> Result<IHandle, MetaError> {
        self.run(actor, "create", |s| {
            s.create_inner(parent, name, actor, owner, InodeKind::File, encrypted, key)
        })
    }

    /// Creates a directory called `name` in `parent`, holding `.` and `..`.
    pub fn mkdir(
        &mut self,
        parent: IHandle,
        name: &[u8],
        actor: UserId,
        owner: Principal,
        encrypted: bool,
        key: Option<&SymmetricKey>,
    ) -> Result<IHandle, MetaError> {
        self.run(actor, "mkdir", |s| {
            s.create_inner(parent, name, actor, owner, InodeKind::Directory, encrypted, key)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_inner(
        &mut self,
        parent: IHandle,
        name: &[u8],
        actor: UserId,
        owner: Principal,
        kind: InodeKind,
        encrypted: bool,
        key: Option<&SymmetricKey>,
    ) -> Result<IHandle, MetaError> {
        let owned = IHandle::new(owner);
        match owner {
            Principal::User(user) if user != actor => {
                return Err(MetaError::PermissionDenied {
                    user: actor,
                    target: owned,
                    op: "create",
                    reason: DenialReason::OwnerOnly,
                });
            }
            Principal::User(_) => {}
            Principal::Group(group) => {
                if self.groups.members_of(group).is_none() {
                    return Err(MetaError::UnknownGroup(group));
                }
                check_write(&self.groups, actor, &owned, "create")?;
            }
        }
        check_write(&self.groups, actor, &parent, "create")?;

        let (_, parent_inode) = self.get_inode(&parent)?;
        if !parent_inode.is_dir() {
            return Err(MetaError::NotADirectory(parent));
        }
        if encrypted && key.is_none() {
            return Err(MetaError::MissingKey(owned));
        }
        let listing = Directory::load(&self.blocks, parent, parent_inode, key)?;
        if listing.find(name).is_some() {
            return Err(MetaError::NameExists {
                parent,
                name: String::from_utf8_lossy(name).into_owned(),
            });
        }

        let node = Inode::new(kind, encrypted);
        let first = node.store(&self.blocks)?;
        let mut handle = self.modmap(
            actor,
            IHandle::new(Principal::User(actor)),
            Mapping::Inode(first),
        )?;
        if owner.is_group() {
            handle = self.modmap(actor, owned, Mapping::Indirect(handle))?;
        }

        if kind == InodeKind::Directory {
            let mut dir = Directory::empty(handle, node);
            dir.add(b".", handle)?;
            dir.add(b"..", parent)?;
            let (hash, mut superseded) = dir.store(&self.blocks, key, self.config.cipher)?;
            superseded.push(first);
            self.repoint(actor, handle, hash, superseded)?;
        }

        self.link_inner(actor, handle, parent, name, key)?;
        debug!(%actor, %parent, %handle, ?kind, encrypted, "created");
        Ok(handle)
    }

    /// Adds an entry `name` → `target` to `parent`.
    pub fn link(
        &mut self,
        actor: UserId,
        target: IHandle,
        parent: IHandle,
        name: &[u8],
        key: Option<&SymmetricKey>,
    ) -> Result<(), MetaError> {
        self.run(actor, "link", |s| s.link_inner(actor, target, parent, name, key))
    }

    fn link_inner(
        &mut self,
        actor: UserId,
        target: IHandle,
        parent: IHandle,
        name: &[u8],
        key: Option<&SymmetricKey>,
    ) -> Result<(), MetaError> {
        check_write(&self.groups, actor, &parent, "link")?;
        target.key()?;

        let (old_hash, parent_inode) = self.get_inode(&parent)?;
        if !parent_inode.is_dir() {
            return Err(MetaError::NotADirectory(parent));
        }
        if parent_inode.encrypted {
            check_write(&self.groups, actor, &target, "link")?;
        }

        let mut dir = Directory::load(&self.blocks, parent, parent_inode, key)?;
        dir.add(name, target)?;
        let (new_hash, mut superseded) = dir.store(&self.blocks, key, self.config.cipher)?;
        superseded.push(old_hash);
        self.repoint(actor, parent, new_hash, superseded)?;
        debug!(%actor, %parent, %target, name = %String::from_utf8_lossy(name), "linked");
        Ok(())
    }

    /// Reads at most `length` bytes from `offset`, clipped to end of file.
    pub fn read(
        &mut self,
        actor: UserId,
        handle: IHandle,
        offset: usize,
        length: usize,
        key: Option<&SymmetricKey>,
    ) -> Result<Vec<u8>, MetaError> {
        self.observe("read", |s| {
            let contents = s.read_contents(actor, &handle, key, "read")?;
            let start = offset.min(contents.len());
            let end = start.saturating_add(length).min(contents.len());
            Ok(contents[start..end].to_vec())
        })
    }

    fn read_contents(
        &self,
        actor: UserId,
        handle: &IHandle,
        key: Option<&SymmetricKey>,
        op: &'static str,
    ) -> Result<Vec<u8>, MetaError> {
        let (_, node) = self.get_inode(handle)?;
        check_read(&self.groups, actor, handle, node.encrypted, op)?;
        node.read_payload(&self.blocks, handle, key)
    }

    /// Writes `bytes` at `offset`, extending the file if needed (a gap past
    /// the old end is zero-filled). Returns the number of bytes written.
    pub fn write(
        &mut self,
        actor: UserId,
        handle: IHandle,
        offset: usize,
        bytes: &[u8],
        key: Option<&SymmetricKey>,
    ) -> Result<usize, MetaError> {
        let limit = self.config.max_file_size;
        let end = match offset.checked_add(bytes.len()) {
            Some(end) if end as u64 <= limit => end,
            end => return Err(MetaError::FileTooLarge { handle, end, limit }),
        };
        self.run(actor, "write", |s| {
            s.rewrite(actor, handle, key, |contents| {
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[offset..end].copy_from_slice(bytes);
            })?;
            Ok(bytes.len())
        })
    }

    /// Loads the payload of `handle`, lets `edit` change it, and stores the
    /// result as a new inode.
    fn rewrite(
        &mut self,
        actor: UserId,
        handle: IHandle,
        key: Option<&SymmetricKey>,
        edit: impl FnOnce(&mut Vec<u8>),
    ) -> Result<(), MetaError> {
        check_write(&self.groups, actor, &handle, "write")?;
        let (old_hash, mut node) = self.get_inode(&handle)?;
        let mut contents = node.read_payload(&self.blocks, &handle, key)?;
        edit(&mut contents);

        let mut superseded =
            node.write_payload(&self.blocks, &handle, &contents, key, self.config.cipher)?;
        let new_hash = node.store(&self.blocks)?;
        superseded.push(old_hash);
        self.repoint(actor, handle, new_hash, superseded)?;
        debug!(%actor, %handle, size = node.size, "wrote");
        Ok(())
    }

    /// Lists `handle` from entry `offset` on. Each entry is paired with its
    /// index plus one, the offset to resume from.
    pub fn readdir(
        &mut self,
        actor: UserId,
        handle: IHandle,
        offset: usize,
        key: Option<&SymmetricKey>,
    ) -> Result<Vec<(DirEntry, usize)>, MetaError> {
        self.observe("readdir", |s| {
            Ok(s.load_directory(actor, handle, key, "readdir")?.listing(offset))
        })
    }

    /// Resolves `name` inside the directory `dir`.
    pub fn lookup(
        &mut self,
        actor: UserId,
        dir: IHandle,
        name: &[u8],
        key: Option<&SymmetricKey>,
    ) -> Result<Option<IHandle>, MetaError> {
        self.observe("lookup", |s| {
            Ok(s.load_directory(actor, dir, key, "lookup")?.find(name))
        })
    }

    fn load_directory(
        &self,
        actor: UserId,
        handle: IHandle,
        key: Option<&SymmetricKey>,
        op: &'static str,
    ) -> Result<Directory, MetaError> {
        let (_, node) = self.get_inode(&handle)?;
        check_read(&self.groups, actor, &handle, node.encrypted, op)?;
        Directory::load(&self.blocks, handle, node, key)
    }

    /// Current metadata of `handle`.
    pub fn stat(&mut self, handle: IHandle) -> Result<Inode, MetaError> {
        self.observe("stat", |s| Ok(s.get_inode(&handle)?.1))
    }

    /// Returns true if `actor` may execute `handle`.
    pub fn can_execute(&mut self, actor: UserId, handle: IHandle) -> Result<bool, MetaError> {
        self.observe("can_execute", |s| {
            let (_, node) = s.get_inode(&handle)?;
            Ok(access::can_execute(&s.groups, actor, &handle, &node))
        })
    }

    /// Replaces this session's user and group directories with the contents
    /// of the root `.users` and `.groups` files.
    pub fn reload_directories(&mut self, actor: UserId) -> Result<(), MetaError> {
        let root = self
            .root
            .ok_or_else(|| MetaError::NotFound("root handle not set".to_string()))?;
        let (users, groups) = self.observe("reload_directories", |s| {
            let users = s.read_root_file(actor, root, USERS_FILE)?;
            let groups = s.read_root_file(actor, root, GROUPS_FILE)?;
            Ok((
                UserDirectory::from_bytes(&users)?,
                GroupDirectory::from_bytes(&groups)?,
            ))
        })?;
        info!(users = users.len(), "reloaded principal directories");
        self.users = users;
        self.groups = groups;
        Ok(())
    }

    /// Writes this session's user and group directories to the root
    /// `.users` and `.groups` files.
    pub fn save_directories(&mut self, actor: UserId) -> Result<(), MetaError> {
        let root = self
            .root
            .ok_or_else(|| MetaError::NotFound("root handle not set".to_string()))?;
        let users = self.users.to_bytes()?;
        let groups = self.groups.to_bytes()?;
        self.run(actor, "save_directories", |s| {
            for (name, contents) in [(USERS_FILE, &users), (GROUPS_FILE, &groups)] {
                let handle = s
                    .load_directory(actor, root, None, "save_directories")?
                    .find(name)
                    .ok_or_else(|| {
                        MetaError::NotFound(format!("{}", String::from_utf8_lossy(name)))
                    })?;
                s.rewrite(actor, handle, None, |old| {
                    old.clear();
                    old.extend_from_slice(contents);
                })?;
            }
            Ok(())
        })
    }

    fn read_root_file(
        &self,
        actor: UserId,
        root: IHandle,
        name: &[u8],
    ) -> Result<Vec<u8>, MetaError> {
        let handle = self
            .load_directory(actor, root, None, "reload_directories")?
            .find(name)
            .ok_or_else(|| MetaError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        self.read_contents(actor, &handle, None, "reload_directories")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secfs_store::{MemoryBlockStore, MemoryVersionServer};

    struct Share {
        blocks: Arc<MemoryBlockStore>,
        versions: Arc<MemoryVersionServer>,
        users: UserDirectory,
        groups: GroupDirectory,
        keys: Vec<Arc<UserKeys>>,
    }

    fn u(id: u64) -> UserId {
        UserId::new(id)
    }

    fn share(users: usize) -> Share {
        let keys: Vec<Arc<UserKeys>> = (0..users).map(|_| Arc::new(UserKeys::generate())).collect();
        let mut dir = UserDirectory::new();
        for (n, k) in keys.iter().enumerate() {
            dir.insert(u(n as u64), k.public_keys());
        }
        Share {
            blocks: Arc::new(MemoryBlockStore::new()),
            versions: Arc::new(MemoryVersionServer::new()),
            users: dir,
            groups: GroupDirectory::new(),
            keys,
        }
    }

    fn session(share: &Share, user: u64) -> Session {
        let mut s = Session::new(
            SessionConfig::default(),
            share.blocks.clone(),
            share.versions.clone(),
            share.users.clone(),
            share.groups.clone(),
        );
        s.register_keys(u(user), share.keys[user as usize].clone());
        s
    }

    #[test]
    fn test_init_lays_out_root() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        assert_eq!(root, IHandle::allocated(Principal::user(0), 0));

        let names: Vec<Vec<u8>> = s
            .readdir(u(0), root, 0, None)
            .unwrap()
            .into_iter()
            .map(|(e, _)| e.name)
            .collect();
        assert_eq!(
            names,
            vec![b".".to_vec(), b"..".to_vec(), USERS_FILE.to_vec(), GROUPS_FILE.to_vec()]
        );
        assert_eq!(s.lookup(u(0), root, b"..", None).unwrap(), Some(root));
        assert!(s.stat(root).unwrap().is_dir());
    }

    #[test]
    fn test_init_needs_known_owner() {
        let share = share(1);
        let mut s = session(&share, 0);
        assert!(matches!(
            s.init(u(5)),
            Err(MetaError::UnknownPrincipal(_))
        ));
    }

    #[test]
    fn test_create_write_read() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        let f = s
            .create(root, b"notes", u(0), Principal::user(0), false, None)
            .unwrap();
        assert_eq!(s.write(u(0), f, 0, b"hello world", None).unwrap(), 11);
        assert_eq!(s.read(u(0), f, 6, 100, None).unwrap(), b"world".to_vec());
        assert_eq!(s.read(u(0), f, 50, 5, None).unwrap(), Vec::<u8>::new());
        assert_eq!(s.stat(f).unwrap().size, 11);
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        let f = s
            .create(root, b"sparse", u(0), Principal::user(0), false, None)
            .unwrap();
        s.write(u(0), f, 0, b"ab", None).unwrap();
        s.write(u(0), f, 4, b"cd", None).unwrap();
        assert_eq!(s.read(u(0), f, 0, 10, None).unwrap(), b"ab\0\0cd".to_vec());
        s.write(u(0), f, 1, b"X", None).unwrap();
        assert_eq!(s.read(u(0), f, 0, 10, None).unwrap(), b"aX\0\0cd".to_vec());
    }

    #[test]
    fn test_write_beyond_size_limit_refused() {
        let share = share(1);
        let config = SessionConfig {
            max_file_size: 8,
            ..SessionConfig::default()
        };
        let mut s = Session::new(
            config,
            share.blocks.clone(),
            share.versions.clone(),
            share.users.clone(),
            share.groups.clone(),
        );
        s.register_keys(u(0), share.keys[0].clone());
        let root = s.init(u(0)).unwrap();
        let f = s
            .create(root, b"small", u(0), Principal::user(0), false, None)
            .unwrap();
        assert_eq!(s.write(u(0), f, 4, b"full", None).unwrap(), 4);

        match s.write(u(0), f, 5, b"over", None) {
            Err(MetaError::FileTooLarge { end, limit, .. }) => {
                assert_eq!(end, Some(9));
                assert_eq!(limit, 8);
            }
            other => panic!("expected FileTooLarge, got {:?}", other),
        }
        assert!(matches!(
            s.write(u(0), f, usize::MAX, b"x", None),
            Err(MetaError::FileTooLarge { end: None, .. })
        ));
        assert_eq!(s.stat(f).unwrap().size, 8);
    }

    #[test]
    fn test_superseded_blocks_are_freed() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        let f = s
            .create(root, b"f", u(0), Principal::user(0), false, None)
            .unwrap();
        s.write(u(0), f, 0, b"first version", None).unwrap();
        let live = share.blocks.len();
        for _ in 0..5 {
            s.write(u(0), f, 0, b"first version", None).unwrap();
        }
        assert_eq!(share.blocks.len(), live);
    }

    #[test]
    fn test_readdir_resume_offset() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        let d = s
            .mkdir(root, b"d", u(0), Principal::user(0), false, None)
            .unwrap();
        let entries = s.readdir(u(0), d, 0, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].0.target, root);
        assert_eq!(entries[1].1, 2);
        let rest = s.readdir(u(0), d, 2, None).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_readdir_counts_dot_entries() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        let d = s
            .mkdir(root, b"d", u(0), Principal::user(0), false, None)
            .unwrap();
        let f = s
            .create(root, b"f", u(0), Principal::user(0), false, None)
            .unwrap();
        for name in [b"l1", b"l2", b"l3"] {
            s.link(u(0), f, d, name, None).unwrap();
        }

        // "." and ".." hold indices 0 and 1, so the links start at 2.
        let names = |list: Vec<(DirEntry, usize)>| -> Vec<(Vec<u8>, usize)> {
            list.into_iter().map(|(e, n)| (e.name, n)).collect()
        };
        assert_eq!(
            names(s.readdir(u(0), d, 3, None).unwrap()),
            vec![(b"l2".to_vec(), 4), (b"l3".to_vec(), 5)]
        );
        let all = s.readdir(u(0), d, 0, None).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all[2..].iter().all(|(e, _)| e.target == f));
    }

    #[test]
    fn test_missing_signing_key() {
        let mut share = share(2);
        share.groups.insert(GroupId::new(5), [u(0), u(1)]);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        let shared = s
            .mkdir(root, b"shared", u(0), Principal::group(5), false, None)
            .unwrap();
        assert!(matches!(
            s.create(shared, b"x", u(1), Principal::user(1), false, None),
            Err(MetaError::SigningKeyUnavailable(user)) if user == u(1)
        ));
        // The failed attempt left nothing behind.
        assert!(s.lookup(u(0), shared, b"x", None).unwrap().is_none());
    }

    #[test]
    fn test_create_for_other_user_denied() {
        let share = share(2);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        match s.create(root, b"x", u(0), Principal::user(1), false, None) {
            Err(MetaError::PermissionDenied { reason, .. }) => {
                assert_eq!(reason, DenialReason::OwnerOnly)
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_group() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        assert!(matches!(
            s.create(root, b"x", u(0), Principal::group(42), false, None),
            Err(MetaError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_executable_directories() {
        let share = share(1);
        let mut s = session(&share, 0);
        let root = s.init(u(0)).unwrap();
        let f = s
            .create(root, b"f", u(0), Principal::user(0), false, None)
            .unwrap();
        assert!(s.can_execute(u(0), root).unwrap());
        assert!(!s.can_execute(u(0), f).unwrap());
    }

    #[test]
    fn test_reload_directories_reads_root_files() {
        let mut share = share(2);
        share.groups.insert(GroupId::new(10), [u(0), u(1)]);
        let mut owner = session(&share, 0);
        let root = owner.init(u(0)).unwrap();

        let mut reader = Session::new(
            SessionConfig::default(),
            share.blocks.clone(),
            share.versions.clone(),
            share.users.clone(),
            GroupDirectory::new(),
        );
        reader.set_root(root);
        reader.reload_directories(u(1)).unwrap();
        assert!(reader.groups().is_member(GroupId::new(10), u(1)));
        assert_eq!(reader.users().len(), 2);
    }

    #[test]
    fn test_save_directories_replaces_contents() {
        let share = share(2);
        let mut owner = session(&share, 0);
        let root = owner.init(u(0)).unwrap();
        owner.groups_mut().insert(GroupId::new(3), [u(0)]);
        owner.save_directories(u(0)).unwrap();

        let mut reader = session(&share, 1);
        reader.set_root(root);
        reader.reload_directories(u(1)).unwrap();
        assert!(reader.groups().is_member(GroupId::new(3), u(0)));
    }
}
