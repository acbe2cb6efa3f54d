//! Test Harness - shares with a fixed set of users and groups

use std::collections::BTreeMap;
use std::sync::Arc;

use secfs_crypto::UserKeys;
use secfs_meta::{GroupDirectory, GroupId, Session, SessionConfig, UserDirectory, UserId};
use secfs_store::{MemoryBlockStore, MemoryVersionServer, VersionServer};

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A share: one block store, one version server, and the keys of every user.
pub struct TestShare {
    pub blocks: Arc<MemoryBlockStore>,
    pub versions: Arc<MemoryVersionServer>,
    pub users: UserDirectory,
    pub groups: GroupDirectory,
    keys: BTreeMap<UserId, Arc<UserKeys>>,
}

impl TestShare {
    /// Creates a share with freshly generated keys for each of `users`.
    pub fn new(users: &[u64]) -> Self {
        init_tracing();
        let mut directory = UserDirectory::new();
        let mut keys = BTreeMap::new();
        for &id in users {
            let user = UserId::new(id);
            let k = Arc::new(UserKeys::generate());
            directory.insert(user, k.public_keys());
            keys.insert(user, k);
        }
        Self {
            blocks: Arc::new(MemoryBlockStore::new()),
            versions: Arc::new(MemoryVersionServer::new()),
            users: directory,
            groups: GroupDirectory::new(),
            keys,
        }
    }

    /// Adds a group before any session is opened.
    pub fn with_group(mut self, group: u64, members: &[u64]) -> Self {
        self.groups
            .insert(GroupId::new(group), members.iter().map(|&m| UserId::new(m)));
        self
    }

    /// The private keys of `user`.
    pub fn keys(&self, user: u64) -> Arc<UserKeys> {
        self.keys
            .get(&UserId::new(user))
            .cloned()
            .expect("user is part of the share")
    }

    /// A session for `user` with default settings.
    pub fn session(&self, user: u64) -> Session {
        self.session_with(user, SessionConfig::default())
    }

    /// A session for `user` with the given settings.
    pub fn session_with(&self, user: u64, config: SessionConfig) -> Session {
        self.session_on(user, config, self.versions.clone())
    }

    /// A session for `user` that talks to `versions` instead of the share's
    /// own version server.
    pub fn session_on(
        &self,
        user: u64,
        config: SessionConfig,
        versions: Arc<dyn VersionServer>,
    ) -> Session {
        let mut session = Session::new(
            config,
            self.blocks.clone(),
            versions,
            self.users.clone(),
            self.groups.clone(),
        );
        session.register_keys(UserId::new(user), self.keys(user));
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_has_all_users() {
        let share = TestShare::new(&[0, 1, 2]).with_group(9, &[0, 2]);
        assert_eq!(share.users.len(), 3);
        assert!(share.groups.is_member(GroupId::new(9), UserId::new(2)));
        assert!(!share.groups.is_member(GroupId::new(9), UserId::new(1)));
    }

    #[test]
    fn test_sessions_share_servers() {
        let share = TestShare::new(&[0, 1]);
        let mut s0 = share.session(0);
        let root = s0.init(UserId::new(0)).unwrap();
        let mut s1 = share.session(1);
        s1.set_root(root);
        let listing = s1.readdir(UserId::new(1), root, 0, None).unwrap();
        assert_eq!(listing.len(), 4);
    }
}
