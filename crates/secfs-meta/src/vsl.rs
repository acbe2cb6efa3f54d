//! Version structure list: signed per-user snapshots and fork detection.
//!
//! Each user publishes one signed [`VersionStructure`]: the hash of their
//! i-table, the hashes of the group i-tables they consider current, and a
//! version vector counting how often every principal's table has changed.
//! Clients fetch every structure, verify the signatures, check that the
//! vectors are mutually consistent and only then trust the i-tables they
//! point to.
//!
//! An honest server serializes publishes (see
//! [`secfs_store::VersionServer`]), so honest vectors are always pairwise
//! comparable and never move backwards. Two vectors that each claim newer
//! state than the other, or a user whose counter drops below what this
//! client has already seen, mean the server is showing different clients
//! different histories.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use secfs_crypto::{PublicKeys, UserKeys};
use secfs_store::{BlockHash, VersionServer};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::access::PublicKeyDirectory;
use crate::types::*;

const SIGNING_DOMAIN: &str = "secfs-version-structure-v1";

/// Per-principal modification counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<Principal, u64>);

impl VersionVector {
    /// Creates an all-zero vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `principal`; absent principals count as zero.
    pub fn get(&self, principal: Principal) -> u64 {
        self.0.get(&principal).copied().unwrap_or(0)
    }

    /// Returns true if `principal` has an explicit counter.
    pub fn contains(&self, principal: Principal) -> bool {
        self.0.contains_key(&principal)
    }

    /// Sets the counter for `principal`.
    pub fn set(&mut self, principal: Principal, value: u64) {
        self.0.insert(principal, value);
    }

    /// Adds one to `principal`'s counter and returns the new value.
    pub fn increment(&mut self, principal: Principal) -> u64 {
        let counter = self.0.entry(principal).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Raises every counter to at least `other`'s value.
    pub fn merge_max(&mut self, other: &VersionVector) {
        for (p, v) in &other.0 {
            let counter = self.0.entry(*p).or_insert(0);
            if *v > *counter {
                *counter = *v;
            }
        }
    }

    /// Compares two vectors over every principal either of them names; a
    /// principal missing from one side counts as zero there.
    ///
    /// Returns `None` when each is ahead of the other somewhere.
    pub fn dominance(&self, other: &VersionVector) -> Option<Ordering> {
        let mut behind = false;
        let mut ahead = false;
        for p in self.0.keys().chain(other.0.keys()) {
            match self.get(*p).cmp(&other.get(*p)) {
                Ordering::Less => behind = true,
                Ordering::Greater => ahead = true,
                Ordering::Equal => {}
            }
        }
        match (behind, ahead) {
            (true, true) => None,
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => Some(Ordering::Equal),
        }
    }

    /// Iterates over explicit counters in principal order.
    pub fn iter(&self) -> impl Iterator<Item = (Principal, u64)> + '_ {
        self.0.iter().map(|(p, v)| (*p, *v))
    }
}

impl FromIterator<(Principal, u64)> for VersionVector {
    fn from_iter<T: IntoIterator<Item = (Principal, u64)>>(iter: T) -> Self {
        VersionVector(iter.into_iter().collect())
    }
}

/// Signed snapshot of one user's view of the filesystem. Immutable once
/// signed; a new state means a new structure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStructure {
    owner: UserId,
    itable: Option<BlockHash>,
    group_itables: BTreeMap<GroupId, BlockHash>,
    vector: VersionVector,
    signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    domain: &'static str,
    owner: UserId,
    itable: &'a Option<BlockHash>,
    group_itables: &'a BTreeMap<GroupId, BlockHash>,
    vector: &'a VersionVector,
}

impl VersionStructure {
    /// Builds and signs a structure with `keys`.
    pub fn sign(
        owner: UserId,
        itable: Option<BlockHash>,
        group_itables: BTreeMap<GroupId, BlockHash>,
        vector: VersionVector,
        keys: &UserKeys,
    ) -> Result<Self, MetaError> {
        let mut vs = Self {
            owner,
            itable,
            group_itables,
            vector,
            signature: Vec::new(),
        };
        vs.signature = keys.sign(&vs.signed_bytes()?);
        Ok(vs)
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, MetaError> {
        Ok(bincode::serialize(&SignedFields {
            domain: SIGNING_DOMAIN,
            owner: self.owner,
            itable: &self.itable,
            group_itables: &self.group_itables,
            vector: &self.vector,
        })?)
    }

    /// Checks the signature against `keys`.
    pub fn verify(&self, keys: &PublicKeys) -> Result<(), MetaError> {
        keys.verify(&self.signed_bytes()?, &self.signature)?;
        Ok(())
    }

    /// User that signed this structure.
    pub fn owner(&self) -> UserId {
        self.owner
    }

    /// Hash of the owner's i-table, if they have one.
    pub fn itable(&self) -> Option<BlockHash> {
        self.itable
    }

    /// Group i-table hashes as of this structure.
    pub fn group_itables(&self) -> &BTreeMap<GroupId, BlockHash> {
        &self.group_itables
    }

    /// The version vector.
    pub fn vector(&self) -> &VersionVector {
        &self.vector
    }

    /// The owner's own counter.
    pub fn own_version(&self) -> u64 {
        self.vector.get(Principal::User(self.owner))
    }

    /// Serializes for the version server.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes bytes fetched from the version server. Does not verify.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetaError> {
        bincode::deserialize(bytes).map_err(|e| {
            MetaError::IntegrityFailure(format!("undecodable version structure: {}", e))
        })
    }
}

/// Why the list was judged forked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForkEvidence {
    /// Neither user's vector dominates the other's.
    Incomparable {
        /// First user
        first: UserId,
        /// Second user
        second: UserId,
    },
    /// A user's counter went backwards, or their entry disappeared.
    Rollback {
        /// User whose entry regressed
        user: UserId,
        /// Highest counter this client has seen for them
        seen: u64,
        /// Counter the server now presents, if any
        served: Option<u64>,
    },
}

impl fmt::Display for ForkEvidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkEvidence::Incomparable { first, second } => write!(
                f,
                "version structures of users {} and {} are incomparable",
                first, second
            ),
            ForkEvidence::Rollback {
                user,
                seen,
                served: Some(served),
            } => write!(
                f,
                "user {} rolled back from version {} to {}",
                user, seen, served
            ),
            ForkEvidence::Rollback {
                user,
                seen,
                served: None,
            } => write!(
                f,
                "user {} disappeared after version {}",
                user, seen
            ),
        }
    }
}

/// A version structure that failed decoding or verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrityEvent {
    /// Server slot the entry was fetched from
    pub user: UserId,
    /// What was wrong with it
    pub reason: String,
}

impl fmt::Display for IntegrityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry for user {}: {}", self.user, self.reason)
    }
}

/// Lifecycle of the list within one refresh.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VslState {
    /// Nothing fetched yet
    Empty,
    /// Fetched, signatures not yet verified or merged
    Fetching,
    /// Merge in progress
    Merged,
    /// Merged and consistent; safe to use and extend
    Consistent,
    /// Merged and inconsistent; must not be trusted
    ForkDetected,
}

/// The trusted state derived from a merge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergedView {
    /// Component-wise maximum of every verified vector
    pub vector: VersionVector,
    /// Current i-table of every user that has one
    pub user_itables: BTreeMap<UserId, BlockHash>,
    /// Highest-versioned i-table of every group, with its version
    pub group_itables: BTreeMap<GroupId, (u64, BlockHash)>,
}

/// Outcome of [`VersionStructureList::merge`].
#[derive(Clone, Debug)]
pub struct MergeReport {
    /// Merged state
    pub view: MergedView,
    /// Inconsistencies found; empty when the list is consistent
    pub forks: Vec<ForkEvidence>,
}

impl MergeReport {
    /// Returns true if no inconsistency was found.
    pub fn is_consistent(&self) -> bool {
        self.forks.is_empty()
    }

    /// Returns the view, or `ForkDetected` with the evidence.
    pub fn into_result(self) -> Result<MergedView, MetaError> {
        if self.forks.is_empty() {
            Ok(self.view)
        } else {
            Err(MetaError::ForkDetected(self.forks))
        }
    }
}

/// Client-side copy of every user's version structure.
#[derive(Debug)]
pub struct VersionStructureList {
    state: VslState,
    generation: u64,
    unverified: BTreeMap<UserId, VersionStructure>,
    rejected: Vec<IntegrityEvent>,
    discarded: BTreeSet<UserId>,
    entries: BTreeMap<UserId, VersionStructure>,
    staged: BTreeSet<UserId>,
    high_water: BTreeMap<UserId, u64>,
}

impl Default for VersionStructureList {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStructureList {
    /// Creates an empty list with no history.
    pub fn new() -> Self {
        Self {
            state: VslState::Empty,
            generation: 0,
            unverified: BTreeMap::new(),
            rejected: Vec::new(),
            discarded: BTreeSet::new(),
            entries: BTreeMap::new(),
            staged: BTreeSet::new(),
            high_water: BTreeMap::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VslState {
        self.state
    }

    /// Server generation the list was fetched at (or last published to).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Verified entry for `user`.
    pub fn entry(&self, user: UserId) -> Option<&VersionStructure> {
        self.entries.get(&user)
    }

    /// Verified entries in user order.
    pub fn entries(&self) -> impl Iterator<Item = &VersionStructure> + '_ {
        self.entries.values()
    }

    /// Highest own-counter this client has accepted for `user`.
    pub fn high_water(&self, user: UserId) -> Option<u64> {
        self.high_water.get(&user).copied()
    }

    /// Returns true if `user` has a local entry awaiting publish.
    pub fn is_staged(&self, user: UserId) -> bool {
        self.staged.contains(&user)
    }

    /// Replaces local state with everything the server holds. Entries are
    /// decoded but not yet trusted; call [`Self::verify_signatures`] next.
    pub fn fetch(&mut self, server: &dyn VersionServer) -> Result<(), MetaError> {
        let snapshot = server.fetch_all()?;
        self.state = VslState::Fetching;
        self.generation = snapshot.generation;
        self.unverified.clear();
        self.rejected.clear();
        self.discarded.clear();
        self.entries.clear();
        self.staged.clear();

        for (raw_user, bytes) in snapshot.entries {
            let user = UserId::new(raw_user);
            match VersionStructure::from_bytes(&bytes) {
                Ok(vs) => {
                    self.unverified.insert(user, vs);
                }
                Err(e) => self.rejected.push(IntegrityEvent {
                    user,
                    reason: e.to_string(),
                }),
            }
        }
        debug!(
            generation = self.generation,
            entries = self.unverified.len(),
            "fetched version structures"
        );
        Ok(())
    }

    /// Verifies every fetched entry against the signer's public key.
    ///
    /// Entries that fail are discarded and reported; the rest become the
    /// trusted entries that [`Self::merge`] works on.
    pub fn verify_signatures(&mut self, keys: &dyn PublicKeyDirectory) -> Vec<IntegrityEvent> {
        let mut events = std::mem::take(&mut self.rejected);
        for (user, vs) in std::mem::take(&mut self.unverified) {
            let outcome = if vs.owner() != user {
                Err(format!(
                    "stored under user {} but signed as user {}",
                    user,
                    vs.owner()
                ))
            } else {
                keys.lookup_public_key(user)
                    .and_then(|pk| vs.verify(&pk))
                    .map_err(|e| e.to_string())
            };
            match outcome {
                Ok(()) => {
                    self.entries.insert(user, vs);
                }
                Err(reason) => events.push(IntegrityEvent { user, reason }),
            }
        }
        for event in &events {
            error!(user = %event.user, reason = %event.reason, "discarding version structure");
            self.discarded.insert(event.user);
        }
        events
    }

    fn max_vector(&self) -> VersionVector {
        let mut vector = VersionVector::new();
        for vs in self.entries.values() {
            vector.merge_max(vs.vector());
        }
        vector
    }

    /// For every group, the i-table hash from the entry with the highest
    /// counter for that group.
    pub fn find_group_versions(&self) -> BTreeMap<GroupId, (u64, BlockHash)> {
        let mut best: BTreeMap<GroupId, (u64, BlockHash)> = BTreeMap::new();
        for vs in self.entries.values() {
            for (group, hash) in vs.group_itables() {
                let version = vs.vector().get(Principal::Group(*group));
                match best.get(group) {
                    Some((current, _)) if *current >= version => {}
                    _ => {
                        best.insert(*group, (version, *hash));
                    }
                }
            }
        }
        best
    }

    /// Combines the verified entries into one view and checks them for
    /// forks.
    ///
    /// Every pair of entries must be comparable, and no user's own counter
    /// may fall below what this client saw in an earlier consistent merge.
    /// Entries discarded by verification are exempt from the rollback check;
    /// they were already reported.
    pub fn merge(&mut self) -> MergeReport {
        self.state = VslState::Merged;
        let mut forks = Vec::new();

        let list: Vec<&VersionStructure> = self.entries.values().collect();
        for (n, a) in list.iter().enumerate() {
            for b in &list[n + 1..] {
                if a.vector().dominance(b.vector()).is_none() {
                    forks.push(ForkEvidence::Incomparable {
                        first: a.owner(),
                        second: b.owner(),
                    });
                }
            }
        }

        for (user, seen) in &self.high_water {
            if self.discarded.contains(user) {
                continue;
            }
            let served = self.entries.get(user).map(|vs| vs.own_version());
            if served.map_or(true, |v| v < *seen) {
                forks.push(ForkEvidence::Rollback {
                    user: *user,
                    seen: *seen,
                    served,
                });
            }
        }

        let view = MergedView {
            vector: self.max_vector(),
            user_itables: self
                .entries
                .iter()
                .filter_map(|(u, vs)| vs.itable().map(|h| (*u, h)))
                .collect(),
            group_itables: self.find_group_versions(),
        };

        if forks.is_empty() {
            self.state = VslState::Consistent;
            for (user, vs) in &self.entries {
                let mark = self.high_water.entry(*user).or_insert(0);
                *mark = (*mark).max(vs.own_version());
            }
            debug!(
                users = view.user_itables.len(),
                groups = view.group_itables.len(),
                "version structures consistent"
            );
        } else {
            self.state = VslState::ForkDetected;
            for evidence in &forks {
                error!(%evidence, "fork detected");
            }
        }
        MergeReport { view, forks }
    }

    /// Records that `actor` changed `principal`'s i-table and signs a new
    /// structure for `actor`.
    ///
    /// The new vector is the merged maximum with `principal`'s counter
    /// raised by one; for a group principal the actor's own counter is
    /// raised by one as well, since the group entry is published inside the
    /// actor's structure. The group map starts from the best known group
    /// tables. The new structure replaces `actor`'s entry locally and is
    /// staged for [`Self::publish`].
    pub fn update_list(
        &mut self,
        actor: UserId,
        principal: Principal,
        own_itable: Option<BlockHash>,
        group_itable: Option<BlockHash>,
        keys: &UserKeys,
    ) -> Result<VersionStructure, MetaError> {
        if self.state != VslState::Consistent {
            return Err(MetaError::Conflict(format!(
                "version list is {:?}; refresh before updating",
                self.state
            )));
        }

        let mut vector = self.max_vector();
        let mut groups: BTreeMap<GroupId, BlockHash> = self
            .find_group_versions()
            .into_iter()
            .map(|(g, (_, h))| (g, h))
            .collect();

        match principal {
            Principal::User(owner) if owner != actor => {
                return Err(MetaError::Conflict(format!(
                    "user {} cannot publish for user {}",
                    actor, owner
                )));
            }
            Principal::User(_) => {
                vector.increment(principal);
            }
            Principal::Group(group) => {
                let hash = group_itable.ok_or_else(|| {
                    MetaError::InvalidMapping(format!("update of group {} without a table", group))
                })?;
                groups.insert(group, hash);
                vector.increment(principal);
                vector.increment(Principal::User(actor));
            }
        }

        let vs = VersionStructure::sign(actor, own_itable, groups, vector, keys)?;
        debug!(%actor, %principal, version = vs.own_version(), "signed version structure");
        self.entries.insert(actor, vs.clone());
        self.staged.insert(actor);
        Ok(vs)
    }

    /// Publishes `actor`'s staged entry, if any. Returns whether anything
    /// was sent.
    ///
    /// Fails with `Conflict` if another client published since this list was
    /// fetched; the caller should refresh and redo its operation.
    pub fn publish(&mut self, actor: UserId, server: &dyn VersionServer) -> Result<bool, MetaError> {
        if !self.staged.contains(&actor) {
            return Ok(false);
        }
        let vs = self
            .entries
            .get(&actor)
            .ok_or_else(|| MetaError::NotFound(format!("staged entry for user {}", actor)))?;
        let version = vs.own_version();
        let bytes = vs.to_bytes()?;

        match server.publish(actor.as_u64(), self.generation, bytes) {
            Ok(generation) => {
                self.generation = generation;
                self.staged.remove(&actor);
                self.high_water.insert(actor, version);
                info!(%actor, version, generation, "published version structure");
                Ok(true)
            }
            Err(e) => {
                warn!(%actor, version, error = %e, "publish failed");
                Err(e.into())
            }
        }
    }
}
