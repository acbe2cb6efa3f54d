use serde::{Deserialize, Serialize};
use std::fmt;

use secfs_crypto::CryptoError;
use secfs_store::StoreError;

use crate::vsl::ForkEvidence;

/// Numeric identity of a user.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(u64);

impl UserId {
    /// Creates a new UserId from a raw u64 value
    pub fn new(id: u64) -> Self {
        UserId(id)
    }

    /// Returns the raw u64 value of this user ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric identity of a group of users.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(u64);

impl GroupId {
    /// Creates a new GroupId from a raw u64 value
    pub fn new(id: u64) -> Self {
        GroupId(id)
    }

    /// Returns the raw u64 value of this group ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of an i-table: either a single user or a group.
///
/// Users order before groups, so a sorted set of principals lists every
/// user table ahead of the group tables that may point into them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Principal {
    /// A single user
    User(UserId),
    /// A group of users
    Group(GroupId),
}

impl Principal {
    /// Shorthand for `Principal::User(UserId::new(id))`.
    pub fn user(id: u64) -> Self {
        Principal::User(UserId::new(id))
    }

    /// Shorthand for `Principal::Group(GroupId::new(id))`.
    pub fn group(id: u64) -> Self {
        Principal::Group(GroupId::new(id))
    }

    /// Returns true for group principals.
    pub fn is_group(&self) -> bool {
        matches!(self, Principal::Group(_))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(u) => write!(f, "<uid={}>", u),
            Principal::Group(g) => write!(f, "<gid={}>", g),
        }
    }
}

/// Stable handle naming a file or directory: an owning principal plus a slot
/// number in that principal's i-table.
///
/// A freshly created handle has no slot. It acquires one exactly once, the
/// first time it is written through the pointer table. Unallocated handles
/// cannot be used as map keys; [`IHandle::key`] refuses them. For that reason
/// this type has no `Hash` impl.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IHandle {
    principal: Principal,
    slot: Option<u64>,
}

impl IHandle {
    /// Creates an unallocated handle owned by `principal`.
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            slot: None,
        }
    }

    /// Creates a handle that already names `slot`.
    pub fn allocated(principal: Principal, slot: u64) -> Self {
        Self {
            principal,
            slot: Some(slot),
        }
    }

    /// Owning principal.
    pub fn principal(&self) -> Principal {
        self.principal
    }

    /// Slot number, if allocated.
    pub fn slot(&self) -> Option<u64> {
        self.slot
    }

    /// Returns true once a slot has been assigned.
    pub fn is_allocated(&self) -> bool {
        self.slot.is_some()
    }

    /// Assigns `slot`. A handle is allocated at most once.
    pub fn allocate(&mut self, slot: u64) -> Result<(), MetaError> {
        if self.slot.is_some() {
            return Err(MetaError::AlreadyAllocated {
                handle: *self,
                slot,
            });
        }
        self.slot = Some(slot);
        Ok(())
    }

    /// Returns a hashable key for this handle, or `Unallocated`.
    pub fn key(&self) -> Result<SlotKey, MetaError> {
        match self.slot {
            Some(slot) => Ok(SlotKey {
                principal: self.principal,
                slot,
            }),
            None => Err(MetaError::Unallocated(self.principal)),
        }
    }
}

impl fmt::Display for IHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "({}, {})", self.principal, slot),
            None => write!(f, "({}, <unallocated>)", self.principal),
        }
    }
}

/// Key form of an allocated [`IHandle`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    /// Owning principal
    pub principal: Principal,
    /// Slot number in the principal's i-table
    pub slot: u64,
}

impl From<SlotKey> for IHandle {
    fn from(key: SlotKey) -> Self {
        IHandle::allocated(key.principal, key.slot)
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Which access rule refused an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DenialReason {
    /// Target is user-owned and the caller is not that user.
    OwnerOnly,
    /// Target is group-owned and the caller is not a member.
    GroupMemberOnly,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::OwnerOnly => write!(f, "only the owning user may do this"),
            DenialReason::GroupMemberOnly => {
                write!(f, "only members of the owning group may do this")
            }
        }
    }
}

/// Errors that can occur in filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// A handle, slot, block or name could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller lacks the rights for this operation.
    #[error("permission denied: {user} may not {op} {target}: {reason}")]
    PermissionDenied {
        /// Acting user
        user: UserId,
        /// Handle the operation targeted
        target: IHandle,
        /// Operation name
        op: &'static str,
        /// Rule that refused it
        reason: DenialReason,
    },

    /// A directory entry with the given name already exists.
    #[error("entry '{name}' already exists in directory {parent}")]
    NameExists {
        /// Parent directory handle
        parent: IHandle,
        /// Existing entry name (lossy UTF-8)
        name: String,
    },

    /// The named group has no membership record.
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    /// The principal has no public key on record.
    #[error("unknown principal {0}")]
    UnknownPrincipal(Principal),

    /// An encrypted object was accessed without a key.
    #[error("{0} is encrypted and no key was supplied")]
    MissingKey(IHandle),

    /// Signature, hash or authenticated decryption check failed.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// Signed version structures contradict each other.
    #[error("fork detected: {}", describe_forks(.0))]
    ForkDetected(Vec<ForkEvidence>),

    /// A concurrent update won the race, or a modmap was not permitted.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The server could not be reached.
    #[error("server unavailable: {0}")]
    Unavailable(String),

    /// Operation needs an allocated handle.
    #[error("handle owned by {0} has no slot yet")]
    Unallocated(Principal),

    /// Attempt to allocate a handle twice.
    #[error("{handle} is already allocated, refusing slot {slot}")]
    AlreadyAllocated {
        /// The handle
        handle: IHandle,
        /// Slot that was offered
        slot: u64,
    },

    /// The specified handle is not a directory when a directory was required.
    #[error("{0} is not a directory")]
    NotADirectory(IHandle),

    /// A write would end past the largest file this session accepts.
    #[error("write to {handle} would end at byte {end:?}, limit is {limit}")]
    FileTooLarge {
        /// File being written
        handle: IHandle,
        /// End offset of the write; `None` when it does not fit in a usize
        end: Option<usize>,
        /// Configured maximum file size
        limit: u64,
    },

    /// A mapping of the wrong shape for its table.
    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    /// No private key registered in this session for the acting user.
    #[error("no signing key registered for user {0}")]
    SigningKeyUnavailable(UserId),

    /// Local crypto failure unrelated to integrity (bad key shape, RNG).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Failed to encode or decode an on-disk structure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn describe_forks(evidence: &[ForkEvidence]) -> String {
    match evidence.first() {
        Some(first) if evidence.len() > 1 => {
            format!("{} (and {} more)", first, evidence.len() - 1)
        }
        Some(first) => first.to_string(),
        None => "no evidence recorded".to_string(),
    }
}

impl MetaError {
    /// Returns true for the transient errors a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaError::Conflict(_) | MetaError::Unavailable(_))
    }
}

impl From<StoreError> for MetaError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::BlockNotFound { hash } => MetaError::NotFound(format!("block {}", hash)),
            StoreError::HashMismatch { expected, actual } => MetaError::IntegrityFailure(format!(
                "block {} hashed to {}",
                expected, actual
            )),
            StoreError::Conflict { user, reason } => {
                MetaError::Conflict(format!("publish for user {}: {}", user, reason))
            }
            StoreError::Unavailable { reason } => MetaError::Unavailable(reason),
        }
    }
}

impl From<CryptoError> for MetaError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionAuthFailed
            | CryptoError::SignatureInvalid
            | CryptoError::MalformedEnvelope(_) => MetaError::IntegrityFailure(e.to_string()),
            CryptoError::EncryptionFailed(_) | CryptoError::InvalidKey(_) => {
                MetaError::Crypto(e.to_string())
            }
        }
    }
}

impl From<bincode::Error> for MetaError {
    fn from(e: bincode::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}
