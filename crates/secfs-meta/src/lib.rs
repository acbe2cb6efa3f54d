#![warn(missing_docs)]

//! SecFS metadata subsystem: i-tables, signed version structures, fork
//! detection, inode/directory operations

pub mod access;
pub mod config;
pub mod directory;
pub mod fs;
pub mod inode;
pub mod itable;
pub mod types;
pub mod vsl;

pub use access::{GroupDirectory, GroupMembership, PublicKeyDirectory, UserDirectory};
pub use config::SessionConfig;
pub use directory::{DirEntry, Directory};
pub use fs::{Session, GROUPS_FILE, USERS_FILE};
pub use inode::{Inode, InodeKind};
pub use itable::{Itable, Mapping, PointerTable};
pub use types::{
    DenialReason, GroupId, IHandle, MetaError, Principal, SlotKey, Timestamp, UserId,
};
pub use vsl::{
    ForkEvidence, IntegrityEvent, MergeReport, MergedView, VersionStructure,
    VersionStructureList, VersionVector, VslState,
};
