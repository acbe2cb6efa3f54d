#![warn(missing_docs)]

//! SecFS storage subsystem: content-addressed blocks and signed version slots
//!
//! The untrusted server keeps two things: immutable blocks named by their
//! BLAKE3 hash, and one opaque version-structure entry per user, updated by
//! compare-and-swap. Nothing here interprets filesystem semantics.

pub mod block;
pub mod error;
pub mod version;

pub use block::{BlockHash, BlockStore, BlockStoreStats, MemoryBlockStore};
pub use error::{StoreError, StoreResult};
pub use version::{MemoryVersionServer, VersionServer, VersionSnapshot};
