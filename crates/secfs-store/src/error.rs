//! Error types for the block store and version server.

use thiserror::Error;

use crate::block::BlockHash;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested block does not exist.
    #[error("Block not found: {hash}")]
    BlockNotFound {
        /// The hash that was not found.
        hash: BlockHash,
    },

    /// The server returned bytes that do not hash to the requested address.
    #[error("Hash mismatch: requested {expected}, content hashes to {actual}")]
    HashMismatch {
        /// The hash the client asked for.
        expected: BlockHash,
        /// The hash of the bytes actually returned.
        actual: BlockHash,
    },

    /// A compare-and-swap publish lost a race with another writer.
    #[error("Conflict publishing version structure for user {user}: {reason}")]
    Conflict {
        /// The user whose slot was contended.
        user: u64,
        /// Description of the conflict.
        reason: String,
    },

    /// The server could not be reached or timed out.
    #[error("Store unavailable: {reason}")]
    Unavailable {
        /// Description of the transport failure.
        reason: String,
    },
}

impl StoreError {
    /// Returns true if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}
