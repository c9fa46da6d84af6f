//! Error taxonomy shared by all stores.
//!
//! Connectivity failures arrive as [`Error::Storage`] and are never retried
//! internally. Business-rule violations are separate variants so callers can
//! branch on them. Absence is not an error: lookups return `Option`.

use std::fmt;

use uuid::Uuid;

use crate::codec::CodecError;
use crate::storage::StorageError;

/// Why an optimistic-concurrency check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Stored version differs from the caller's last-seen version.
    Modified,
    /// No version is stored any more.
    Deleted,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::Modified => f.write_str("modified since it was last loaded"),
            ConflictReason::Deleted => f.write_str("deleted since it was last loaded"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unique property {property} of {saga_type} already exists with value {value}")]
    UniquenessViolation {
        saga_type: String,
        property: String,
        value: String,
    },

    #[error("Saga {saga_id} has been {reason}")]
    ConcurrencyConflict {
        saga_id: Uuid,
        reason: ConflictReason,
    },

    #[error("Message {message_id} does not have a {header} header")]
    MissingRequiredHeader { message_id: String, header: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timed out acquiring lock {lock}")]
    LockTimeout { lock: String },

    #[error("Queue receiver not initialized")]
    NotInitialized,

    #[error("{failed} transaction participant(s) failed, first error: {first}")]
    Participant { failed: usize, first: Box<Error> },
}

impl Error {
    /// True for store connectivity failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
