//! Error types for the attune core library.

use thiserror::Error;

use crate::types::{MemoryId, ValidationState};

/// Top-level error type for all attune core operations.
#[derive(Error, Debug)]
pub enum AttuneError {
    /// A memory with the given ID was not found.
    #[error("Memory not found: {0}")]
    MemoryNotFound(MemoryId),

    /// A validation-state change that the lifecycle does not allow.
    #[error("Invalid validation transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// The memory being changed.
        id: MemoryId,
        /// Current state.
        from: ValidationState,
        /// Requested state.
        to: ValidationState,
    },

    /// A consolidation write landed only partially.
    ///
    /// The new record and the invalidations form one logical unit; this
    /// error reports exactly which half (or which ids) did not land so the
    /// caller never treats the candidate as resolved.
    #[error(
        "Partial resolution: new record {new_record} written={new_record_written}, \
         invalidated {} of {} ids ({reason})",
        .invalidated.len(),
        .invalidated.len() + .pending.len()
    )]
    PartialResolution {
        /// ID of the consolidated record that was being written.
        new_record: MemoryId,
        /// Whether the consolidated record is present in the store.
        new_record_written: bool,
        /// IDs that were successfully retired.
        invalidated: Vec<MemoryId>,
        /// IDs that should have been retired but were not.
        pending: Vec<MemoryId>,
        /// The underlying failure.
        reason: String,
    },

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Key-value store failure that is not a SQLite error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The similarity search collaborator failed.
    #[error("Similarity search failed: {0}")]
    Search(String),

    /// The embedding collaborator failed.
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for AttuneError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, AttuneError>;
