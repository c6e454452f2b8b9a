//! Metadata Store Error Types
//!
//! Errors raised by the transactional metadata store. `VersionConflict` is the
//! one callers are expected to handle programmatically: it signals that a
//! concurrent transaction committed a change to a key this transaction had
//! acquired for modification, and the whole operation should be retried.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Metadata key not found: {0}")]
    KeyNotFound(String),

    #[error("Metadata key already exists: {0}")]
    KeyExists(String),

    #[error("Version conflict on key: {0}")]
    VersionConflict(String),

    #[error("Transaction is already committed or aborted")]
    TransactionClosed,

    #[error("Metadata backend error: {0}")]
    Backend(String),
}
