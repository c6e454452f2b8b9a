//! Chunk-Layer Error Types
//!
//! One enum covers both halves of the engine:
//!
//! - segment-level failures surfaced to the container (`SegmentNotFound`,
//!   `BadOffset`, `StorageNotPrimary`, ...)
//! - chunk-storage failures raised by backends (`ChunkNotFound`,
//!   `InvalidOffset`, `ChunkStorageFailure`, ...)
//!
//! `Metadata(VersionConflict)` is retried internally with bounded backoff;
//! everything else propagates with `?`. `StorageNotPrimary` tells the caller
//! it lost the epoch fence and must re-initialize; `BootstrapFailed` is fatal
//! for the container.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChunkError>;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Segment already exists: {0}")]
    SegmentExists(String),

    #[error("Segment is sealed: {0}")]
    SegmentSealed(String),

    #[error("Segment is not sealed: {0}")]
    SegmentNotSealed(String),

    #[error("Bad offset {offset} for segment {segment} (expected {expected})")]
    BadOffset {
        segment: String,
        offset: u64,
        expected: u64,
    },

    #[error("Read out of bounds on {target}: [{offset}, {offset}+{length})")]
    OutOfBounds {
        target: String,
        offset: u64,
        length: u64,
    },

    #[error("Not primary for segment {segment}: owner epoch {owner_epoch}, current epoch {current_epoch}")]
    StorageNotPrimary {
        segment: String,
        owner_epoch: u64,
        current_epoch: u64,
    },

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Chunk already exists: {0}")]
    ChunkAlreadyExists(String),

    #[error("Invalid write offset {offset} on chunk {chunk} (length {length})")]
    InvalidOffset {
        chunk: String,
        offset: u64,
        length: u64,
    },

    #[error("Chunk storage failure: {0}")]
    ChunkStorageFailure(String),

    #[error("Journal write failed: {0}")]
    JournalWriteFailed(String),

    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Chunk manager is not bootstrapped")]
    NotReady,

    #[error("Operation timed out")]
    OperationTimeout,

    #[error("Operation cancelled")]
    OperationCancelled,

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("Metadata error: {0}")]
    Metadata(#[from] chunkhouse_metadata::MetadataError),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl ChunkError {
    /// Whether the failed operation may be retried as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChunkError::Metadata(chunkhouse_metadata::MetadataError::VersionConflict(_))
        )
    }
}
