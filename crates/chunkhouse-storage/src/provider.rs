//! Chunk Storage Contract
//!
//! The pluggable boundary between the segment engine and whatever actually
//! holds the bytes: an in-memory map ([`crate::mem::InMemoryChunkStorage`]),
//! an object store ([`crate::object::ObjectStoreChunkStorage`]), or anything
//! else that can create, write, read, list and delete named blobs.
//!
//! Capability flags drive strategy selection upstream:
//!
//! - `supports_append() == false` means a chunk is written exactly once at
//!   creation; every logical write then produces at least one new chunk.
//! - `supports_concat()` enables server-side concatenation of sealed chunks.
//!
//! Writes are append-only everywhere: a write at any offset other than the
//! chunk's current length fails with `InvalidOffset`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Handle to an open chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHandle {
    pub name: String,
    pub read_only: bool,
}

impl ChunkHandle {
    pub fn writable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: false,
        }
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: true,
        }
    }
}

/// Information about a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub name: String,
    pub length: u64,
}

/// Primitive blob operations over named, append-only chunks.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Whether existing chunks can be extended by writes at their tail.
    fn supports_append(&self) -> bool;

    /// Whether `concat` is available.
    fn supports_concat(&self) -> bool;

    /// Whether chunks can be truncated in place.
    fn supports_truncate(&self) -> bool;

    /// Create an empty chunk. Fails with `ChunkAlreadyExists` if present.
    async fn create(&self, name: &str) -> Result<ChunkHandle>;

    /// Append `data` at `offset`, which must equal the chunk's current
    /// length. Returns the number of bytes written.
    async fn write(&self, handle: &ChunkHandle, offset: u64, data: &[u8]) -> Result<u64>;

    /// Read `length` bytes starting at `offset`.
    async fn read(&self, name: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Atomically append the contents of `sources` (in order) to `target`
    /// and delete them. Returns the target's new length.
    async fn concat(&self, target: &ChunkHandle, sources: &[String]) -> Result<u64>;

    /// Delete a chunk. Deleting a missing chunk is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Length lookup; `None` if the chunk does not exist.
    async fn get_info(&self, name: &str) -> Result<Option<ChunkInfo>>;

    /// All chunks whose names start with `prefix`, in name order.
    async fn list(&self, prefix: &str) -> Result<Vec<ChunkInfo>>;
}
