//! Segment and Chunk Metadata Records
//!
//! This module defines the typed records stored in the metadata store.
//!
//! ## Data Model
//!
//! A *segment* is a logical append-only byte sequence realized as a
//! single-linked list of *chunks* (blobs in chunk storage). The store keeps
//! one record per segment and one record per chunk, both keyed by name:
//!
//! ```text
//! SegmentMetadata("orders")
//!     first_chunk ──► ChunkMetadata("orders.E1.a3f…")
//!                         next_chunk ──► ChunkMetadata("orders.E1.77b…")
//!                                            next_chunk ──► None (= last_chunk)
//! ```
//!
//! ## Layout Invariants
//!
//! For every segment: walking `first_chunk` via `next_chunk` yields exactly
//! `chunk_count` chunks whose lengths sum to `length - first_chunk_start_offset`,
//! terminating at `last_chunk`. `start_offset` (the truncation point) always
//! lies in `[first_chunk_start_offset, length]`.

use serde::{Deserialize, Serialize};

/// Segment is live and accepts operations.
pub const STATUS_ACTIVE: u32 = 0x1;
/// Segment is sealed; writes and truncates are rejected.
pub const STATUS_SEALED: u32 = 0x2;
/// Owner epoch changed since the last chunk was written. The next write must
/// start a fresh chunk instead of extending the tail chunk, so that a prior
/// owner still appending to that chunk can never interleave with new data.
pub const STATUS_OWNERSHIP_CHANGED: u32 = 0x4;

/// Metadata record for a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Segment name (record key).
    pub name: String,

    /// Exclusive end offset of the segment.
    pub length: u64,

    /// Inclusive begin offset after truncation.
    pub start_offset: u64,

    /// Number of chunks in the linked list.
    pub chunk_count: u32,

    /// First chunk in the list, if any.
    pub first_chunk: Option<String>,

    /// Last chunk in the list, if any.
    pub last_chunk: Option<String>,

    /// Segment offset of the first byte of `first_chunk`.
    pub first_chunk_start_offset: u64,

    /// Segment offset of the first byte of `last_chunk`.
    pub last_chunk_start_offset: u64,

    /// Maximum chunk length for this segment, fixed at create time.
    pub max_rolling_length: u64,

    /// Status bits (`STATUS_*`).
    pub status: u32,

    /// Epoch of the container instance that owns this segment.
    pub owner_epoch: u64,

    /// Last modification timestamp (milliseconds since epoch).
    pub last_modified: i64,
}

impl SegmentMetadata {
    /// New empty active segment owned by `owner_epoch`.
    pub fn new(name: impl Into<String>, max_rolling_length: u64, owner_epoch: u64) -> Self {
        Self {
            name: name.into(),
            length: 0,
            start_offset: 0,
            chunk_count: 0,
            first_chunk: None,
            last_chunk: None,
            first_chunk_start_offset: 0,
            last_chunk_start_offset: 0,
            max_rolling_length,
            status: STATUS_ACTIVE,
            owner_epoch,
            last_modified: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status & STATUS_ACTIVE != 0
    }

    pub fn is_sealed(&self) -> bool {
        self.status & STATUS_SEALED != 0
    }

    pub fn is_ownership_changed(&self) -> bool {
        self.status & STATUS_OWNERSHIP_CHANGED != 0
    }

    pub fn set_sealed(&mut self, sealed: bool) {
        if sealed {
            self.status |= STATUS_SEALED;
        } else {
            self.status &= !STATUS_SEALED;
        }
    }

    pub fn set_ownership_changed(&mut self, changed: bool) {
        if changed {
            self.status |= STATUS_OWNERSHIP_CHANGED;
        } else {
            self.status &= !STATUS_OWNERSHIP_CHANGED;
        }
    }
}

/// Metadata record for a single chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Chunk name (record key).
    pub name: String,

    /// Length in bytes, as known to the segment layout. Chunk storage may
    /// hold more bytes than this if a fenced-out writer padded the blob;
    /// those bytes are not part of any segment.
    pub length: u64,

    /// Next chunk in the segment's list, `None` for the last chunk.
    pub next_chunk: Option<String>,
}

impl ChunkMetadata {
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            length,
            next_chunk: None,
        }
    }
}

/// A record stored in the metadata store, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageRecord {
    Segment(SegmentMetadata),
    Chunk(ChunkMetadata),
}

impl StorageRecord {
    /// The key this record is stored under.
    pub fn key(&self) -> &str {
        match self {
            StorageRecord::Segment(s) => &s.name,
            StorageRecord::Chunk(c) => &c.name,
        }
    }

    pub fn as_segment(&self) -> Option<&SegmentMetadata> {
        match self {
            StorageRecord::Segment(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_chunk(&self) -> Option<&ChunkMetadata> {
        match self {
            StorageRecord::Chunk(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_segment(self) -> Option<SegmentMetadata> {
        match self {
            StorageRecord::Segment(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_chunk(self) -> Option<ChunkMetadata> {
        match self {
            StorageRecord::Chunk(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let mut seg = SegmentMetadata::new("s", 128, 1);
        assert!(seg.is_active());
        assert!(!seg.is_sealed());
        assert!(!seg.is_ownership_changed());

        seg.set_sealed(true);
        assert!(seg.is_sealed());
        assert!(seg.is_active());

        seg.set_ownership_changed(true);
        assert!(seg.is_ownership_changed());
        seg.set_ownership_changed(false);
        assert!(!seg.is_ownership_changed());

        seg.set_sealed(false);
        assert!(!seg.is_sealed());
    }

    #[test]
    fn test_record_key() {
        let seg = StorageRecord::Segment(SegmentMetadata::new("seg", 64, 1));
        assert_eq!(seg.key(), "seg");

        let chunk = StorageRecord::Chunk(ChunkMetadata::new("seg.chunk0", 10));
        assert_eq!(chunk.key(), "seg.chunk0");
        assert!(chunk.as_chunk().is_some());
        assert!(chunk.as_segment().is_none());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut seg = SegmentMetadata::new("seg", 64, 3);
        seg.first_chunk = Some("c0".to_string());
        seg.last_chunk = Some("c1".to_string());
        seg.length = 12;
        seg.chunk_count = 2;

        let json = serde_json::to_string(&StorageRecord::Segment(seg.clone())).unwrap();
        let back: StorageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_segment(), Some(&seg));
    }
}
