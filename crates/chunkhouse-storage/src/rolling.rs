//! Segment Rolling Policy
//!
//! Bounds the size of any single chunk within a segment. A single logical
//! write may cross chunk boundaries: the planner below turns (tail-chunk
//! state, payload size) into a sequence of chunk-sized slices, the first of
//! which may extend the existing tail chunk when the backend supports append.

use serde::{Deserialize, Serialize};

/// Per-segment rolling policy, fixed at segment create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRollingPolicy {
    /// Maximum length of any chunk in the segment (bytes).
    #[serde(default = "default_max_length")]
    pub max_length: u64,
}

impl SegmentRollingPolicy {
    pub fn new(max_length: u64) -> Self {
        Self { max_length }
    }
}

impl Default for SegmentRollingPolicy {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
        }
    }
}

fn default_max_length() -> u64 {
    64 * 1024 * 1024 // 64MB
}

/// One step of a planned multi-chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSlice {
    /// Append `length` bytes to the existing tail chunk.
    ExtendLast { length: u64 },
    /// Create a new chunk and write `length` bytes into it.
    NewChunk { length: u64 },
}

impl WriteSlice {
    pub fn length(&self) -> u64 {
        match self {
            WriteSlice::ExtendLast { length } | WriteSlice::NewChunk { length } => *length,
        }
    }
}

/// Split a pending write of `payload_len` bytes into chunk-sized slices.
///
/// `last_chunk_length` is the metadata length of the current tail chunk
/// (`None` when the segment has no chunks). The tail chunk is only extended
/// when `can_extend_last` holds: the backend supports append and the segment
/// has not just changed owners.
pub fn plan_write(
    policy: SegmentRollingPolicy,
    max_chunk_size: u64,
    last_chunk_length: Option<u64>,
    can_extend_last: bool,
    payload_len: u64,
) -> Vec<WriteSlice> {
    let chunk_limit = policy.max_length.min(max_chunk_size).max(1);
    let mut slices = Vec::new();
    let mut remaining = payload_len;

    if can_extend_last {
        if let Some(len) = last_chunk_length {
            let room = chunk_limit.saturating_sub(len);
            if room > 0 && remaining > 0 {
                let take = room.min(remaining);
                slices.push(WriteSlice::ExtendLast { length: take });
                remaining -= take;
            }
        }
    }

    while remaining > 0 {
        let take = chunk_limit.min(remaining);
        slices.push(WriteSlice::NewChunk { length: take });
        remaining -= take;
    }

    slices
}
