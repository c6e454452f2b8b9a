//! Chunk Manager Configuration
//!
//! Controls rolling, journaling, garbage collection and retry behavior:
//!
//! - **default_rolling_policy.max_length**: close the current chunk and open
//!   a new one once it reaches this size (default: 64MB)
//! - **journal_snapshot_interval**: write a full system snapshot after this
//!   many journal records (default: 100)
//! - **journal_max_file_size**: rotate the journal file once it exceeds this
//!   size (default: 16MB)
//! - **garbage_collection_delay**: how long an unlinked chunk stays deletable
//!   but undeleted, so a concurrent bootstrap can still resolve records that
//!   reference it (default: 60s)
//! - **max_indexed_segments**: metadata cache capacity (default: 1024)
//! - **max_chunk_size**: hard upper bound on any single chunk, applied on
//!   top of the rolling policy (default: 128MB)
//! - **min_size_for_concat**: sources smaller than this are re-copied rather
//!   than re-linked during concat (default: 4KB)
//! - **max_metadata_retries** / **retry_backoff**: bounded retry of metadata
//!   version conflicts (defaults: 5, 10ms linear)
//! - **operation_timeout**: optional deadline applied to every public
//!   ChunkManager operation; expiry surfaces `OperationTimeout`
//!
//! ## Usage
//!
//! ```ignore
//! use chunkhouse_storage::{ChunkManagerConfig, SegmentRollingPolicy};
//!
//! // Small chunks for tests
//! let config = ChunkManagerConfig {
//!     default_rolling_policy: SegmentRollingPolicy { max_length: 8 },
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rolling::SegmentRollingPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManagerConfig {
    /// Rolling policy applied to segments created without an explicit one.
    #[serde(default)]
    pub default_rolling_policy: SegmentRollingPolicy,

    /// Journal records between automatic snapshots.
    #[serde(default = "default_journal_snapshot_interval")]
    pub journal_snapshot_interval: u64,

    /// Maximum journal file size before rotation (bytes).
    #[serde(default = "default_journal_max_file_size")]
    pub journal_max_file_size: u64,

    /// Delay before an unlinked chunk is actually deleted.
    #[serde(default = "default_garbage_collection_delay", with = "duration_ms")]
    pub garbage_collection_delay: Duration,

    /// Capacity of the metadata store's clean-entry cache.
    #[serde(default = "default_max_indexed_segments")]
    pub max_indexed_segments: usize,

    /// Hard upper bound on any single chunk (bytes).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Minimum source size for chunk re-linking during concat (bytes).
    #[serde(default = "default_min_size_for_concat")]
    pub min_size_for_concat: u64,

    /// Maximum retries of a metadata version conflict.
    #[serde(default = "default_max_metadata_retries")]
    pub max_metadata_retries: u32,

    /// Base backoff between retries (grows linearly per attempt).
    #[serde(default = "default_retry_backoff", with = "duration_ms")]
    pub retry_backoff: Duration,

    /// Optional deadline for every public operation.
    #[serde(default, with = "opt_duration_ms")]
    pub operation_timeout: Option<Duration>,
}

impl Default for ChunkManagerConfig {
    fn default() -> Self {
        Self {
            default_rolling_policy: SegmentRollingPolicy::default(),
            journal_snapshot_interval: default_journal_snapshot_interval(),
            journal_max_file_size: default_journal_max_file_size(),
            garbage_collection_delay: default_garbage_collection_delay(),
            max_indexed_segments: default_max_indexed_segments(),
            max_chunk_size: default_max_chunk_size(),
            min_size_for_concat: default_min_size_for_concat(),
            max_metadata_retries: default_max_metadata_retries(),
            retry_backoff: default_retry_backoff(),
            operation_timeout: None,
        }
    }
}

fn default_journal_snapshot_interval() -> u64 {
    100
}

fn default_journal_max_file_size() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_garbage_collection_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_indexed_segments() -> usize {
    1024
}

fn default_max_chunk_size() -> u64 {
    128 * 1024 * 1024 // 128MB
}

fn default_min_size_for_concat() -> u64 {
    4 * 1024 // 4KB
}

fn default_max_metadata_retries() -> u32 {
    5
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(10)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChunkManagerConfig::default();
        assert_eq!(config.journal_snapshot_interval, 100);
        assert_eq!(config.journal_max_file_size, 16 * 1024 * 1024);
        assert_eq!(config.garbage_collection_delay, Duration::from_secs(60));
        assert!(config.operation_timeout.is_none());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = ChunkManagerConfig {
            operation_timeout: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ChunkManagerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.operation_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(
            back.default_rolling_policy.max_length,
            config.default_rolling_policy.max_length
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ChunkManagerConfig =
            serde_json::from_str(r#"{"journal_snapshot_interval": 7}"#).unwrap();
        assert_eq!(config.journal_snapshot_interval, 7);
        assert_eq!(config.max_metadata_retries, 5);
        assert_eq!(config.garbage_collection_delay, Duration::from_secs(60));
    }
}
