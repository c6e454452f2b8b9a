//! Chunk and Segment Naming
//!
//! All names the engine reserves are derived deterministically from the
//! container id and epoch, so that recovery can enumerate everything it
//! needs with a single prefix listing on chunk storage:
//!
//! ```text
//! _system/containers/metadata_<c>                    container metadata segment
//! _system/containers/metadata_<c>$attributes.index   its attribute segment
//! _system/containers/storage_metadata_<c>            storage metadata segment
//! _system/containers/storage_metadata_<c>$attributes.index
//! _sysjournal/<c>/e<epoch>.f<file>[.b<batch>]        journal files / batches
//! _syssnapshot/<c>/e<epoch>.s<index>                 system snapshots
//! <segment>.E<epoch>.<uuid>                          data chunks
//! ```
//!
//! Epoch and index fields are zero-padded so that lexicographic listing
//! order equals numeric replay order.

use uuid::Uuid;

pub const SYSTEM_SEGMENT_PREFIX: &str = "_system/containers";
pub const JOURNAL_PREFIX: &str = "_sysjournal";
pub const SNAPSHOT_PREFIX: &str = "_syssnapshot";
pub const ATTRIBUTE_SUFFIX: &str = "$attributes.index";

const EPOCH_WIDTH: usize = 20;
const INDEX_WIDTH: usize = 10;

/// Name of the container metadata segment.
pub fn container_metadata_segment_name(container_id: u32) -> String {
    format!("{SYSTEM_SEGMENT_PREFIX}/metadata_{container_id}")
}

/// Name of the storage metadata segment.
pub fn storage_metadata_segment_name(container_id: u32) -> String {
    format!("{SYSTEM_SEGMENT_PREFIX}/storage_metadata_{container_id}")
}

/// Name of the attribute segment paired with `segment`.
pub fn attribute_segment_name(segment: &str) -> String {
    format!("{segment}{ATTRIBUTE_SUFFIX}")
}

/// The canonical system segments for a container, in bootstrap order.
pub fn system_segments(container_id: u32) -> Vec<String> {
    let storage = storage_metadata_segment_name(container_id);
    let container = container_metadata_segment_name(container_id);
    vec![
        storage.clone(),
        attribute_segment_name(&storage),
        container.clone(),
        attribute_segment_name(&container),
    ]
}

pub fn is_system_segment(name: &str, container_id: u32) -> bool {
    system_segments(container_id).iter().any(|s| s == name)
}

/// Prefix under which all journal chunks for a container live.
pub fn journal_prefix(container_id: u32) -> String {
    format!("{JOURNAL_PREFIX}/{container_id}/")
}

/// Prefix under which all snapshot chunks for a container live.
pub fn snapshot_prefix(container_id: u32) -> String {
    format!("{SNAPSHOT_PREFIX}/{container_id}/")
}

/// Journal file chunk name (appendable backends: one chunk per file).
pub fn journal_file_name(container_id: u32, epoch: u64, file_index: u64) -> String {
    format!(
        "{}e{:0ew$}.f{:0iw$}",
        journal_prefix(container_id),
        epoch,
        file_index,
        ew = EPOCH_WIDTH,
        iw = INDEX_WIDTH
    )
}

/// Journal batch chunk name (non-appendable backends: one chunk per batch).
pub fn journal_batch_name(container_id: u32, epoch: u64, file_index: u64, batch_index: u64) -> String {
    format!(
        "{}.b{:0iw$}",
        journal_file_name(container_id, epoch, file_index),
        batch_index,
        iw = INDEX_WIDTH
    )
}

/// Snapshot chunk name.
pub fn snapshot_name(container_id: u32, epoch: u64, index: u64) -> String {
    format!(
        "{}e{:0ew$}.s{:0iw$}",
        snapshot_prefix(container_id),
        epoch,
        index,
        ew = EPOCH_WIDTH,
        iw = INDEX_WIDTH
    )
}

/// Fresh, unique name for a data chunk of `segment`.
pub fn data_chunk_name(segment: &str, epoch: u64) -> String {
    format!("{segment}.E{epoch}.{}", Uuid::new_v4().simple())
}

/// Prefix matching every data chunk ever created for `segment`.
pub fn data_chunk_prefix(segment: &str) -> String {
    format!("{segment}.E")
}

/// Parsed coordinates of a journal chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JournalChunkName {
    pub epoch: u64,
    pub file_index: u64,
    /// `None` for appendable-backend file chunks, `Some` for per-batch chunks.
    pub batch_index: Option<u64>,
}

/// Parsed coordinates of a snapshot chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotChunkName {
    pub epoch: u64,
    pub index: u64,
}

pub fn parse_journal_chunk(container_id: u32, name: &str) -> Option<JournalChunkName> {
    let rest = name.strip_prefix(&journal_prefix(container_id))?;
    let rest = rest.strip_prefix('e')?;
    let (epoch, rest) = split_number(rest, EPOCH_WIDTH)?;
    let rest = rest.strip_prefix(".f")?;
    let (file_index, rest) = split_number(rest, INDEX_WIDTH)?;
    let batch_index = match rest {
        "" => None,
        _ => {
            let rest = rest.strip_prefix(".b")?;
            let (batch, tail) = split_number(rest, INDEX_WIDTH)?;
            if !tail.is_empty() {
                return None;
            }
            Some(batch)
        }
    };
    Some(JournalChunkName {
        epoch,
        file_index,
        batch_index,
    })
}

pub fn parse_snapshot_chunk(container_id: u32, name: &str) -> Option<SnapshotChunkName> {
    let rest = name.strip_prefix(&snapshot_prefix(container_id))?;
    let rest = rest.strip_prefix('e')?;
    let (epoch, rest) = split_number(rest, EPOCH_WIDTH)?;
    let rest = rest.strip_prefix(".s")?;
    let (index, tail) = split_number(rest, INDEX_WIDTH)?;
    if !tail.is_empty() {
        return None;
    }
    Some(SnapshotChunkName { epoch, index })
}

fn split_number(s: &str, width: usize) -> Option<(u64, &str)> {
    if s.len() < width {
        return None;
    }
    let (digits, rest) = s.split_at(width);
    digits.parse().ok().map(|n| (n, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_segments_fixed_derivation() {
        let segments = system_segments(42);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], "_system/containers/storage_metadata_42");
        assert_eq!(
            segments[1],
            "_system/containers/storage_metadata_42$attributes.index"
        );
        assert_eq!(segments[2], "_system/containers/metadata_42");
        assert_eq!(
            segments[3],
            "_system/containers/metadata_42$attributes.index"
        );

        for segment in &segments {
            assert!(is_system_segment(segment, 42));
            assert!(!is_system_segment(segment, 7));
        }
        assert!(!is_system_segment("orders", 42));
    }

    #[test]
    fn test_journal_name_roundtrip() {
        let name = journal_file_name(42, 3, 7);
        assert_eq!(
            parse_journal_chunk(42, &name),
            Some(JournalChunkName {
                epoch: 3,
                file_index: 7,
                batch_index: None
            })
        );

        let name = journal_batch_name(42, 3, 7, 11);
        assert_eq!(
            parse_journal_chunk(42, &name),
            Some(JournalChunkName {
                epoch: 3,
                file_index: 7,
                batch_index: Some(11)
            })
        );

        assert!(parse_journal_chunk(42, "garbage").is_none());
        assert!(parse_journal_chunk(7, &journal_file_name(42, 1, 1)).is_none());
    }

    #[test]
    fn test_snapshot_name_roundtrip() {
        let name = snapshot_name(42, 9, 2);
        assert_eq!(
            parse_snapshot_chunk(42, &name),
            Some(SnapshotChunkName { epoch: 9, index: 2 })
        );
        assert!(parse_snapshot_chunk(42, &journal_file_name(42, 9, 2)).is_none());
    }

    #[test]
    fn test_listing_order_is_replay_order() {
        let mut names = vec![
            journal_file_name(1, 10, 2),
            journal_file_name(1, 2, 1),
            journal_file_name(1, 2, 10),
            journal_file_name(1, 9, 1),
        ];
        names.sort();
        let parsed: Vec<_> = names
            .iter()
            .map(|n| parse_journal_chunk(1, n).unwrap())
            .collect();
        let mut sorted = parsed.clone();
        sorted.sort();
        assert_eq!(parsed, sorted);
    }

    #[test]
    fn test_data_chunk_names_unique_and_prefixed() {
        let a = data_chunk_name("orders", 3);
        let b = data_chunk_name("orders", 3);
        assert_ne!(a, b);
        assert!(a.starts_with(&data_chunk_prefix("orders")));
        assert!(a.starts_with("orders.E3."));
    }
}
