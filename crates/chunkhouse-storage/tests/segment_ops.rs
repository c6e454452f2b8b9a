//! Segment-level properties of the chunk manager: read-after-write,
//! truncation visibility, rolling bounds, and orphan reclamation.

use std::sync::Arc;

use chunkhouse_metadata::MetadataStore;
use chunkhouse_storage::{
    naming, ChunkError, ChunkManager, ChunkManagerConfig, ChunkStorage, InMemoryChunkStorage,
    SegmentRollingPolicy,
};

async fn manager_with(storage: Arc<InMemoryChunkStorage>, max_length: u64) -> ChunkManager {
    let config = ChunkManagerConfig {
        default_rolling_policy: SegmentRollingPolicy::new(max_length),
        garbage_collection_delay: std::time::Duration::ZERO,
        ..Default::default()
    };
    let manager = ChunkManager::new(storage, config);
    manager.initialize(1);
    manager
        .bootstrap(7, MetadataStore::in_memory())
        .await
        .unwrap();
    manager
}

#[tokio::test]
async fn test_read_after_write_property() {
    let storage = Arc::new(InMemoryChunkStorage::new());
    let manager = manager_with(storage, 7).await;

    manager
        .create("events", SegmentRollingPolicy::new(7))
        .await
        .unwrap();
    let h = manager.open_write("events").await.unwrap();

    // Appends of awkward sizes relative to the 7-byte rolling limit.
    let writes: Vec<Vec<u8>> = (0u8..12)
        .map(|i| vec![b'a' + i; (i as usize % 5) + 1])
        .collect();
    let mut expected = Vec::new();
    for data in &writes {
        manager
            .write(&h, expected.len() as u64, data)
            .await
            .unwrap();
        expected.extend_from_slice(data);
    }

    let hr = manager.open_read("events").await.unwrap();
    let total = expected.len() as u64;
    let all = manager.read(&hr, 0, total).await.unwrap();
    assert_eq!(&all[..], &expected[..]);

    // Every window, not just the full range.
    for start in (0..expected.len()).step_by(3) {
        for len in [1usize, 2, 5, 11] {
            if start + len <= expected.len() {
                let window = manager.read(&hr, start as u64, len as u64).await.unwrap();
                assert_eq!(&window[..], &expected[start..start + len]);
            }
        }
    }
}

#[tokio::test]
async fn test_truncation_preserves_tail_bytes() {
    let storage = Arc::new(InMemoryChunkStorage::new());
    let manager = manager_with(storage, 5).await;

    manager
        .create("logs", SegmentRollingPolicy::new(5))
        .await
        .unwrap();
    let h = manager.open_write("logs").await.unwrap();
    let payload: Vec<u8> = (0u8..40).collect();
    manager.write(&h, 0, &payload).await.unwrap();

    let before = manager.read(&h, 13, 27).await.unwrap();
    manager.truncate(&h, 13).await.unwrap();

    // Bytes at and above the truncation point are unchanged.
    let after = manager.read(&h, 13, 27).await.unwrap();
    assert_eq!(before, after);

    // Bytes below it are gone.
    for offset in [0u64, 5, 12] {
        assert!(matches!(
            manager.read(&h, offset, 1).await,
            Err(ChunkError::OutOfBounds { .. })
        ));
    }

    // Truncation is monotone.
    assert!(matches!(
        manager.truncate(&h, 12).await,
        Err(ChunkError::BadOffset { .. })
    ));
}

#[tokio::test]
async fn test_rolling_bounds() {
    let storage = Arc::new(InMemoryChunkStorage::new());
    let manager = manager_with(storage, 6).await;

    manager
        .create("metrics", SegmentRollingPolicy::new(6))
        .await
        .unwrap();
    let h = manager.open_write("metrics").await.unwrap();
    let mut offset = 0u64;
    for size in [1u64, 9, 2, 14, 3, 6, 5] {
        manager
            .write(&h, offset, &vec![b'x'; size as usize])
            .await
            .unwrap();
        offset += size;
    }

    let info = manager.get_segment_info("metrics").await.unwrap();
    assert_eq!(info.length, offset);

    let metadata = manager.metadata_store().await.unwrap();
    let mut tx = metadata.begin();
    let mut cursor = info.first_chunk.clone();
    let mut lengths = Vec::new();
    while let Some(name) = cursor {
        let chunk = tx.get(&name).await.unwrap().unwrap().into_chunk().unwrap();
        lengths.push(chunk.length);
        cursor = chunk.next_chunk;
    }
    assert_eq!(lengths.iter().sum::<u64>(), offset);
    assert!(lengths.iter().all(|len| *len <= 6));
    // On an append-capable backend within one epoch, only the tail chunk may
    // be partially filled.
    for len in &lengths[..lengths.len() - 1] {
        assert_eq!(*len, 6);
    }
}

#[tokio::test]
async fn test_orphan_chunks_are_reconciled_away() {
    let storage = Arc::new(InMemoryChunkStorage::new());
    let manager = manager_with(storage.clone(), 8).await;

    manager
        .create("orders", SegmentRollingPolicy::new(8))
        .await
        .unwrap();
    let h = manager.open_write("orders").await.unwrap();
    manager.write(&h, 0, b"committed").await.unwrap();

    // A crashed write leaves a chunk behind that no metadata references.
    let orphan = naming::data_chunk_name("orders", 1);
    let orphan_handle = storage.create(&orphan).await.unwrap();
    storage
        .write(&orphan_handle, 0, b"uncommitted")
        .await
        .unwrap();

    let gc = manager.garbage_collector().await.unwrap();
    assert_eq!(gc.reconcile("orders").await.unwrap(), 1);
    assert_eq!(gc.sweep().await.unwrap(), 1);
    assert!(storage.get_info(&orphan).await.unwrap().is_none());

    // The committed data is untouched.
    let hr = manager.open_read("orders").await.unwrap();
    let bytes = manager.read(&hr, 0, 9).await.unwrap();
    assert_eq!(&bytes[..], b"committed");
}

#[tokio::test]
async fn test_system_segment_content_survives_metadata_loss() {
    let storage = Arc::new(InMemoryChunkStorage::new());
    let segment = naming::system_segments(7)[0].clone();

    let manager1 = manager_with(storage.clone(), 8).await;
    let h1 = manager1.open_write(&segment).await.unwrap();
    manager1.write(&h1, 0, b"frozen").await.unwrap();

    // A later epoch rebuilds the same bytes from chunk storage alone.
    let manager2 = {
        let config = ChunkManagerConfig {
            default_rolling_policy: SegmentRollingPolicy::new(8),
            ..Default::default()
        };
        let m = ChunkManager::new(storage, config);
        m.initialize(2);
        m.bootstrap(7, MetadataStore::in_memory()).await.unwrap();
        m
    };
    let info = manager2.get_segment_info(&segment).await.unwrap();
    assert_eq!(info.length, 6);
    let hr = manager2.open_read(&segment).await.unwrap();
    let bytes = manager2.read(&hr, 0, 6).await.unwrap();
    assert_eq!(&bytes[..], b"frozen");
}
