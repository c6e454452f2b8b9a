//! Chunk Garbage Collection
//!
//! Orphan chunks are a normal steady-state condition: aborted writes,
//! truncations, segment deletions and superseded journal files all leave
//! chunks behind that no metadata references. They never affect correctness
//! and are reclaimed here, asynchronously and best-effort.
//!
//! Deletions are delayed by `garbage_collection_delay` so that a concurrent
//! bootstrap replaying the journal can still resolve records that mention a
//! just-unlinked chunk. Failed deletes are logged and retried on the next
//! sweep; they never fail the operation that scheduled them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use chunkhouse_metadata::{MetadataStore, StorageRecord};

use crate::error::Result;
use crate::naming;
use crate::provider::ChunkStorage;

struct PendingDelete {
    name: String,
    due: Instant,
    /// Re-check the metadata store before deleting. Set for chunks found by
    /// reconciliation, which may belong to a not-yet-committed write.
    verify: bool,
}

pub struct GarbageCollector {
    chunk_storage: Arc<dyn ChunkStorage>,
    metadata: MetadataStore,
    delay: Duration,
    queue: Mutex<VecDeque<PendingDelete>>,
}

impl GarbageCollector {
    pub fn new(
        chunk_storage: Arc<dyn ChunkStorage>,
        metadata: MetadataStore,
        delay: Duration,
    ) -> Self {
        Self {
            chunk_storage,
            metadata,
            delay,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue chunks known to be unreferenced for delayed deletion.
    pub async fn schedule(&self, names: impl IntoIterator<Item = String>) {
        let due = Instant::now() + self.delay;
        let mut queue = self.queue.lock().await;
        for name in names {
            queue.push_back(PendingDelete {
                name,
                due,
                verify: false,
            });
        }
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Delete everything that is due. Returns the number of chunks deleted.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Instant::now();
        let due: Vec<PendingDelete> = {
            let mut queue = self.queue.lock().await;
            let mut due = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(item) = queue.pop_front() {
                if item.due <= now {
                    due.push(item);
                } else {
                    keep.push_back(item);
                }
            }
            *queue = keep;
            due
        };

        let mut deleted = 0;
        for item in due {
            if item.verify && self.is_referenced(&item.name).await? {
                debug!(chunk = %item.name, "reconciled chunk is referenced again, dropped from queue");
                continue;
            }
            match self.chunk_storage.delete(&item.name).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(chunk = %item.name, "garbage chunk deleted");
                }
                Err(e) => {
                    // Keep it queued; a later sweep retries.
                    warn!(chunk = %item.name, error = %e, "garbage chunk delete failed, will retry");
                    self.queue.lock().await.push_back(item);
                }
            }
        }
        Ok(deleted)
    }

    /// Compare chunk storage against segment metadata and queue every chunk
    /// under the segment's name prefix that the chain does not reference.
    pub async fn reconcile(&self, segment_name: &str) -> Result<usize> {
        let mut referenced = std::collections::HashSet::new();
        let mut tx = self.metadata.begin();
        if let Some(StorageRecord::Segment(segment)) = tx.get(segment_name).await? {
            let mut cursor = segment.first_chunk;
            while let Some(current) = cursor {
                cursor = match tx.get(&current).await? {
                    Some(StorageRecord::Chunk(chunk)) => chunk.next_chunk,
                    _ => None,
                };
                referenced.insert(current);
            }
        }

        let listed = self
            .chunk_storage
            .list(&naming::data_chunk_prefix(segment_name))
            .await?;
        let due = Instant::now() + self.delay;
        let mut queued = 0;
        let mut queue = self.queue.lock().await;
        for info in listed {
            if !referenced.contains(&info.name) {
                queue.push_back(PendingDelete {
                    name: info.name,
                    due,
                    verify: true,
                });
                queued += 1;
            }
        }
        Ok(queued)
    }

    async fn is_referenced(&self, chunk_name: &str) -> Result<bool> {
        let mut tx = self.metadata.begin();
        Ok(tx.get(chunk_name).await?.is_some())
    }

    /// Periodic sweep loop; spawn on the runtime of your choice.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "garbage sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::InMemoryChunkStorage;
    use chunkhouse_metadata::{ChunkMetadata, SegmentMetadata};

    #[tokio::test]
    async fn test_sweep_deletes_after_delay() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        storage.create("c0").await.unwrap();
        let gc = GarbageCollector::new(
            storage.clone(),
            MetadataStore::in_memory(),
            Duration::ZERO,
        );

        gc.schedule(vec!["c0".to_string()]).await;
        assert_eq!(gc.pending().await, 1);
        assert_eq!(gc.sweep().await.unwrap(), 1);
        assert_eq!(gc.pending().await, 0);
        assert!(storage.get_info("c0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delay_defers_deletion() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        storage.create("c0").await.unwrap();
        let gc = GarbageCollector::new(
            storage.clone(),
            MetadataStore::in_memory(),
            Duration::from_secs(3600),
        );

        gc.schedule(vec!["c0".to_string()]).await;
        assert_eq!(gc.sweep().await.unwrap(), 0);
        assert_eq!(gc.pending().await, 1);
        assert!(storage.get_info("c0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_finds_orphans() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let metadata = MetadataStore::in_memory();

        // Segment with one linked chunk and one orphan under its prefix.
        let linked = naming::data_chunk_name("orders", 1);
        let orphan = naming::data_chunk_name("orders", 1);
        for name in [&linked, &orphan] {
            let h = storage.create(name).await.unwrap();
            storage.write(&h, 0, b"data").await.unwrap();
        }

        let mut segment = SegmentMetadata::new("orders", 64, 1);
        segment.length = 4;
        segment.chunk_count = 1;
        segment.first_chunk = Some(linked.clone());
        segment.last_chunk = Some(linked.clone());
        let mut tx = metadata.begin();
        tx.create(StorageRecord::Segment(segment)).unwrap();
        tx.create(StorageRecord::Chunk(ChunkMetadata::new(&linked, 4)))
            .unwrap();
        tx.commit().await.unwrap();

        let gc = GarbageCollector::new(storage.clone(), metadata, Duration::ZERO);
        assert_eq!(gc.reconcile("orders").await.unwrap(), 1);
        assert_eq!(gc.sweep().await.unwrap(), 1);
        assert!(storage.get_info(&orphan).await.unwrap().is_none());
        assert!(storage.get_info(&linked).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconciled_chunk_relinked_before_sweep_is_spared() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let metadata = MetadataStore::in_memory();
        let chunk = naming::data_chunk_name("orders", 1);
        let h = storage.create(&chunk).await.unwrap();
        storage.write(&h, 0, b"data").await.unwrap();

        let gc = GarbageCollector::new(storage.clone(), metadata.clone(), Duration::ZERO);
        assert_eq!(gc.reconcile("orders").await.unwrap(), 1);

        // An in-flight write commits the chunk record before the sweep runs.
        let mut tx = metadata.begin();
        tx.create(StorageRecord::Chunk(ChunkMetadata::new(&chunk, 4)))
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(gc.sweep().await.unwrap(), 0);
        assert!(storage.get_info(&chunk).await.unwrap().is_some());
    }
}
