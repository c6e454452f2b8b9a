//! In-Memory Chunk Storage
//!
//! Reference [`ChunkStorage`] backend holding all chunks in a `BTreeMap`.
//! Used throughout the test suite, including the failover scenarios where a
//! single shared storage instance is handed from epoch to epoch while the
//! metadata store is thrown away.
//!
//! The append and concat capabilities can be toggled off to exercise the
//! strategies the engine uses against object-store-like backends that write
//! each blob exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{ChunkError, Result};
use crate::provider::{ChunkHandle, ChunkInfo, ChunkStorage};

pub struct InMemoryChunkStorage {
    chunks: RwLock<BTreeMap<String, Vec<u8>>>,
    supports_append: AtomicBool,
    supports_concat: AtomicBool,
}

impl InMemoryChunkStorage {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(BTreeMap::new()),
            supports_append: AtomicBool::new(true),
            supports_concat: AtomicBool::new(true),
        }
    }

    /// Toggle append support (simulates write-once backends).
    pub fn set_supports_append(&self, value: bool) {
        self.supports_append.store(value, Ordering::SeqCst);
    }

    pub fn set_supports_concat(&self, value: bool) {
        self.supports_concat.store(value, Ordering::SeqCst);
    }

    /// Number of stored chunks.
    pub async fn chunk_count(&self) -> usize {
        self.chunks.read().await.len()
    }
}

impl Default for InMemoryChunkStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkStorage for InMemoryChunkStorage {
    fn supports_append(&self) -> bool {
        self.supports_append.load(Ordering::SeqCst)
    }

    fn supports_concat(&self) -> bool {
        self.supports_concat.load(Ordering::SeqCst)
    }

    fn supports_truncate(&self) -> bool {
        false
    }

    async fn create(&self, name: &str) -> Result<ChunkHandle> {
        let mut chunks = self.chunks.write().await;
        if chunks.contains_key(name) {
            return Err(ChunkError::ChunkAlreadyExists(name.to_string()));
        }
        chunks.insert(name.to_string(), Vec::new());
        Ok(ChunkHandle::writable(name))
    }

    async fn write(&self, handle: &ChunkHandle, offset: u64, data: &[u8]) -> Result<u64> {
        if handle.read_only {
            return Err(ChunkError::InvalidHandle(handle.name.clone()));
        }
        let mut chunks = self.chunks.write().await;
        let chunk = chunks
            .get_mut(&handle.name)
            .ok_or_else(|| ChunkError::ChunkNotFound(handle.name.clone()))?;
        let length = chunk.len() as u64;
        if offset != length || (!self.supports_append() && offset != 0) {
            return Err(ChunkError::InvalidOffset {
                chunk: handle.name.clone(),
                offset,
                length,
            });
        }
        chunk.extend_from_slice(data);
        Ok(data.len() as u64)
    }

    async fn read(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        let chunks = self.chunks.read().await;
        let chunk = chunks
            .get(name)
            .ok_or_else(|| ChunkError::ChunkNotFound(name.to_string()))?;
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= chunk.len() as u64)
            .ok_or(ChunkError::OutOfBounds {
                target: name.to_string(),
                offset,
                length,
            })?;
        Ok(Bytes::copy_from_slice(
            &chunk[offset as usize..end as usize],
        ))
    }

    async fn concat(&self, target: &ChunkHandle, sources: &[String]) -> Result<u64> {
        if !self.supports_concat() {
            return Err(ChunkError::NotSupported("concat"));
        }
        let mut chunks = self.chunks.write().await;
        // Validate everything before mutating anything.
        if !chunks.contains_key(&target.name) {
            return Err(ChunkError::ChunkNotFound(target.name.clone()));
        }
        for source in sources {
            if !chunks.contains_key(source) {
                return Err(ChunkError::ChunkNotFound(source.clone()));
            }
        }
        for source in sources {
            let data = chunks.remove(source).unwrap_or_default();
            if let Some(chunk) = chunks.get_mut(&target.name) {
                chunk.extend_from_slice(&data);
            }
        }
        Ok(chunks.get(&target.name).map(|c| c.len() as u64).unwrap_or(0))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.chunks.write().await.remove(name);
        Ok(())
    }

    async fn get_info(&self, name: &str) -> Result<Option<ChunkInfo>> {
        Ok(self.chunks.read().await.get(name).map(|c| ChunkInfo {
            name: name.to_string(),
            length: c.len() as u64,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ChunkInfo>> {
        let chunks = self.chunks.read().await;
        Ok(chunks
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| ChunkInfo {
                name: name.clone(),
                length: data.len() as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_write_read() {
        let storage = InMemoryChunkStorage::new();
        let h = storage.create("c0").await.unwrap();
        storage.write(&h, 0, b"hello").await.unwrap();
        storage.write(&h, 5, b" world").await.unwrap();

        let data = storage.read("c0", 0, 11).await.unwrap();
        assert_eq!(&data[..], b"hello world");
        let data = storage.read("c0", 6, 5).await.unwrap();
        assert_eq!(&data[..], b"world");
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let storage = InMemoryChunkStorage::new();
        storage.create("c0").await.unwrap();
        assert!(matches!(
            storage.create("c0").await,
            Err(ChunkError::ChunkAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_non_contiguous_write_rejected() {
        let storage = InMemoryChunkStorage::new();
        let h = storage.create("c0").await.unwrap();
        storage.write(&h, 0, b"abc").await.unwrap();
        assert!(matches!(
            storage.write(&h, 5, b"x").await,
            Err(ChunkError::InvalidOffset { .. })
        ));
        assert!(matches!(
            storage.write(&h, 1, b"x").await,
            Err(ChunkError::InvalidOffset { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_append_backend_rejects_second_write() {
        let storage = InMemoryChunkStorage::new();
        storage.set_supports_append(false);
        let h = storage.create("c0").await.unwrap();
        storage.write(&h, 0, b"abc").await.unwrap();
        assert!(matches!(
            storage.write(&h, 3, b"def").await,
            Err(ChunkError::InvalidOffset { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        let storage = InMemoryChunkStorage::new();
        let h = storage.create("c0").await.unwrap();
        storage.write(&h, 0, b"abc").await.unwrap();
        assert!(matches!(
            storage.read("c0", 2, 5).await,
            Err(ChunkError::OutOfBounds { .. })
        ));
        assert!(matches!(
            storage.read("missing", 0, 1).await,
            Err(ChunkError::ChunkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concat_appends_and_deletes_sources() {
        let storage = InMemoryChunkStorage::new();
        let t = storage.create("t").await.unwrap();
        storage.write(&t, 0, b"aa").await.unwrap();
        let s1 = storage.create("s1").await.unwrap();
        storage.write(&s1, 0, b"bb").await.unwrap();
        let s2 = storage.create("s2").await.unwrap();
        storage.write(&s2, 0, b"cc").await.unwrap();

        let len = storage
            .concat(&t, &["s1".to_string(), "s2".to_string()])
            .await
            .unwrap();
        assert_eq!(len, 6);
        assert_eq!(&storage.read("t", 0, 6).await.unwrap()[..], b"aabbcc");
        assert!(storage.get_info("s1").await.unwrap().is_none());
        assert!(storage.get_info("s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let storage = InMemoryChunkStorage::new();
        storage.create("c0").await.unwrap();
        storage.delete("c0").await.unwrap();
        storage.delete("c0").await.unwrap();
        assert!(storage.get_info("c0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let storage = InMemoryChunkStorage::new();
        for name in ["a/1", "a/2", "b/1"] {
            storage.create(name).await.unwrap();
        }
        let listed = storage.list("a/").await.unwrap();
        assert_eq!(
            listed.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["a/1", "a/2"]
        );
    }
}
