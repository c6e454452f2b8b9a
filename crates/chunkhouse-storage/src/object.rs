//! Object-Store Chunk Storage
//!
//! [`ChunkStorage`] adapter over any [`object_store::ObjectStore`] (S3,
//! MinIO, local filesystem, in-memory). Object stores write whole blobs, so
//! this backend reports `supports_append() == false`: every chunk is created
//! and then written exactly once, and each logical segment write produces at
//! least one new chunk.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};

use crate::error::{ChunkError, Result};
use crate::provider::{ChunkHandle, ChunkInfo, ChunkStorage};

pub struct ObjectStoreChunkStorage {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreChunkStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn length_of(&self, name: &str) -> Result<Option<u64>> {
        match self.store.head(&Path::from(name)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ChunkStorage for ObjectStoreChunkStorage {
    fn supports_append(&self) -> bool {
        false
    }

    fn supports_concat(&self) -> bool {
        false
    }

    fn supports_truncate(&self) -> bool {
        false
    }

    async fn create(&self, name: &str) -> Result<ChunkHandle> {
        if self.length_of(name).await?.is_some() {
            return Err(ChunkError::ChunkAlreadyExists(name.to_string()));
        }
        self.store
            .put(&Path::from(name), PutPayload::from(Bytes::new()))
            .await?;
        Ok(ChunkHandle::writable(name))
    }

    async fn write(&self, handle: &ChunkHandle, offset: u64, data: &[u8]) -> Result<u64> {
        if handle.read_only {
            return Err(ChunkError::InvalidHandle(handle.name.clone()));
        }
        let length = self
            .length_of(&handle.name)
            .await?
            .ok_or_else(|| ChunkError::ChunkNotFound(handle.name.clone()))?;
        // Write-once: only an initial full-content write is valid.
        if offset != 0 || length != 0 {
            return Err(ChunkError::InvalidOffset {
                chunk: handle.name.clone(),
                offset,
                length,
            });
        }
        self.store
            .put(
                &Path::from(handle.name.as_str()),
                PutPayload::from(Bytes::copy_from_slice(data)),
            )
            .await?;
        Ok(data.len() as u64)
    }

    async fn read(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        let chunk_length = self
            .length_of(name)
            .await?
            .ok_or_else(|| ChunkError::ChunkNotFound(name.to_string()))?;
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= chunk_length)
            .ok_or(ChunkError::OutOfBounds {
                target: name.to_string(),
                offset,
                length,
            })?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        Ok(self
            .store
            .get_range(&Path::from(name), offset as usize..end as usize)
            .await?)
    }

    async fn concat(&self, _target: &ChunkHandle, _sources: &[String]) -> Result<u64> {
        Err(ChunkError::NotSupported("concat"))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.store.delete(&Path::from(name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_info(&self, name: &str) -> Result<Option<ChunkInfo>> {
        Ok(self.length_of(name).await?.map(|length| ChunkInfo {
            name: name.to_string(),
            length,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ChunkInfo>> {
        // Object-store listing is segment-delimited; list the parent
        // directory and filter on the raw string prefix so dotted chunk-name
        // prefixes work too.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir_path = Path::from(dir);
        let listing: Vec<_> = self
            .store
            .list(if dir.is_empty() {
                None
            } else {
                Some(&dir_path)
            })
            .try_collect()
            .await?;
        let mut infos: Vec<ChunkInfo> = listing
            .into_iter()
            .filter(|meta| meta.location.as_ref().starts_with(prefix))
            .map(|meta| ChunkInfo {
                name: meta.location.as_ref().to_string(),
                length: meta.size as u64,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn storage() -> ObjectStoreChunkStorage {
        ObjectStoreChunkStorage::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_write_once_semantics() {
        let storage = storage();
        assert!(!storage.supports_append());

        let h = storage.create("seg/c0").await.unwrap();
        storage.write(&h, 0, b"hello").await.unwrap();
        assert!(matches!(
            storage.write(&h, 5, b" more").await,
            Err(ChunkError::InvalidOffset { .. })
        ));

        let data = storage.read("seg/c0", 1, 3).await.unwrap();
        assert_eq!(&data[..], b"ell");
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let storage = storage();
        storage.create("c0").await.unwrap();
        assert!(matches!(
            storage.create("c0").await,
            Err(ChunkError::ChunkAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_list_with_dotted_prefix() {
        let storage = storage();
        for name in ["dir/seg.a", "dir/seg.b", "dir/other"] {
            let h = storage.create(name).await.unwrap();
            storage.write(&h, 0, b"x").await.unwrap();
        }
        let listed = storage.list("dir/seg.").await.unwrap();
        assert_eq!(
            listed.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["dir/seg.a", "dir/seg.b"]
        );
    }

    #[tokio::test]
    async fn test_delete_missing_ok() {
        let storage = storage();
        storage.delete("nope").await.unwrap();
    }
}
