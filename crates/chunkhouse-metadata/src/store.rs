//! Transactional Metadata Store
//!
//! This module implements the pessimistic, versioned key-value store that
//! holds all segment and chunk records.
//!
//! ## What Does This Do?
//!
//! The store is split in two layers, so that the transactional engine can be
//! reused over any persistence backend:
//!
//! - [`KeyValueStorage`] is the persistence seam: batched reads and writes of
//!   versioned entries. [`InMemoryKeyValueStorage`] is the built-in backend.
//! - [`MetadataStore`] is the transactional engine layered on top: it keeps a
//!   write-back buffer of committed-but-unflushed entries (the *dirty* set),
//!   a bounded LRU cache of clean entries, and a set of *pinned* keys that
//!   are never evicted (the system segment records are pinned during
//!   bootstrap so recovery state always stays resident).
//!
//! ## Transactions
//!
//! The only unit of work is a [`MetadataTransaction`]:
//!
//! ```ignore
//! let mut tx = store.begin();
//! let seg = tx.get_for_modification("orders").await?; // acquires write intent
//! // ... mutate ...
//! tx.update(StorageRecord::Segment(seg));
//! tx.commit().await?; // atomic; VersionConflict if someone else committed first
//! ```
//!
//! Conflict detection is optimistic-versioned: every entry carries a version
//! number bumped on commit. `commit()` re-checks the version of every key the
//! transaction acquired (via `get_for_modification`, `create`, `update` or
//! `delete`) and fails with [`MetadataError::VersionConflict`] if any moved,
//! in which case the caller retries its whole operation. Plain `get()` takes
//! no intent and is never validated, so long-running readers don't conflict.
//!
//! ## Durability
//!
//! Committed entries land in the dirty buffer and survive cache eviction
//! unconditionally; `flush()` pushes them to the backend. Eviction only ever
//! removes clean, unpinned entries.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{MetadataError, Result};
use crate::types::{SegmentMetadata, StorageRecord};

/// Default capacity of the clean-entry cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// A record value together with its commit version. `value: None` is a
/// tombstone left behind by a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Option<StorageRecord>,
}

/// Persistence seam for the metadata store.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Atomically persist a batch of entries.
    async fn write_all(&self, entries: Vec<(String, VersionedValue)>) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory [`KeyValueStorage`] backend.
#[derive(Default)]
pub struct InMemoryKeyValueStorage {
    entries: RwLock<HashMap<String, VersionedValue>>,
}

impl InMemoryKeyValueStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for InMemoryKeyValueStorage {
    async fn read(&self, key: &str) -> Result<Option<VersionedValue>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write_all(&self, entries: Vec<(String, VersionedValue)>) -> Result<()> {
        let mut map = self.entries.write().await;
        for (key, value) in entries {
            map.insert(key, value);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

struct CacheState {
    /// Committed entries not yet flushed to the backend. Never evicted.
    dirty: HashMap<String, VersionedValue>,
    /// Clean entries for pinned keys. Never evicted.
    pinned: HashMap<String, VersionedValue>,
    /// Keys that must stay resident.
    pinned_keys: HashSet<String>,
    /// Bounded cache of clean, unpinned entries.
    cache: LruCache<String, VersionedValue>,
}

struct StoreInner {
    backend: Arc<dyn KeyValueStorage>,
    state: Mutex<CacheState>,
}

/// Transactional metadata store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<StoreInner>,
}

impl MetadataStore {
    pub fn new(backend: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_capacity(backend, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(backend: Arc<dyn KeyValueStorage>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(StoreInner {
                backend,
                state: Mutex::new(CacheState {
                    dirty: HashMap::new(),
                    pinned: HashMap::new(),
                    pinned_keys: HashSet::new(),
                    cache: LruCache::new(capacity),
                }),
            }),
        }
    }

    /// Store backed by [`InMemoryKeyValueStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryKeyValueStorage::new()))
    }

    /// Resize the clean-entry cache. Excess clean entries are evicted;
    /// dirty and pinned entries are unaffected.
    pub async fn set_cache_capacity(&self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        self.inner.state.lock().await.cache.resize(capacity);
    }

    /// Begin a new transaction.
    pub fn begin(&self) -> MetadataTransaction {
        MetadataTransaction {
            store: self.clone(),
            read_versions: HashMap::new(),
            locked: HashSet::new(),
            writes: HashMap::new(),
        }
    }

    /// Pin a key so its entry is never evicted from memory.
    pub async fn pin(&self, key: &str) {
        let mut state = self.inner.state.lock().await;
        state.pinned_keys.insert(key.to_string());
        if let Some(entry) = state.cache.pop(key) {
            state.pinned.insert(key.to_string(), entry);
        }
    }

    pub async fn unpin(&self, key: &str) {
        let mut state = self.inner.state.lock().await;
        state.pinned_keys.remove(key);
        if let Some(entry) = state.pinned.remove(key) {
            state.cache.put(key.to_string(), entry);
        }
    }

    /// Push all dirty entries to the backend. On failure the dirty buffer is
    /// left intact for a later retry.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.dirty.is_empty() {
            return Ok(());
        }
        let entries: Vec<(String, VersionedValue)> = state
            .dirty
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let count = entries.len();
        self.inner.backend.write_all(entries).await?;
        let flushed: Vec<(String, VersionedValue)> = state.dirty.drain().collect();
        for (key, value) in flushed {
            if state.pinned_keys.contains(&key) {
                state.pinned.insert(key, value);
            } else {
                state.cache.put(key, value);
            }
        }
        debug!(flushed = count, "metadata store flushed");
        Ok(())
    }

    /// All live segment records.
    pub async fn list_segments(&self) -> Result<Vec<SegmentMetadata>> {
        let mut keys: HashSet<String> = self.inner.backend.keys().await?.into_iter().collect();
        {
            let state = self.inner.state.lock().await;
            keys.extend(state.dirty.keys().cloned());
            keys.extend(state.pinned.keys().cloned());
            keys.extend(state.cache.iter().map(|(k, _)| k.clone()));
        }
        let mut segments = Vec::new();
        for key in keys {
            if let Some(StorageRecord::Segment(seg)) = self.lookup(&key).await?.value {
                segments.push(seg);
            }
        }
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    /// Read the current versioned entry for `key`, faulting it into the
    /// cache from the backend if needed. Absent keys read as version 0.
    async fn lookup(&self, key: &str) -> Result<VersionedValue> {
        let mut state = self.inner.state.lock().await;
        if let Some(entry) = state.dirty.get(key) {
            return Ok(entry.clone());
        }
        if let Some(entry) = state.pinned.get(key) {
            return Ok(entry.clone());
        }
        if let Some(entry) = state.cache.get(key) {
            return Ok(entry.clone());
        }
        match self.inner.backend.read(key).await? {
            Some(entry) => {
                if state.pinned_keys.contains(key) {
                    state.pinned.insert(key.to_string(), entry.clone());
                } else {
                    state.cache.put(key.to_string(), entry.clone());
                }
                Ok(entry)
            }
            None => Ok(VersionedValue {
                version: 0,
                value: None,
            }),
        }
    }
}

/// A single unit of work against the [`MetadataStore`].
///
/// Dropping an uncommitted transaction aborts it; nothing is applied until
/// `commit()` returns `Ok`.
pub struct MetadataTransaction {
    store: MetadataStore,
    /// Version each key had when this transaction first read it (0 = absent).
    read_versions: HashMap<String, u64>,
    /// Keys acquired for modification; validated at commit.
    locked: HashSet<String>,
    /// Buffered writes (`None` = delete).
    writes: HashMap<String, Option<StorageRecord>>,
}

impl MetadataTransaction {
    /// Read a record without acquiring write intent.
    pub async fn get(&mut self, key: &str) -> Result<Option<StorageRecord>> {
        if let Some(value) = self.writes.get(key) {
            return Ok(value.clone());
        }
        let entry = self.store.lookup(key).await?;
        self.read_versions
            .entry(key.to_string())
            .or_insert(entry.version);
        Ok(entry.value)
    }

    /// Read a record and acquire write intent on it. The commit will fail
    /// with `VersionConflict` if another transaction mutates this key first.
    pub async fn get_for_modification(&mut self, key: &str) -> Result<Option<StorageRecord>> {
        let value = self.get(key).await?;
        self.locked.insert(key.to_string());
        Ok(value)
    }

    /// Buffer creation of a record. Fails immediately if this transaction can
    /// already see a live record under the same key.
    pub fn create(&mut self, record: StorageRecord) -> Result<()> {
        let key = record.key().to_string();
        if let Some(Some(_)) = self.writes.get(&key) {
            return Err(MetadataError::KeyExists(key));
        }
        self.read_versions.entry(key.clone()).or_insert(0);
        self.locked.insert(key.clone());
        self.writes.insert(key, Some(record));
        Ok(())
    }

    /// Buffer an update of a record.
    pub fn update(&mut self, record: StorageRecord) {
        let key = record.key().to_string();
        self.read_versions.entry(key.clone()).or_insert(0);
        self.locked.insert(key.clone());
        self.writes.insert(key, Some(record));
    }

    /// Buffer deletion of a record.
    pub fn delete(&mut self, key: &str) {
        self.read_versions.entry(key.to_string()).or_insert(0);
        self.locked.insert(key.to_string());
        self.writes.insert(key.to_string(), None);
    }

    /// Atomically validate and apply all buffered writes.
    pub async fn commit(self) -> Result<()> {
        let inner = &self.store.inner;
        let mut state = inner.state.lock().await;

        // Validate every key this transaction acquired.
        for key in &self.locked {
            let current = if let Some(entry) = state.dirty.get(key) {
                entry.version
            } else if let Some(entry) = state.pinned.get(key) {
                entry.version
            } else if let Some(entry) = state.cache.peek(key) {
                entry.version
            } else {
                inner.backend.read(key).await?.map_or(0, |e| e.version)
            };
            let expected = self.read_versions.get(key).copied().unwrap_or(0);
            if current != expected {
                return Err(MetadataError::VersionConflict(key.clone()));
            }
        }

        // Apply: bump versions, land everything in the dirty buffer.
        let count = self.writes.len();
        for (key, value) in self.writes {
            let version = self.read_versions.get(&key).copied().unwrap_or(0) + 1;
            state.cache.pop(&key);
            state.pinned.remove(&key);
            state.dirty.insert(key, VersionedValue { version, value });
        }
        debug!(keys = count, "metadata transaction committed");
        Ok(())
    }

    /// Discard all buffered writes.
    pub fn abort(self) {}
}
