//! Chunk Manager
//!
//! The segment → chunk mapping engine: translates the segment-level
//! append/read/truncate API into chunk-level operations against a
//! [`ChunkStorage`] backend, with all layout state kept in the transactional
//! metadata store.
//!
//! ## Architecture
//!
//! ```text
//! Container
//!     │ create / openWrite / write / read / truncate / seal / concat / delete
//!     ▼
//! ChunkManager ──────────► SystemJournal (system segments only)
//!     │                         │ record batches, snapshots
//!     ▼                         ▼
//! MetadataStore            ChunkStorage
//! (segment + chunk           (blobs)
//!  records)
//! ```
//!
//! ## Lifecycle
//!
//! `ChunkManager::new` → `initialize(epoch)` → `bootstrap(container_id,
//! metadata_store)`. Bootstrap hands over to [`SystemJournal::bootstrap`],
//! which rebuilds the system segments' layout from chunk storage into the
//! supplied (fresh) metadata store; after that the manager serves segments
//! normally. Every structural change to a *system* segment additionally
//! appends one journal batch **before** its metadata transaction commits.
//!
//! ## Concurrency
//!
//! Operations on the same segment serialize through the per-segment write
//! intent taken in the metadata transaction; different segments proceed in
//! parallel. Readers take no intent and observe either the pre-write or the
//! post-write layout atomically, because chunks become visible only at
//! transaction commit. Version conflicts retry with bounded backoff.
//!
//! ## Fencing
//!
//! The epoch is fixed at `initialize` time. Mutating operations re-check the
//! segment's stored owner epoch inside the transaction and fail with
//! `StorageNotPrimary` on mismatch. A takeover (`open_write` at a newer
//! epoch, or journal bootstrap) flags the segment ownership-changed, which
//! forces the next write into a fresh chunk — a zombie still appending to
//! the old tail chunk can never interleave with the new owner's bytes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::RwLock;
use tracing::{debug, info};

use chunkhouse_metadata::{
    ChunkMetadata, MetadataStore, MetadataTransaction, SegmentMetadata, StorageRecord,
};

use crate::config::ChunkManagerConfig;
use crate::error::{ChunkError, Result};
use crate::garbage::GarbageCollector;
use crate::journal::SystemJournal;
use crate::naming;
use crate::provider::{ChunkHandle, ChunkStorage};
use crate::records::{ChunkAddedRecord, SystemJournalRecord, TruncationRecord};
use crate::rolling::{plan_write, SegmentRollingPolicy, WriteSlice};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to an open segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHandle {
    pub segment_name: String,
    pub read_only: bool,
}

impl SegmentHandle {
    pub fn writable(segment_name: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            read_only: false,
        }
    }

    pub fn read_only(segment_name: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            read_only: true,
        }
    }
}

#[derive(Clone)]
struct Ready {
    metadata: MetadataStore,
    journal: Arc<SystemJournal>,
    garbage: Arc<GarbageCollector>,
}

/// Segment API over chunk storage.
pub struct ChunkManager {
    chunk_storage: Arc<dyn ChunkStorage>,
    config: ChunkManagerConfig,
    epoch: AtomicU64,
    ready: RwLock<Option<Ready>>,
}

impl ChunkManager {
    pub fn new(chunk_storage: Arc<dyn ChunkStorage>, config: ChunkManagerConfig) -> Self {
        Self {
            chunk_storage,
            config,
            epoch: AtomicU64::new(0),
            ready: RwLock::new(None),
        }
    }

    /// Fix this instance's epoch. Must be called exactly once, with an epoch
    /// greater than zero, before `bootstrap`.
    pub fn initialize(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ChunkManagerConfig {
        &self.config
    }

    pub fn chunk_storage(&self) -> Arc<dyn ChunkStorage> {
        self.chunk_storage.clone()
    }

    pub async fn system_journal(&self) -> Option<Arc<SystemJournal>> {
        self.ready.read().await.as_ref().map(|r| r.journal.clone())
    }

    pub async fn metadata_store(&self) -> Option<MetadataStore> {
        self.ready.read().await.as_ref().map(|r| r.metadata.clone())
    }

    pub async fn garbage_collector(&self) -> Option<Arc<GarbageCollector>> {
        self.ready.read().await.as_ref().map(|r| r.garbage.clone())
    }

    /// Recover the system segments for `container_id` into `metadata` and
    /// mark this manager ready to serve segments.
    pub async fn bootstrap(&self, container_id: u32, metadata: MetadataStore) -> Result<()> {
        let epoch = self.epoch();
        if epoch == 0 {
            return Err(ChunkError::BootstrapFailed(
                "initialize(epoch) must be called before bootstrap".to_string(),
            ));
        }
        metadata.set_cache_capacity(self.config.max_indexed_segments).await;

        let journal = Arc::new(SystemJournal::new(
            container_id,
            epoch,
            self.chunk_storage.clone(),
            metadata.clone(),
            self.config.clone(),
        ));
        let stale = journal.bootstrap().await?;

        let garbage = Arc::new(GarbageCollector::new(
            self.chunk_storage.clone(),
            metadata.clone(),
            self.config.garbage_collection_delay,
        ));
        garbage.schedule(stale).await;

        *self.ready.write().await = Some(Ready {
            metadata,
            journal,
            garbage,
        });
        info!(container = container_id, epoch, "chunk manager ready");
        Ok(())
    }

    /// Create a new empty segment with the given rolling policy.
    pub async fn create(
        &self,
        segment_name: &str,
        policy: SegmentRollingPolicy,
    ) -> Result<SegmentHandle> {
        let ready = self.ready().await?;
        let epoch = self.epoch();
        self.with_deadline(async {
            let mut attempt = 0;
            loop {
                let result = self.try_create(&ready, epoch, segment_name, policy).await;
                match self.retry_or_return(result, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        })
        .await
    }

    /// Open a segment for writing, fencing out older owners. Taking over a
    /// segment from an older epoch flags it ownership-changed.
    pub async fn open_write(&self, segment_name: &str) -> Result<SegmentHandle> {
        let ready = self.ready().await?;
        let epoch = self.epoch();
        self.with_deadline(async {
            let mut attempt = 0;
            loop {
                let result = self.try_open_write(&ready, epoch, segment_name).await;
                match self.retry_or_return(result, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        })
        .await
    }

    /// Open a segment for reading; no fencing.
    pub async fn open_read(&self, segment_name: &str) -> Result<SegmentHandle> {
        let ready = self.ready().await?;
        self.with_deadline(async {
            let mut tx = ready.metadata.begin();
            require_segment(&mut tx, segment_name).await?;
            Ok(SegmentHandle::read_only(segment_name))
        })
        .await
    }

    /// Strictly-appending write at `offset == segment.length`.
    pub async fn write(&self, handle: &SegmentHandle, offset: u64, data: &[u8]) -> Result<()> {
        let ready = self.ready().await?;
        let epoch = self.epoch();
        self.with_deadline(async {
            let mut attempt = 0;
            loop {
                let result = self.try_write(&ready, epoch, handle, offset, data).await;
                match self.retry_or_return(result, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        })
        .await
    }

    /// Read `length` bytes at `offset`, assembling across chunk boundaries.
    pub async fn read(&self, handle: &SegmentHandle, offset: u64, length: u64) -> Result<Bytes> {
        let ready = self.ready().await?;
        self.with_deadline(self.do_read(&ready, &handle.segment_name, offset, length))
            .await
    }

    /// Advance the segment's start offset; chunks wholly below it are
    /// unlinked and scheduled for deletion.
    pub async fn truncate(&self, handle: &SegmentHandle, new_start_offset: u64) -> Result<()> {
        let ready = self.ready().await?;
        let epoch = self.epoch();
        self.with_deadline(async {
            let mut attempt = 0;
            loop {
                let result = self
                    .try_truncate(&ready, epoch, handle, new_start_offset)
                    .await;
                match self.retry_or_return(result, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        })
        .await
    }

    /// Seal a segment against further writes and truncates.
    pub async fn seal(&self, handle: &SegmentHandle) -> Result<()> {
        let ready = self.ready().await?;
        let epoch = self.epoch();
        self.with_deadline(async {
            let mut attempt = 0;
            loop {
                let result = self.try_seal(&ready, epoch, handle).await;
                match self.retry_or_return(result, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        })
        .await
    }

    /// Append all remaining bytes of the sealed segment `source_name` onto
    /// `target` at `target_offset == target.length`, then remove the source.
    ///
    /// When the backend supports concat, the target's tail chunk is full and
    /// the source is large enough and untruncated, the source chunks are
    /// re-linked verbatim; otherwise the bytes are re-copied through the
    /// normal write path.
    pub async fn concat(
        &self,
        target: &SegmentHandle,
        target_offset: u64,
        source_name: &str,
    ) -> Result<()> {
        let ready = self.ready().await?;
        let epoch = self.epoch();
        self.with_deadline(async {
            let copy_plan = {
                let mut attempt = 0;
                loop {
                    let result = self
                        .try_relink_concat(&ready, epoch, target, target_offset, source_name)
                        .await;
                    match self.retry_or_return(result, &mut attempt).await {
                        Some(result) => break result?,
                        None => continue,
                    }
                }
            };

            let (source_start, source_length) = match copy_plan {
                None => return Ok(()), // relinked (or empty source removed)
                Some(plan) => plan,
            };

            let data = self
                .do_read(&ready, source_name, source_start, source_length)
                .await?;
            self.write(target, target_offset, &data).await?;
            let source_handle = self.open_write(source_name).await?;
            self.delete(&source_handle).await
        })
        .await
    }

    /// Remove a segment and schedule deletion of all its chunks.
    pub async fn delete(&self, handle: &SegmentHandle) -> Result<()> {
        let ready = self.ready().await?;
        let epoch = self.epoch();
        self.with_deadline(async {
            let mut attempt = 0;
            loop {
                let result = self.try_delete(&ready, epoch, handle).await;
                match self.retry_or_return(result, &mut attempt).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        })
        .await
    }

    /// Current metadata for a segment.
    pub async fn get_segment_info(&self, segment_name: &str) -> Result<SegmentMetadata> {
        let ready = self.ready().await?;
        self.with_deadline(async {
            let mut tx = ready.metadata.begin();
            require_segment(&mut tx, segment_name).await
        })
        .await
    }

    /// All live segments, system segments included.
    pub async fn list_segments(&self) -> Result<Vec<SegmentMetadata>> {
        let ready = self.ready().await?;
        self.with_deadline(async { Ok(ready.metadata.list_segments().await?) })
            .await
    }

    // ------------------------------------------------------------------
    // Single attempts (retried on metadata version conflicts)
    // ------------------------------------------------------------------

    async fn try_create(
        &self,
        ready: &Ready,
        epoch: u64,
        segment_name: &str,
        policy: SegmentRollingPolicy,
    ) -> Result<SegmentHandle> {
        let mut tx = ready.metadata.begin();
        if tx.get(segment_name).await?.is_some() {
            return Err(ChunkError::SegmentExists(segment_name.to_string()));
        }
        let mut segment = SegmentMetadata::new(segment_name, policy.max_length, epoch);
        segment.last_modified = now_ms();
        tx.create(StorageRecord::Segment(segment))?;
        tx.commit().await?;
        debug!(segment = segment_name, epoch, "segment created");
        Ok(SegmentHandle::writable(segment_name))
    }

    async fn try_open_write(
        &self,
        ready: &Ready,
        epoch: u64,
        segment_name: &str,
    ) -> Result<SegmentHandle> {
        let mut tx = ready.metadata.begin();
        let mut segment = require_segment_for_modification(&mut tx, segment_name).await?;
        if segment.owner_epoch > epoch {
            return Err(ChunkError::StorageNotPrimary {
                segment: segment_name.to_string(),
                owner_epoch: segment.owner_epoch,
                current_epoch: epoch,
            });
        }
        if segment.owner_epoch < epoch {
            segment.owner_epoch = epoch;
            segment.set_ownership_changed(true);
            segment.last_modified = now_ms();
            tx.update(StorageRecord::Segment(segment));
            tx.commit().await?;
            debug!(segment = segment_name, epoch, "segment ownership taken");
        }
        Ok(SegmentHandle::writable(segment_name))
    }

    async fn try_write(
        &self,
        ready: &Ready,
        epoch: u64,
        handle: &SegmentHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        if handle.read_only {
            return Err(ChunkError::InvalidHandle(handle.segment_name.clone()));
        }
        let mut tx = ready.metadata.begin();
        let mut segment = require_segment_for_modification(&mut tx, &handle.segment_name).await?;
        if segment.is_sealed() {
            return Err(ChunkError::SegmentSealed(segment.name));
        }
        check_fence(&segment, epoch)?;
        if offset != segment.length {
            return Err(ChunkError::BadOffset {
                segment: segment.name,
                offset,
                expected: segment.length,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let can_extend = self.chunk_storage.supports_append() && !segment.is_ownership_changed();
        let last_chunk_length = segment
            .last_chunk
            .as_ref()
            .map(|_| segment.length - segment.last_chunk_start_offset);
        let slices = plan_write(
            SegmentRollingPolicy::new(segment.max_rolling_length),
            self.config.max_chunk_size,
            last_chunk_length,
            can_extend,
            data.len() as u64,
        );

        let mut tail_chunk = match &segment.last_chunk {
            Some(name) => match tx.get_for_modification(name).await? {
                Some(StorageRecord::Chunk(chunk)) => Some(chunk),
                _ => return Err(ChunkError::ChunkNotFound(name.clone())),
            },
            None => None,
        };

        let mut created = Vec::new();
        let mut new_chunks = Vec::new();
        let mut journal_records = Vec::new();
        if let Err(e) = self
            .execute_slices(
                epoch,
                &mut segment,
                &mut tail_chunk,
                &mut new_chunks,
                &mut journal_records,
                &mut created,
                &slices,
                data,
            )
            .await
        {
            // No partial linking: the transaction dies with us, and the
            // chunks we created become sweepable orphans.
            ready.garbage.schedule(created).await;
            return Err(e);
        }

        if ready.journal.is_system_segment(&segment.name) && !journal_records.is_empty() {
            if let Err(e) = ready.journal.commit_records(journal_records).await {
                ready.garbage.schedule(created).await;
                return Err(e);
            }
        }

        if let Some(chunk) = tail_chunk {
            tx.update(StorageRecord::Chunk(chunk));
        }
        for chunk in new_chunks {
            tx.create(StorageRecord::Chunk(chunk))?;
        }
        segment.set_ownership_changed(false);
        segment.last_modified = now_ms();
        tx.update(StorageRecord::Segment(segment));
        if let Err(e) = tx.commit().await {
            ready.garbage.schedule(created).await;
            return Err(e.into());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_slices(
        &self,
        epoch: u64,
        segment: &mut SegmentMetadata,
        tail_chunk: &mut Option<ChunkMetadata>,
        new_chunks: &mut Vec<ChunkMetadata>,
        journal_records: &mut Vec<SystemJournalRecord>,
        created: &mut Vec<String>,
        slices: &[WriteSlice],
        data: &[u8],
    ) -> Result<()> {
        let mut cursor = 0usize;
        for slice in slices {
            let len = slice.length() as usize;
            let piece = &data[cursor..cursor + len];
            match slice {
                WriteSlice::ExtendLast { .. } => {
                    let chunk = match tail_chunk.as_mut() {
                        Some(chunk) => chunk,
                        None => {
                            return Err(ChunkError::ChunkStorageFailure(
                                "write planned a tail extension without a tail chunk".to_string(),
                            ))
                        }
                    };
                    self.chunk_storage
                        .write(&ChunkHandle::writable(&chunk.name), chunk.length, piece)
                        .await?;
                    chunk.length += len as u64;
                    segment.length += len as u64;
                }
                WriteSlice::NewChunk { .. } => {
                    let name = naming::data_chunk_name(&segment.name, epoch);
                    let handle = self.chunk_storage.create(&name).await?;
                    created.push(name.clone());
                    self.chunk_storage.write(&handle, 0, piece).await?;

                    let offset_in_segment = segment.length;
                    journal_records.push(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                        segment_name: segment.name.clone(),
                        offset: offset_in_segment,
                        new_chunk_name: name.clone(),
                        old_chunk_name: segment.last_chunk.clone(),
                    }));

                    if let Some(previous) = new_chunks.last_mut() {
                        previous.next_chunk = Some(name.clone());
                    } else if let Some(tail) = tail_chunk.as_mut() {
                        tail.next_chunk = Some(name.clone());
                    } else {
                        segment.first_chunk = Some(name.clone());
                        segment.first_chunk_start_offset = offset_in_segment;
                    }
                    new_chunks.push(ChunkMetadata::new(name.clone(), len as u64));
                    segment.last_chunk = Some(name);
                    segment.last_chunk_start_offset = offset_in_segment;
                    segment.chunk_count += 1;
                    segment.length += len as u64;
                }
            }
            cursor += len;
        }
        Ok(())
    }

    async fn do_read(
        &self,
        ready: &Ready,
        segment_name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let mut tx = ready.metadata.begin();
        let segment = require_segment(&mut tx, segment_name).await?;
        let end = offset.checked_add(length).ok_or(ChunkError::OutOfBounds {
            target: segment_name.to_string(),
            offset,
            length,
        })?;
        if offset < segment.start_offset || end > segment.length {
            return Err(ChunkError::OutOfBounds {
                target: segment_name.to_string(),
                offset,
                length,
            });
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity(length as usize);
        let mut cursor = segment.first_chunk.clone();
        let mut chunk_start = segment.first_chunk_start_offset;
        let mut position = offset;
        let mut remaining = length;
        while remaining > 0 {
            let chunk_name = match cursor {
                Some(name) => name,
                None => {
                    return Err(ChunkError::ChunkStorageFailure(format!(
                        "chunk chain of {segment_name} ended before offset {position}"
                    )))
                }
            };
            let chunk = match tx.get(&chunk_name).await? {
                Some(StorageRecord::Chunk(chunk)) => chunk,
                _ => return Err(ChunkError::ChunkNotFound(chunk_name)),
            };
            let chunk_end = chunk_start + chunk.length;
            if chunk_end <= position {
                chunk_start = chunk_end;
                cursor = chunk.next_chunk;
                continue;
            }
            let start_in_chunk = position - chunk_start;
            let take = (chunk.length - start_in_chunk).min(remaining);
            let bytes = self.chunk_storage.read(&chunk.name, start_in_chunk, take).await?;
            out.extend_from_slice(&bytes);
            position += take;
            remaining -= take;
            chunk_start = chunk_end;
            cursor = chunk.next_chunk;
        }
        Ok(out.freeze())
    }

    async fn try_truncate(
        &self,
        ready: &Ready,
        epoch: u64,
        handle: &SegmentHandle,
        new_start_offset: u64,
    ) -> Result<()> {
        if handle.read_only {
            return Err(ChunkError::InvalidHandle(handle.segment_name.clone()));
        }
        let mut tx = ready.metadata.begin();
        let mut segment = require_segment_for_modification(&mut tx, &handle.segment_name).await?;
        if segment.is_sealed() {
            return Err(ChunkError::SegmentSealed(segment.name));
        }
        check_fence(&segment, epoch)?;
        if new_start_offset < segment.start_offset || new_start_offset > segment.length {
            return Err(ChunkError::BadOffset {
                segment: segment.name,
                offset: new_start_offset,
                expected: segment.start_offset,
            });
        }
        if new_start_offset == segment.start_offset {
            return Ok(());
        }

        // Walk off every chunk whose exclusive end sits at or below the new
        // start offset.
        let mut removed = Vec::new();
        let mut cursor = segment.first_chunk.clone();
        let mut chunk_start = segment.first_chunk_start_offset;
        while let Some(current) = cursor.clone() {
            let chunk = match tx.get(&current).await? {
                Some(StorageRecord::Chunk(chunk)) => chunk,
                _ => return Err(ChunkError::ChunkNotFound(current)),
            };
            if chunk_start + chunk.length > new_start_offset {
                break;
            }
            chunk_start += chunk.length;
            cursor = chunk.next_chunk;
            removed.push(current);
        }

        let record = match &cursor {
            Some(first) => {
                segment.first_chunk = Some(first.clone());
                segment.first_chunk_start_offset = chunk_start;
                TruncationRecord {
                    segment_name: segment.name.clone(),
                    offset: new_start_offset,
                    first_chunk_name: Some(first.clone()),
                    start_offset: chunk_start,
                }
            }
            None => {
                // Everything truncated away.
                segment.first_chunk = None;
                segment.last_chunk = None;
                segment.first_chunk_start_offset = segment.length;
                segment.last_chunk_start_offset = segment.length;
                TruncationRecord {
                    segment_name: segment.name.clone(),
                    offset: new_start_offset,
                    first_chunk_name: None,
                    start_offset: segment.length,
                }
            }
        };
        segment.chunk_count -= removed.len() as u32;
        segment.start_offset = new_start_offset;
        segment.last_modified = now_ms();

        if ready.journal.is_system_segment(&segment.name) {
            ready
                .journal
                .commit_record(SystemJournalRecord::Truncation(record))
                .await?;
        }
        for chunk_name in &removed {
            tx.delete(chunk_name);
        }
        tx.update(StorageRecord::Segment(segment));
        tx.commit().await?;

        // Only now are the unlinked chunks safe to reclaim.
        ready.garbage.schedule(removed).await;
        Ok(())
    }

    async fn try_seal(&self, ready: &Ready, epoch: u64, handle: &SegmentHandle) -> Result<()> {
        if handle.read_only {
            return Err(ChunkError::InvalidHandle(handle.segment_name.clone()));
        }
        let mut tx = ready.metadata.begin();
        let mut segment = require_segment_for_modification(&mut tx, &handle.segment_name).await?;
        check_fence(&segment, epoch)?;
        if segment.is_sealed() {
            return Ok(());
        }
        segment.set_sealed(true);
        segment.last_modified = now_ms();
        tx.update(StorageRecord::Segment(segment));
        tx.commit().await?;
        Ok(())
    }

    /// Attempt the metadata-only relink concat. Returns `None` when the
    /// concat completed (relinked, or empty source deleted), or
    /// `Some((start, length))` describing the byte range the caller must
    /// copy instead.
    async fn try_relink_concat(
        &self,
        ready: &Ready,
        epoch: u64,
        target_handle: &SegmentHandle,
        target_offset: u64,
        source_name: &str,
    ) -> Result<Option<(u64, u64)>> {
        if target_handle.read_only {
            return Err(ChunkError::InvalidHandle(target_handle.segment_name.clone()));
        }
        let mut tx = ready.metadata.begin();
        let mut target =
            require_segment_for_modification(&mut tx, &target_handle.segment_name).await?;
        if target.is_sealed() {
            return Err(ChunkError::SegmentSealed(target.name));
        }
        check_fence(&target, epoch)?;
        if target_offset != target.length {
            return Err(ChunkError::BadOffset {
                segment: target.name,
                offset: target_offset,
                expected: target.length,
            });
        }
        let source = require_segment_for_modification(&mut tx, source_name).await?;
        if !source.is_sealed() {
            return Err(ChunkError::SegmentNotSealed(source_name.to_string()));
        }
        let remaining = source.length - source.start_offset;
        if remaining == 0 {
            // Nothing to move; drop the source in place.
            let mut chunks = Vec::new();
            let mut cursor = source.first_chunk.clone();
            while let Some(current) = cursor {
                cursor = match tx.get(&current).await? {
                    Some(StorageRecord::Chunk(chunk)) => chunk.next_chunk,
                    _ => None,
                };
                tx.delete(&current);
                chunks.push(current);
            }
            tx.delete(source_name);
            tx.commit().await?;
            ready.garbage.schedule(chunks).await;
            return Ok(None);
        }

        let tail_is_full = match &target.last_chunk {
            Some(_) => target.length - target.last_chunk_start_offset >= target.max_rolling_length,
            None => true,
        };
        let relinkable = self.chunk_storage.supports_concat()
            && tail_is_full
            && source.start_offset == 0
            && source.first_chunk_start_offset == 0
            && remaining >= self.config.min_size_for_concat
            && source.chunk_count > 0;
        if !relinkable {
            return Ok(Some((source.start_offset, remaining)));
        }

        // Collect the source chain in order for linking and journaling.
        let mut source_chunks = Vec::new();
        let mut cursor = source.first_chunk.clone();
        while let Some(current) = cursor {
            let chunk = match tx.get(&current).await? {
                Some(StorageRecord::Chunk(chunk)) => chunk,
                _ => return Err(ChunkError::ChunkNotFound(current)),
            };
            cursor = chunk.next_chunk.clone();
            source_chunks.push(chunk);
        }

        let mut journal_records = Vec::new();
        let mut offset_in_target = target.length;
        let mut previous = target.last_chunk.clone();
        for chunk in &source_chunks {
            journal_records.push(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                segment_name: target.name.clone(),
                offset: offset_in_target,
                new_chunk_name: chunk.name.clone(),
                old_chunk_name: previous.clone(),
            }));
            previous = Some(chunk.name.clone());
            offset_in_target += chunk.length;
        }

        let first_source = match source_chunks.first() {
            Some(chunk) => chunk.name.clone(),
            None => return Ok(Some((source.start_offset, remaining))),
        };
        match &target.last_chunk {
            Some(tail_name) => {
                let mut tail = match tx.get_for_modification(tail_name).await? {
                    Some(StorageRecord::Chunk(chunk)) => chunk,
                    _ => return Err(ChunkError::ChunkNotFound(tail_name.clone())),
                };
                tail.next_chunk = Some(first_source);
                tx.update(StorageRecord::Chunk(tail));
            }
            None => {
                target.first_chunk = Some(first_source);
                target.first_chunk_start_offset = target.length;
            }
        }
        target.last_chunk_start_offset = target.length + source.last_chunk_start_offset;
        target.last_chunk = source.last_chunk.clone();
        target.chunk_count += source.chunk_count;
        target.length += source.length;
        target.last_modified = now_ms();

        if ready.journal.is_system_segment(&target.name) {
            ready.journal.commit_records(journal_records).await?;
        }
        tx.delete(source_name);
        tx.update(StorageRecord::Segment(target));
        tx.commit().await?;
        debug!(
            target = %target_handle.segment_name,
            source = source_name,
            chunks = source_chunks.len(),
            "concat relinked source chunks"
        );
        Ok(None)
    }

    async fn try_delete(&self, ready: &Ready, epoch: u64, handle: &SegmentHandle) -> Result<()> {
        if handle.read_only {
            return Err(ChunkError::InvalidHandle(handle.segment_name.clone()));
        }
        let mut tx = ready.metadata.begin();
        let segment = require_segment_for_modification(&mut tx, &handle.segment_name).await?;
        check_fence(&segment, epoch)?;

        let mut chunks = Vec::new();
        let mut cursor = segment.first_chunk.clone();
        while let Some(current) = cursor {
            cursor = match tx.get(&current).await? {
                Some(StorageRecord::Chunk(chunk)) => chunk.next_chunk,
                _ => None,
            };
            tx.delete(&current);
            chunks.push(current);
        }
        tx.delete(&handle.segment_name);
        tx.commit().await?;

        ready.garbage.schedule(chunks).await;
        debug!(segment = %handle.segment_name, "segment deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn ready(&self) -> Result<Ready> {
        self.ready
            .read()
            .await
            .clone()
            .ok_or(ChunkError::NotReady)
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.operation_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(ChunkError::OperationTimeout),
            },
            None => fut.await,
        }
    }

    /// `Some(result)` ends the retry loop; `None` means sleep already done,
    /// go again.
    async fn retry_or_return<T>(
        &self,
        result: Result<T>,
        attempt: &mut u32,
    ) -> Option<Result<T>> {
        match result {
            Err(e) if e.is_retryable() && *attempt < self.config.max_metadata_retries => {
                *attempt += 1;
                debug!(attempt = *attempt, error = %e, "retrying after metadata conflict");
                tokio::time::sleep(self.config.retry_backoff * *attempt).await;
                None
            }
            result => Some(result),
        }
    }
}

fn check_fence(segment: &SegmentMetadata, epoch: u64) -> Result<()> {
    if segment.owner_epoch != epoch {
        return Err(ChunkError::StorageNotPrimary {
            segment: segment.name.clone(),
            owner_epoch: segment.owner_epoch,
            current_epoch: epoch,
        });
    }
    Ok(())
}

async fn require_segment(
    tx: &mut MetadataTransaction,
    segment_name: &str,
) -> Result<SegmentMetadata> {
    match tx.get(segment_name).await? {
        Some(StorageRecord::Segment(segment)) => Ok(segment),
        _ => Err(ChunkError::SegmentNotFound(segment_name.to_string())),
    }
}

async fn require_segment_for_modification(
    tx: &mut MetadataTransaction,
    segment_name: &str,
) -> Result<SegmentMetadata> {
    match tx.get_for_modification(segment_name).await? {
        Some(StorageRecord::Segment(segment)) => Ok(segment),
        _ => Err(ChunkError::SegmentNotFound(segment_name.to_string())),
    }
}
