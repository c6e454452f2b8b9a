//! System Journal
//!
//! Write-ahead log and snapshot engine for the *system* segments — the
//! segments that hold the metadata of all other segments. Their layout must
//! be reconstructible from chunk storage alone, because after an unclean
//! failover neither the metadata store nor any in-memory state is trusted,
//! and the previous owner may still be alive writing garbage into both the
//! data chunks and the journal (a *zombie*).
//!
//! ## How It Works
//!
//! Every structural change to a system segment (chunk added, truncation)
//! appends exactly one [`SystemJournalRecordBatch`] to the journal **before**
//! the owning metadata transaction commits. Journal files and snapshots are
//! plain chunks named by `(container, epoch, file, batch)`, so recovery can
//! enumerate everything with a prefix listing.
//!
//! ## Epoch Fencing During Recovery
//!
//! `bootstrap()` rebuilds the system segments as of the last durable state:
//!
//! 1. Pick the newest decodable snapshot with `epoch < current_epoch` whose
//!    referenced chunks all still exist (older candidates are fallbacks).
//! 2. Replay batches with `snapshot_epoch <= epoch < current_epoch` in
//!    `(epoch, file, batch)` order. A record only applies if it extends the
//!    chain exactly where the chain currently ends — a zombie's records
//!    describe a diverged chain and simply never match, which is the entire
//!    fencing mechanism. A batch that fails to decode ends replay of its
//!    file.
//! 3. Commit the rebuilt metadata (one transaction per segment, records
//!    pinned), verify every referenced chunk exists in storage, write a
//!    fresh snapshot tagged with the current epoch, and open a new journal
//!    file.
//!
//! Anything tagged with an epoch >= the current epoch is ignored outright.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use chunkhouse_metadata::{ChunkMetadata, MetadataStore, SegmentMetadata, StorageRecord};

use crate::config::ChunkManagerConfig;
use crate::error::{ChunkError, Result};
use crate::naming;
use crate::provider::{ChunkHandle, ChunkStorage};
use crate::records::{
    ChunkAddedRecord, SegmentSnapshotRecord, SystemJournalRecord, SystemJournalRecordBatch,
    SystemSnapshotRecord, TruncationRecord,
};

/// Journal and snapshot engine for one container at one epoch.
pub struct SystemJournal {
    container_id: u32,
    epoch: u64,
    chunk_storage: Arc<dyn ChunkStorage>,
    metadata: MetadataStore,
    config: ChunkManagerConfig,
    system_segments: Vec<String>,
    writer: Mutex<WriterState>,
}

#[derive(Debug, Default)]
struct WriterState {
    /// Current journal file index; 0 until the first file is opened.
    file_index: u64,
    /// Next batch index within the current file.
    batch_index: u64,
    bytes_in_file: u64,
    records_since_snapshot: u64,
    /// Snapshots written by this instance.
    snapshot_index: u64,
}

/// In-memory layout of one segment while recovery replays the journal.
struct RecoveredSegment {
    segment: SegmentMetadata,
    chunks: HashMap<String, ChunkMetadata>,
}

impl SystemJournal {
    pub fn new(
        container_id: u32,
        epoch: u64,
        chunk_storage: Arc<dyn ChunkStorage>,
        metadata: MetadataStore,
        config: ChunkManagerConfig,
    ) -> Self {
        Self {
            container_id,
            epoch,
            chunk_storage,
            metadata,
            config,
            system_segments: naming::system_segments(container_id),
            writer: Mutex::new(WriterState::default()),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn container_id(&self) -> u32 {
        self.container_id
    }

    pub fn config(&self) -> &ChunkManagerConfig {
        &self.config
    }

    /// The canonical system segments this journal protects.
    pub fn system_segments(&self) -> &[String] {
        &self.system_segments
    }

    pub fn is_system_segment(&self, name: &str) -> bool {
        self.system_segments.iter().any(|s| s == name)
    }

    pub async fn current_file_index(&self) -> u64 {
        self.writer.lock().await.file_index
    }

    /// Durably append a single record as its own batch.
    pub async fn commit_record(&self, record: SystemJournalRecord) -> Result<()> {
        self.commit_records(vec![record]).await
    }

    /// Durably append one batch. Returns only after the batch is written to
    /// chunk storage; callers commit their metadata transaction afterwards,
    /// never before.
    pub async fn commit_records(&self, records: Vec<SystemJournalRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let count = records.len() as u64;
        let batch = SystemJournalRecordBatch::new(records);
        let encoded = batch.encode();

        let mut writer = self.writer.lock().await;
        if writer.file_index == 0 {
            writer.file_index = 1;
        }
        self.append_batch(&mut writer, &encoded).await?;
        writer.records_since_snapshot += count;

        if writer.bytes_in_file >= self.config.journal_max_file_size {
            self.start_new_file(&mut writer);
        }
        if writer.records_since_snapshot >= self.config.journal_snapshot_interval {
            // Cadence snapshots are an optimization; the journal itself is
            // already durable, so a failure here must not fail the caller.
            if let Err(e) = self.write_snapshot(&mut writer).await {
                warn!(error = %e, "periodic journal snapshot failed");
            }
        }
        Ok(())
    }

    async fn append_batch(&self, writer: &mut WriterState, encoded: &Bytes) -> Result<()> {
        let result = if self.chunk_storage.supports_append() {
            let name = naming::journal_file_name(self.container_id, self.epoch, writer.file_index);
            let offset = writer.bytes_in_file;
            let created = if offset == 0 {
                self.chunk_storage.create(&name).await.map(|_| ())
            } else {
                Ok(())
            };
            match created {
                Ok(()) => {
                    self.chunk_storage
                        .write(&ChunkHandle::writable(&name), offset, encoded)
                        .await
                }
                Err(e) => Err(e),
            }
        } else {
            let name = naming::journal_batch_name(
                self.container_id,
                self.epoch,
                writer.file_index,
                writer.batch_index,
            );
            match self.chunk_storage.create(&name).await {
                Ok(handle) => self.chunk_storage.write(&handle, 0, encoded).await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(_) => {
                writer.bytes_in_file += encoded.len() as u64;
                writer.batch_index += 1;
                debug!(
                    container = self.container_id,
                    epoch = self.epoch,
                    file = writer.file_index,
                    batch = writer.batch_index,
                    bytes = encoded.len(),
                    "journal batch appended"
                );
                Ok(())
            }
            Err(e) => Err(ChunkError::JournalWriteFailed(e.to_string())),
        }
    }

    fn start_new_file(&self, writer: &mut WriterState) {
        writer.file_index += 1;
        writer.bytes_in_file = 0;
        writer.batch_index = 0;
    }

    /// Write a full snapshot of the system segments as currently committed
    /// in the metadata store, then start a fresh journal file.
    async fn write_snapshot(&self, writer: &mut WriterState) -> Result<()> {
        let snapshot = self.collect_snapshot().await?;
        let encoded = snapshot.encode();
        let name =
            naming::snapshot_name(self.container_id, self.epoch, writer.snapshot_index + 1);
        let handle = self
            .chunk_storage
            .create(&name)
            .await
            .map_err(|e| ChunkError::JournalWriteFailed(e.to_string()))?;
        self.chunk_storage
            .write(&handle, 0, &encoded)
            .await
            .map_err(|e| ChunkError::JournalWriteFailed(e.to_string()))?;
        writer.snapshot_index += 1;
        writer.records_since_snapshot = 0;
        self.start_new_file(writer);
        info!(
            container = self.container_id,
            epoch = self.epoch,
            snapshot = %name,
            "system snapshot written"
        );
        Ok(())
    }

    async fn collect_snapshot(&self) -> Result<SystemSnapshotRecord> {
        let mut segments = Vec::new();
        let mut tx = self.metadata.begin();
        for name in &self.system_segments {
            let segment = match tx.get(name).await? {
                Some(StorageRecord::Segment(seg)) => seg,
                _ => continue,
            };
            let mut chunks = Vec::new();
            let mut cursor = segment.first_chunk.clone();
            while let Some(chunk_name) = cursor {
                match tx.get(&chunk_name).await? {
                    Some(StorageRecord::Chunk(chunk)) => {
                        cursor = chunk.next_chunk.clone();
                        chunks.push(chunk);
                    }
                    _ => {
                        return Err(ChunkError::JournalWriteFailed(format!(
                            "chunk record {chunk_name} missing while snapshotting {name}"
                        )))
                    }
                }
            }
            segments.push(SegmentSnapshotRecord { segment, chunks });
        }
        Ok(SystemSnapshotRecord {
            epoch: self.epoch,
            segments,
        })
    }

    /// Rebuild the system segments' metadata from chunk storage and seed the
    /// metadata store with it.
    ///
    /// Returns the journal/snapshot chunks that are superseded by the new
    /// snapshot and may be deleted once the configured garbage-collection
    /// delay has passed.
    pub async fn bootstrap(&self) -> Result<Vec<String>> {
        info!(
            container = self.container_id,
            epoch = self.epoch,
            "system journal bootstrap starting"
        );

        // Base state: the system segments are declared to exist, empty.
        let mut state: HashMap<String, RecoveredSegment> = self
            .system_segments
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    RecoveredSegment {
                        segment: SegmentMetadata::new(
                            name.clone(),
                            self.config.default_rolling_policy.max_length,
                            self.epoch,
                        ),
                        chunks: HashMap::new(),
                    },
                )
            })
            .collect();

        let snapshot_epoch = self.apply_latest_snapshot(&mut state).await?;
        self.replay_journal(&mut state, snapshot_epoch).await?;

        for recovered in state.values_mut() {
            recovered.segment.owner_epoch = self.epoch;
            recovered.segment.set_ownership_changed(true);
        }

        self.verify_recovered_state(&state).await?;
        self.commit_recovered_state(&state).await?;

        // Snapshot before acknowledging anything: once a write is accepted
        // at this epoch, its base state must be durable under this epoch.
        {
            let mut writer = self.writer.lock().await;
            self.write_snapshot(&mut writer).await?;
        }

        let stale = self.stale_chunks(snapshot_epoch).await?;
        info!(
            container = self.container_id,
            epoch = self.epoch,
            snapshot_epoch,
            stale_chunks = stale.len(),
            "system journal bootstrap complete"
        );
        Ok(stale)
    }

    /// Find, validate and apply the newest usable snapshot with an epoch
    /// strictly below ours. Returns the epoch replay should start from.
    async fn apply_latest_snapshot(
        &self,
        state: &mut HashMap<String, RecoveredSegment>,
    ) -> Result<u64> {
        let prefix = naming::snapshot_prefix(self.container_id);
        let mut candidates: Vec<(naming::SnapshotChunkName, String)> = Vec::new();
        for info in self.chunk_storage.list(&prefix).await? {
            if let Some(parsed) = naming::parse_snapshot_chunk(self.container_id, &info.name) {
                if parsed.epoch < self.epoch {
                    candidates.push((parsed, info.name));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (parsed, name) in candidates {
            let data = match self.read_chunk_fully(&name).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "snapshot unreadable, trying older");
                    continue;
                }
            };
            let snapshot = match SystemSnapshotRecord::decode(&data) {
                Some(snapshot) => snapshot,
                None => {
                    warn!(snapshot = %name, "snapshot corrupt, trying older");
                    continue;
                }
            };
            if !self.snapshot_chunks_exist(&snapshot).await? {
                warn!(snapshot = %name, "snapshot references missing chunks, trying older");
                continue;
            }
            for record in snapshot.segments {
                let recovered = RecoveredSegment {
                    chunks: record
                        .chunks
                        .into_iter()
                        .map(|c| (c.name.clone(), c))
                        .collect(),
                    segment: record.segment,
                };
                state.insert(recovered.segment.name.clone(), recovered);
            }
            debug!(snapshot = %name, epoch = parsed.epoch, "recovery starting from snapshot");
            return Ok(parsed.epoch);
        }
        Ok(0)
    }

    async fn snapshot_chunks_exist(&self, snapshot: &SystemSnapshotRecord) -> Result<bool> {
        for segment in &snapshot.segments {
            for chunk in &segment.chunks {
                match self.chunk_storage.get_info(&chunk.name).await? {
                    Some(info) if info.length >= chunk.length => {}
                    _ => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    async fn replay_journal(
        &self,
        state: &mut HashMap<String, RecoveredSegment>,
        snapshot_epoch: u64,
    ) -> Result<()> {
        let prefix = naming::journal_prefix(self.container_id);
        let mut chunks: Vec<(naming::JournalChunkName, String)> = Vec::new();
        for info in self.chunk_storage.list(&prefix).await? {
            if let Some(parsed) = naming::parse_journal_chunk(self.container_id, &info.name) {
                if parsed.epoch >= snapshot_epoch && parsed.epoch < self.epoch {
                    chunks.push((parsed, info.name));
                }
            }
        }
        // (epoch, file, batch) order; a plain file chunk sorts before any of
        // its per-batch siblings.
        chunks.sort();

        let mut skip_file: Option<(u64, u64)> = None;
        for (parsed, name) in chunks {
            let file_key = (parsed.epoch, parsed.file_index);
            if skip_file == Some(file_key) {
                continue;
            }
            let data = match self.read_chunk_fully(&name).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(chunk = %name, error = %e, "journal chunk unreadable, skipping file");
                    skip_file = Some(file_key);
                    continue;
                }
            };
            let mut offset = 0usize;
            while offset < data.len() {
                match SystemJournalRecordBatch::decode(&data[offset..]) {
                    Some((batch, consumed)) => {
                        offset += consumed;
                        for record in batch.records {
                            self.apply_record(state, &record).await;
                        }
                    }
                    None => {
                        // Truncated tail or zombie garbage: this file is done.
                        debug!(chunk = %name, offset, "undecodable batch ends file replay");
                        skip_file = Some(file_key);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_record(
        &self,
        state: &mut HashMap<String, RecoveredSegment>,
        record: &SystemJournalRecord,
    ) {
        match record {
            SystemJournalRecord::ChunkAdded(r) => self.apply_chunk_added(state, r).await,
            SystemJournalRecord::Truncation(r) => Self::apply_truncation(state, r),
        }
    }

    /// Link `new_chunk_name` if and only if the record describes the exact
    /// current end of the chain. Records from fenced-out writers describe a
    /// diverged chain and fall through to the skip path.
    async fn apply_chunk_added(
        &self,
        state: &mut HashMap<String, RecoveredSegment>,
        record: &ChunkAddedRecord,
    ) {
        let recovered = match state.get_mut(&record.segment_name) {
            Some(recovered) => recovered,
            None => {
                debug!(segment = %record.segment_name, "chunk-added for unknown segment skipped");
                return;
            }
        };
        let segment = &mut recovered.segment;
        let chain_matches = match (&record.old_chunk_name, &segment.last_chunk) {
            (None, None) => true,
            (Some(old), Some(last)) => old == last,
            _ => false,
        };
        if !chain_matches || record.offset != segment.length {
            debug!(
                segment = %record.segment_name,
                chunk = %record.new_chunk_name,
                offset = record.offset,
                length = segment.length,
                "stale chunk-added record skipped"
            );
            return;
        }
        if recovered.chunks.contains_key(&record.new_chunk_name) {
            debug!(chunk = %record.new_chunk_name, "duplicate chunk-added record skipped");
            return;
        }
        let length = match self.chunk_storage.get_info(&record.new_chunk_name).await {
            Ok(Some(info)) => info.length,
            _ => {
                warn!(
                    chunk = %record.new_chunk_name,
                    "added chunk missing from storage, record skipped"
                );
                return;
            }
        };

        if let Some(last) = &segment.last_chunk {
            if let Some(chunk) = recovered.chunks.get_mut(last) {
                chunk.next_chunk = Some(record.new_chunk_name.clone());
            }
        } else {
            segment.first_chunk = Some(record.new_chunk_name.clone());
            segment.first_chunk_start_offset = record.offset;
        }
        recovered.chunks.insert(
            record.new_chunk_name.clone(),
            ChunkMetadata::new(record.new_chunk_name.clone(), length),
        );
        segment.last_chunk = Some(record.new_chunk_name.clone());
        segment.last_chunk_start_offset = record.offset;
        segment.length = record.offset + length;
        segment.chunk_count += 1;
    }

    fn apply_truncation(state: &mut HashMap<String, RecoveredSegment>, record: &TruncationRecord) {
        let recovered = match state.get_mut(&record.segment_name) {
            Some(recovered) => recovered,
            None => return,
        };
        let segment = &mut recovered.segment;
        if record.offset < segment.start_offset || record.offset > segment.length {
            debug!(
                segment = %record.segment_name,
                offset = record.offset,
                "stale truncation record skipped"
            );
            return;
        }

        // Try to locate the named first chunk along the current chain.
        if let Some(first_name) = &record.first_chunk_name {
            if record.start_offset > record.offset {
                return;
            }
            let mut cursor = segment.first_chunk.clone();
            let mut cumulative = segment.first_chunk_start_offset;
            let mut dropped = Vec::new();
            let mut found = false;
            while let Some(current) = cursor {
                if &current == first_name {
                    found = cumulative == record.start_offset;
                    break;
                }
                match recovered.chunks.get(&current) {
                    Some(chunk) => {
                        cumulative += chunk.length;
                        cursor = chunk.next_chunk.clone();
                        dropped.push(current);
                    }
                    None => break,
                }
            }
            if found {
                for name in &dropped {
                    recovered.chunks.remove(name);
                }
                segment.first_chunk = Some(first_name.clone());
                segment.first_chunk_start_offset = record.start_offset;
                segment.start_offset = record.offset;
                segment.chunk_count -= dropped.len() as u32;
                return;
            }
        }

        // Truncation at the exact end of the segment consumes every chunk.
        if record.offset == segment.length {
            recovered.chunks.clear();
            segment.first_chunk = None;
            segment.last_chunk = None;
            segment.chunk_count = 0;
            segment.start_offset = record.offset;
            segment.first_chunk_start_offset = segment.length;
            segment.last_chunk_start_offset = segment.length;
            return;
        }

        debug!(
            segment = %record.segment_name,
            offset = record.offset,
            "unmatched truncation record skipped"
        );
    }

    /// Every chunk referenced by the recovered layout must exist in chunk
    /// storage with at least its recorded length, and the chain tallies must
    /// be internally consistent.
    async fn verify_recovered_state(
        &self,
        state: &HashMap<String, RecoveredSegment>,
    ) -> Result<()> {
        for (name, recovered) in state {
            let segment = &recovered.segment;
            let mut cursor = segment.first_chunk.clone();
            let mut count = 0u32;
            let mut total = 0u64;
            let mut last_seen = None;
            while let Some(current) = cursor {
                let chunk = recovered.chunks.get(&current).ok_or_else(|| {
                    ChunkError::BootstrapFailed(format!(
                        "segment {name} references unknown chunk {current}"
                    ))
                })?;
                match self.chunk_storage.get_info(&current).await? {
                    Some(info) if info.length >= chunk.length => {}
                    _ => {
                        return Err(ChunkError::BootstrapFailed(format!(
                            "chunk {current} of segment {name} missing from storage"
                        )))
                    }
                }
                count += 1;
                total += chunk.length;
                last_seen = Some(current.clone());
                cursor = chunk.next_chunk.clone();
            }
            if count != segment.chunk_count
                || Some(total) != segment.length.checked_sub(segment.first_chunk_start_offset)
                || last_seen != segment.last_chunk
            {
                return Err(ChunkError::BootstrapFailed(format!(
                    "inconsistent recovered layout for segment {name}"
                )));
            }
        }
        Ok(())
    }

    async fn commit_recovered_state(
        &self,
        state: &HashMap<String, RecoveredSegment>,
    ) -> Result<()> {
        for (name, recovered) in state {
            let mut tx = self.metadata.begin();
            let segment_record = StorageRecord::Segment(recovered.segment.clone());
            if tx.get(name).await?.is_some() {
                tx.update(segment_record);
            } else {
                tx.create(segment_record)?;
            }
            for chunk in recovered.chunks.values() {
                let chunk_record = StorageRecord::Chunk(chunk.clone());
                if tx.get(&chunk.name).await?.is_some() {
                    tx.update(chunk_record);
                } else {
                    tx.create(chunk_record)?;
                }
            }
            tx.commit().await?;
            self.metadata.pin(name).await;
        }
        Ok(())
    }

    /// Journal and snapshot chunks superseded by the bootstrap snapshot:
    /// everything from epochs strictly below the snapshot we recovered from.
    async fn stale_chunks(&self, snapshot_epoch: u64) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        for info in self
            .chunk_storage
            .list(&naming::journal_prefix(self.container_id))
            .await?
        {
            if let Some(parsed) = naming::parse_journal_chunk(self.container_id, &info.name) {
                if parsed.epoch < snapshot_epoch {
                    stale.push(info.name);
                }
            }
        }
        for info in self
            .chunk_storage
            .list(&naming::snapshot_prefix(self.container_id))
            .await?
        {
            if let Some(parsed) = naming::parse_snapshot_chunk(self.container_id, &info.name) {
                if parsed.epoch < snapshot_epoch {
                    stale.push(info.name);
                }
            }
        }
        Ok(stale)
    }

    async fn read_chunk_fully(&self, name: &str) -> Result<Bytes> {
        let info = self
            .chunk_storage
            .get_info(name)
            .await?
            .ok_or_else(|| ChunkError::ChunkNotFound(name.to_string()))?;
        if info.length == 0 {
            return Ok(Bytes::new());
        }
        self.chunk_storage.read(name, 0, info.length).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::InMemoryChunkStorage;
    use crate::rolling::SegmentRollingPolicy;

    fn config(max_length: u64) -> ChunkManagerConfig {
        ChunkManagerConfig {
            default_rolling_policy: SegmentRollingPolicy::new(max_length),
            ..Default::default()
        }
    }

    fn journal(
        storage: Arc<InMemoryChunkStorage>,
        metadata: MetadataStore,
        epoch: u64,
        max_length: u64,
    ) -> SystemJournal {
        SystemJournal::new(42, epoch, storage, metadata, config(max_length))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let journal = journal(storage, MetadataStore::in_memory(), 1, 8);

        assert_eq!(journal.epoch(), 1);
        assert_eq!(journal.container_id(), 42);
        assert_eq!(journal.current_file_index().await, 0);
        assert_eq!(
            journal.config().default_rolling_policy.max_length,
            8
        );
        assert_eq!(journal.system_segments().len(), 4);
    }

    #[tokio::test]
    async fn test_is_system_segment() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let journal = journal(storage, MetadataStore::in_memory(), 1, 8);

        assert!(!journal.is_system_segment("foo"));
        for name in naming::system_segments(42) {
            assert!(journal.is_system_segment(&name));
        }
        assert!(journal.is_system_segment(&naming::storage_metadata_segment_name(42)));
        assert!(journal.is_system_segment(&naming::attribute_segment_name(
            &naming::container_metadata_segment_name(42)
        )));
    }

    #[tokio::test]
    async fn test_bootstrap_empty_storage_declares_system_segments() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let metadata = MetadataStore::in_memory();
        let journal = journal(storage, metadata.clone(), 1, 8);

        journal.bootstrap().await.unwrap();

        let mut tx = metadata.begin();
        for name in naming::system_segments(42) {
            let segment = tx
                .get(&name)
                .await
                .unwrap()
                .unwrap()
                .into_segment()
                .unwrap();
            assert_eq!(segment.length, 0);
            assert_eq!(segment.chunk_count, 0);
            assert_eq!(segment.owner_epoch, 1);
            assert!(segment.is_ownership_changed());
        }
        // Bootstrap opened a fresh journal file after the snapshot.
        assert_eq!(journal.current_file_index().await, 1);
    }

    #[tokio::test]
    async fn test_commit_rotates_file_on_size() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let metadata = MetadataStore::in_memory();
        let mut cfg = config(8);
        cfg.journal_max_file_size = 1; // every batch rotates
        let journal = SystemJournal::new(42, 1, storage, metadata, cfg);
        journal.bootstrap().await.unwrap();

        let file_before = journal.current_file_index().await;
        journal
            .commit_record(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                segment_name: naming::system_segments(42)[0].clone(),
                offset: 0,
                new_chunk_name: "c0".to_string(),
                old_chunk_name: None,
            }))
            .await
            .unwrap();
        assert_eq!(journal.current_file_index().await, file_before + 1);
    }

    #[tokio::test]
    async fn test_chunk_addition_replay_across_failovers() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let segment_name = naming::system_segments(42)[0].clone();
        let max_length = 2u64;

        let before = journal(
            storage.clone(),
            MetadataStore::in_memory(),
            1,
            max_length,
        );
        before.bootstrap().await.unwrap();

        let mut last_chunk: Option<String> = None;
        let mut total = 0u64;
        for i in 0..10 {
            let new_chunk = format!("chunk{i}");
            let handle = storage.create(&new_chunk).await.unwrap();
            let written = storage
                .write(&handle, 0, &vec![0u8; max_length as usize])
                .await
                .unwrap();
            assert_eq!(written, max_length);
            total += written;
            before
                .commit_record(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                    segment_name: segment_name.clone(),
                    offset: max_length * i,
                    new_chunk_name: new_chunk.clone(),
                    old_chunk_name: last_chunk.clone(),
                }))
                .await
                .unwrap();
            last_chunk = Some(new_chunk);
        }
        assert_eq!(total, max_length * 10);

        // First failover.
        let metadata_after = MetadataStore::in_memory();
        let after = journal(storage.clone(), metadata_after.clone(), 2, max_length);
        after.bootstrap().await.unwrap();

        let mut tx = metadata_after.begin();
        let segment = tx
            .get(&segment_name)
            .await
            .unwrap()
            .unwrap()
            .into_segment()
            .unwrap();
        assert_eq!(segment.chunk_count, 10);
        assert_eq!(segment.start_offset, 0);
        assert_eq!(segment.length, total);

        // Second failover recovers from the first bootstrap's snapshot.
        let metadata_final = MetadataStore::in_memory();
        let last = journal(storage, metadata_final.clone(), 3, max_length);
        last.bootstrap().await.unwrap();

        let mut tx = metadata_final.begin();
        let segment = tx
            .get(&segment_name)
            .await
            .unwrap()
            .unwrap()
            .into_segment()
            .unwrap();
        assert_eq!(segment.chunk_count, 10);
        assert_eq!(segment.length, total);
    }

    #[tokio::test]
    async fn test_truncation_replay_across_failovers() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let segment_name = naming::system_segments(42)[0].clone();
        let max_length = 2u64;

        let before = journal(storage.clone(), MetadataStore::in_memory(), 1, max_length);
        before.bootstrap().await.unwrap();

        let mut last_chunk: Option<String> = None;
        for i in 0..10u64 {
            let new_chunk = format!("chunk{i}");
            let handle = storage.create(&new_chunk).await.unwrap();
            storage
                .write(&handle, 0, &vec![0u8; max_length as usize])
                .await
                .unwrap();
            before
                .commit_record(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                    segment_name: segment_name.clone(),
                    offset: max_length * i,
                    new_chunk_name: new_chunk.clone(),
                    old_chunk_name: last_chunk.clone(),
                }))
                .await
                .unwrap();
            last_chunk = Some(new_chunk);
        }

        // Failover, then truncate away the first five chunks byte by byte.
        let metadata2 = MetadataStore::in_memory();
        let second = journal(storage.clone(), metadata2.clone(), 2, max_length);
        second.bootstrap().await.unwrap();
        for offset in 0..=10u64 {
            let first_chunk_index = offset / max_length;
            second
                .commit_record(SystemJournalRecord::Truncation(TruncationRecord {
                    segment_name: segment_name.clone(),
                    offset,
                    first_chunk_name: Some(format!("chunk{first_chunk_index}")),
                    start_offset: max_length * first_chunk_index,
                }))
                .await
                .unwrap();
        }

        let metadata3 = MetadataStore::in_memory();
        let third = journal(storage.clone(), metadata3.clone(), 3, max_length);
        third.bootstrap().await.unwrap();
        let mut tx = metadata3.begin();
        let segment = tx
            .get(&segment_name)
            .await
            .unwrap()
            .unwrap()
            .into_segment()
            .unwrap();
        assert_eq!(segment.start_offset, 10);
        assert_eq!(segment.length, 20);
        assert_eq!(segment.chunk_count, 5);

        // Truncate the rest, including the final full truncation.
        for offset in 10..=20u64 {
            let first_chunk_index = offset / max_length;
            third
                .commit_record(SystemJournalRecord::Truncation(TruncationRecord {
                    segment_name: segment_name.clone(),
                    offset,
                    first_chunk_name: Some(format!("chunk{first_chunk_index}")),
                    start_offset: max_length * first_chunk_index,
                }))
                .await
                .unwrap();
        }

        let metadata4 = MetadataStore::in_memory();
        let fourth = journal(storage, metadata4.clone(), 4, max_length);
        fourth.bootstrap().await.unwrap();
        let mut tx = metadata4.begin();
        let segment = tx
            .get(&segment_name)
            .await
            .unwrap()
            .unwrap()
            .into_segment()
            .unwrap();
        assert_eq!(segment.start_offset, 20);
        assert_eq!(segment.length, 20);
        assert_eq!(segment.chunk_count, 0);
        assert!(segment.first_chunk.is_none());
    }

    #[tokio::test]
    async fn test_higher_epoch_records_ignored() {
        let storage = Arc::new(InMemoryChunkStorage::new());
        let segment_name = naming::system_segments(42)[0].clone();

        // Records written at epoch 5 must be invisible to a bootstrap at 3.
        let future = journal(storage.clone(), MetadataStore::in_memory(), 5, 8);
        future.bootstrap().await.unwrap();
        let handle = storage.create("future-chunk").await.unwrap();
        storage.write(&handle, 0, b"xxxx").await.unwrap();
        future
            .commit_record(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                segment_name: segment_name.clone(),
                offset: 0,
                new_chunk_name: "future-chunk".to_string(),
                old_chunk_name: None,
            }))
            .await
            .unwrap();

        let metadata = MetadataStore::in_memory();
        let current = journal(storage, metadata.clone(), 3, 8);
        current.bootstrap().await.unwrap();
        let mut tx = metadata.begin();
        let segment = tx
            .get(&segment_name)
            .await
            .unwrap()
            .unwrap()
            .into_segment()
            .unwrap();
        assert_eq!(segment.length, 0);
        assert_eq!(segment.chunk_count, 0);
    }
}
