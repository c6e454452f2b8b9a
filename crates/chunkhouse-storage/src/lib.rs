//! chunkhouse Storage Layer
//!
//! A chunk-layer storage engine with a durable system journal: segments
//! (logical append-only byte sequences) are realized as linked lists of
//! chunks (immutable or append-only blobs) in a pluggable chunk store, and
//! the layout of the *system* segments — the ones that hold everyone else's
//! metadata — survives total metadata loss via a write-ahead journal kept in
//! chunk storage itself.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────┐
//! │   Container   │
//! └───────┬───────┘
//!         │ segment API (async)
//!         ▼
//! ┌───────────────┐   journal batches,   ┌───────────────┐
//! │  ChunkManager │──── snapshots ──────►│ SystemJournal │
//! └───────┬───────┘                      └───────┬───────┘
//!         │                                      │
//!         ▼                                      ▼
//! ┌───────────────┐                      ┌───────────────┐
//! │ MetadataStore │                      │  ChunkStorage │
//! │ (chunkhouse-  │                      │ (in-memory /  │
//! │   metadata)   │                      │ object store) │
//! └───────────────┘                      └───────────────┘
//! ```
//!
//! ## Failover Story
//!
//! Each container generation runs at a monotonically increasing *epoch*.
//! A new generation calls `initialize(epoch)` then `bootstrap(...)`, which
//! rebuilds the system segments purely from journal records and snapshots in
//! chunk storage, ignoring everything tagged with an epoch at or above its
//! own. A previous owner that is still alive (a *zombie*) can keep writing
//! garbage into chunks and into its own journal files; its records describe
//! a chunk chain that diverged from the new owner's and are skipped during
//! replay, so they can never resurface.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use chunkhouse_metadata::MetadataStore;
//! use chunkhouse_storage::{ChunkManager, ChunkManagerConfig, InMemoryChunkStorage,
//!     SegmentRollingPolicy};
//!
//! let storage = Arc::new(InMemoryChunkStorage::new());
//! let manager = ChunkManager::new(storage, ChunkManagerConfig::default());
//! manager.initialize(1);
//! manager.bootstrap(42, MetadataStore::in_memory()).await?;
//!
//! manager.create("orders", SegmentRollingPolicy::new(64 * 1024 * 1024)).await?;
//! let handle = manager.open_write("orders").await?;
//! manager.write(&handle, 0, b"payload").await?;
//! let read = manager.open_read("orders").await?;
//! let bytes = manager.read(&read, 0, 7).await?;
//! ```

pub mod config;
pub mod error;
pub mod garbage;
pub mod journal;
pub mod manager;
pub mod mem;
pub mod naming;
pub mod object;
pub mod provider;
pub mod records;
pub mod rolling;

pub use config::ChunkManagerConfig;
pub use error::{ChunkError, Result};
pub use garbage::GarbageCollector;
pub use journal::SystemJournal;
pub use manager::{ChunkManager, SegmentHandle};
pub use mem::InMemoryChunkStorage;
pub use object::ObjectStoreChunkStorage;
pub use provider::{ChunkHandle, ChunkInfo, ChunkStorage};
pub use records::{
    ChunkAddedRecord, SegmentSnapshotRecord, SystemJournalRecord, SystemJournalRecordBatch,
    SystemSnapshotRecord, TruncationRecord,
};
pub use rolling::SegmentRollingPolicy;
