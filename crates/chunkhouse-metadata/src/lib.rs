//! chunkhouse Metadata Store
//!
//! Transactional key-value store for the records that describe segment
//! layout: one [`SegmentMetadata`] record per segment and one
//! [`ChunkMetadata`] record per chunk, keyed by name.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────┐
//! │        MetadataStore          │
//! │  ┌─────────┐  ┌────────────┐  │
//! │  │  dirty  │  │ LRU cache  │  │   dirty = committed, unflushed
//! │  │ buffer  │  │ (+ pinned) │  │   (never evicted)
//! │  └────┬────┘  └─────┬──────┘  │
//! └───────┼─────────────┼─────────┘
//!         ▼ flush       ▼ fault-in
//! ┌───────────────────────────────┐
//! │   KeyValueStorage (backend)   │
//! └───────────────────────────────┘
//! ```
//!
//! All mutations go through [`MetadataTransaction`]s with optimistic version
//! validation; see the [`store`] module docs for the full protocol.
//!
//! For the *system* segments this store is only a cache: their authoritative
//! layout lives in chunk storage (journal + snapshots) and is rebuilt into a
//! fresh store on every bootstrap.

pub mod error;
pub mod store;
pub mod types;

pub use error::{MetadataError, Result};
pub use store::{
    InMemoryKeyValueStorage, KeyValueStorage, MetadataStore, MetadataTransaction, VersionedValue,
};
pub use types::{
    ChunkMetadata, SegmentMetadata, StorageRecord, STATUS_ACTIVE, STATUS_OWNERSHIP_CHANGED,
    STATUS_SEALED,
};
