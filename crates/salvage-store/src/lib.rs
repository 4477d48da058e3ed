//! Chunk storage for the install pipeline.
//!
//! This crate defines the [`ChunkStore`] trait, a bounded cache of owned
//! chunk buffers with a loss-notification callback, along with:
//!
//! - [`ChunkDataAccess`] — one chunk header plus its byte buffer, mutated
//!   only under an exclusive lock.
//! - [`MemoryChunkStore`] — capacity-bounded in-memory store that asks an
//!   [`EvictionPolicy`] what to drop and boots the rest to an overflow store.
//! - [`DiskChunkStore`] — unbounded overflow store, one file per chunk with
//!   a 2-level fan-out directory layout.

mod chunk_data;
mod disk_store;
mod error;
mod eviction;
mod memory_store;
mod traits;

pub use chunk_data::{ChunkData, ChunkDataAccess, ChunkDataLock};
pub use disk_store::DiskChunkStore;
pub use error::StoreError;
pub use eviction::{EvictionPlan, EvictionPolicy, ReferenceEvictionPolicy};
pub use memory_store::MemoryChunkStore;
pub use traits::{ChunkStore, LostChunkCallback};
