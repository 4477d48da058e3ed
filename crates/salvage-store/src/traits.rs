//! Core trait for chunk storage.

use std::sync::Arc;

use salvage_types::ChunkId;

use crate::chunk_data::ChunkDataAccess;

/// Called once for every chunk a store had to discard while it was still
/// needed.
pub type LostChunkCallback = Box<dyn Fn(&ChunkId) + Send + Sync>;

/// A cache of owned chunk buffers keyed by [`ChunkId`].
///
/// All implementations must be `Send + Sync`: the install worker fills the
/// store while the installer's writer drains it. Callbacks are invoked
/// after the store's internal lock is released.
pub trait ChunkStore: Send + Sync {
    /// Take ownership of a chunk.
    ///
    /// May evict other chunks to stay within [`size`](Self::size); any
    /// chunk evicted while still needed is reported through the loss
    /// callback.
    fn put(&self, id: ChunkId, data: ChunkDataAccess);

    /// Non-owning handle to a stored chunk, or `None` on a miss.
    ///
    /// The most recently gotten chunk is never evicted by a later `put`.
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>>;

    /// Take a chunk out of the store.
    ///
    /// The caller becomes the sole owner: handles from earlier `get` calls
    /// keep their own copy and never observe later writes.
    fn remove(&self, id: &ChunkId) -> Option<ChunkDataAccess>;

    /// Whether the store currently holds `id`.
    fn contains(&self, id: &ChunkId) -> bool;

    /// Number of chunks currently held.
    fn len(&self) -> usize;

    /// Whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of chunks held at once.
    fn size(&self) -> usize;

    /// Free slots: `size() - len()`, never negative.
    fn slack(&self) -> usize {
        self.size().saturating_sub(self.len())
    }

    /// Replace the loss callback.
    fn set_lost_chunk_callback(&self, callback: LostChunkCallback);
}

/// Recover an owned chunk from a shared handle, copying it if other
/// handles are still alive.
pub(crate) fn into_owned(chunk: Arc<ChunkDataAccess>) -> ChunkDataAccess {
    Arc::try_unwrap(chunk).unwrap_or_else(|shared| {
        let copy = shared.snapshot();
        ChunkDataAccess::from_parts(copy.header, copy.data)
    })
}
