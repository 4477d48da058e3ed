//! Contracts between chunk sources and the installer.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use salvage_store::ChunkDataAccess;
use salvage_types::ChunkId;

/// Receives the chunks a source has given up on, so the installer can
/// fetch them elsewhere.
pub type UnavailableChunksCallback = Arc<dyn Fn(&HashSet<ChunkId>) + Send + Sync>;

/// Something the installer can pull chunks from.
pub trait ChunkSource: Send + Sync {
    /// The chunk, loading it if this source can. `None` means the caller
    /// should try another source.
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>>;

    /// Ask for chunks outside the planned order. Returns the ones this
    /// source cannot supply.
    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId>;

    /// Ask for a chunk to be loaded again even though it was already
    /// delivered once. Returns whether this source accepted it.
    fn add_repeat_requirement(&self, id: &ChunkId) -> bool;

    /// Replace the unavailable-chunks callback.
    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback);

    /// Every chunk this source could supply.
    fn available_chunks(&self) -> HashSet<ChunkId>;

    /// `path` is about to go away: load whatever still-needed chunks it
    /// holds now.
    fn harvest_remaining_chunks_from_file(&self, path: &Path);
}

/// Cooperative flow control for a running source.
pub trait Controllable: Send + Sync {
    /// Hold I/O between fragment reads while `paused` is set.
    fn set_paused(&self, paused: bool);

    /// Stop all work. In-flight loads end with nothing committed.
    fn abort(&self);
}
