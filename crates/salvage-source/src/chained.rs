//! Ordered fallback across chunk sources.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use salvage_store::ChunkDataAccess;
use salvage_types::ChunkId;
use tracing::trace;

use crate::source::{ChunkSource, UnavailableChunksCallback};

/// Tries each source in turn, first to last.
///
/// Runtime requirements one source cannot handle are offered to the next;
/// whatever the last source cannot handle is returned to the caller.
pub struct ChainedChunkSource {
    sources: Vec<Arc<dyn ChunkSource>>,
}

impl ChainedChunkSource {
    pub fn new(sources: Vec<Arc<dyn ChunkSource>>) -> Self {
        Self { sources }
    }
}

impl ChunkSource for ChainedChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>> {
        self.sources.iter().enumerate().find_map(|(index, source)| {
            let chunk = source.get(id);
            if chunk.is_some() {
                trace!(%id, source = index, "chunk served by chained source");
            }
            chunk
        })
    }

    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
        self.sources
            .iter()
            .fold(ids, |remaining, source| {
                if remaining.is_empty() {
                    remaining
                } else {
                    source.add_runtime_requirements(remaining)
                }
            })
    }

    fn add_repeat_requirement(&self, id: &ChunkId) -> bool {
        // Every source is asked; any of them may have delivered the chunk.
        self.sources
            .iter()
            .fold(false, |accepted, source| source.add_repeat_requirement(id) || accepted)
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        for source in &self.sources {
            source.set_unavailable_chunks_callback(callback.clone());
        }
    }

    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.sources
            .iter()
            .flat_map(|source| source.available_chunks())
            .collect()
    }

    fn harvest_remaining_chunks_from_file(&self, path: &Path) {
        for source in &self.sources {
            source.harvest_remaining_chunks_from_file(path);
        }
    }
}
