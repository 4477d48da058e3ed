//! Install source tuning.

use std::collections::HashSet;

use salvage_types::ChunkId;
use serde::{Deserialize, Serialize};

/// Largest batch either bound may request.
pub const BATCH_FETCH_LIMIT: usize = 1000;

/// Tuning for [`InstallChunkSource`](crate::InstallChunkSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSourceConfig {
    /// Fewest chunks a batch asks the reference tracker for.
    pub batch_fetch_minimum: usize,
    /// Most chunks a batch asks the reference tracker for.
    pub batch_fetch_maximum: usize,
    /// Chunks skipped by batch planning unless explicitly requested at
    /// runtime (typically those a faster source already holds).
    #[serde(skip)]
    pub chunk_ignore_set: HashSet<ChunkId>,
}

impl Default for InstallSourceConfig {
    fn default() -> Self {
        Self {
            batch_fetch_minimum: 10,
            batch_fetch_maximum: 40,
            chunk_ignore_set: HashSet::new(),
        }
    }
}

impl InstallSourceConfig {
    /// Bring the batch bounds into range: minimum in `[1, 1000]`, maximum
    /// in `[minimum, 1000]`.
    pub fn clamped(mut self) -> Self {
        self.batch_fetch_minimum = self.batch_fetch_minimum.clamp(1, BATCH_FETCH_LIMIT);
        self.batch_fetch_maximum = self
            .batch_fetch_maximum
            .clamp(self.batch_fetch_minimum, BATCH_FETCH_LIMIT);
        self
    }
}
