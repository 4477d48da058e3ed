//! Ordered future chunk usage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use salvage_types::ChunkId;
use tracing::trace;

use crate::manifest::BuildManifest;

/// The installer's view of which chunks it will need, and in what order.
pub trait ReferenceTracker: Send + Sync {
    /// Every chunk that still has at least one outstanding reference.
    fn referenced_chunks(&self) -> HashSet<ChunkId>;

    /// Up to `count` distinct upcoming chunk ids matching `predicate`,
    /// in the order they will be consumed.
    fn next_references(&self, count: usize, predicate: &dyn Fn(&ChunkId) -> bool) -> Vec<ChunkId>;

    /// Distance (in references) until `id` is next used, or `None` if it
    /// has no outstanding reference.
    fn next_usage(&self, id: &ChunkId) -> Option<usize>;

    /// Consume the next reference. Returns `false` if `id` is not the next
    /// chunk in sequence.
    fn pop_reference(&self, id: &ChunkId) -> bool;

    /// Number of references left to consume.
    fn remaining_references(&self) -> usize;
}

struct TrackerInner {
    order: Vec<ChunkId>,
    position: usize,
    /// Absolute positions of each chunk's outstanding references, ascending.
    upcoming: HashMap<ChunkId, VecDeque<usize>>,
}

/// [`ReferenceTracker`] backed by a flat ordered list of chunk references.
pub struct ChunkReferenceTracker {
    inner: Mutex<TrackerInner>,
}

impl ChunkReferenceTracker {
    /// Track the given references, consumed front to back. Duplicates are
    /// allowed and count as separate uses.
    pub fn from_references(order: Vec<ChunkId>) -> Self {
        let mut upcoming: HashMap<ChunkId, VecDeque<usize>> = HashMap::new();
        for (position, id) in order.iter().enumerate() {
            upcoming.entry(*id).or_default().push_back(position);
        }
        Self {
            inner: Mutex::new(TrackerInner {
                order,
                position: 0,
                upcoming,
            }),
        }
    }

    /// Track every chunk part of the listed files, in manifest file order.
    ///
    /// Files not present in `files` are skipped.
    pub fn from_manifest(manifest: &BuildManifest, files: &HashSet<PathBuf>) -> Self {
        let order = manifest
            .files()
            .iter()
            .filter(|f| files.contains(&f.filename))
            .flat_map(|f| f.chunk_parts.iter().map(|p| p.chunk_id))
            .collect();
        Self::from_references(order)
    }
}

impl ReferenceTracker for ChunkReferenceTracker {
    fn referenced_chunks(&self) -> HashSet<ChunkId> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner.upcoming.keys().copied().collect()
    }

    fn next_references(&self, count: usize, predicate: &dyn Fn(&ChunkId) -> bool) -> Vec<ChunkId> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in &inner.order[inner.position..] {
            if out.len() >= count {
                break;
            }
            if seen.insert(*id) && predicate(id) {
                out.push(*id);
            }
        }
        out
    }

    fn next_usage(&self, id: &ChunkId) -> Option<usize> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let next = inner.upcoming.get(id)?.front()?;
        Some(next - inner.position)
    }

    fn pop_reference(&self, id: &ChunkId) -> bool {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.order.get(inner.position) != Some(id) {
            return false;
        }
        inner.position += 1;
        if let Some(positions) = inner.upcoming.get_mut(id) {
            positions.pop_front();
            if positions.is_empty() {
                inner.upcoming.remove(id);
            }
        }
        trace!(%id, position = inner.position, "popped chunk reference");
        true
    }

    fn remaining_references(&self) -> usize {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner.order.len() - inner.position
    }
}
