//! Capacity-bounded in-memory chunk store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use salvage_types::ChunkId;
use salvage_types::events::{ChunkBooted, ChunkCleaned, ChunkLost, EventBus};
use tracing::{debug, trace, warn};

use crate::chunk_data::ChunkDataAccess;
use crate::eviction::{EvictionPolicy, restrict_plan};
use crate::traits::{ChunkStore, LostChunkCallback, into_owned};

type SharedCallback = Arc<dyn Fn(&ChunkId) + Send + Sync>;

struct MemoryInner {
    entries: HashMap<ChunkId, Arc<ChunkDataAccess>>,
    /// Insertion order, oldest first.
    order: VecDeque<ChunkId>,
    /// The most recently gotten chunk. Never evicted.
    pinned: Option<ChunkId>,
}

impl MemoryInner {
    fn take(&mut self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>> {
        let chunk = self.entries.remove(id)?;
        self.order.retain(|c| c != id);
        if self.pinned == Some(*id) {
            self.pinned = None;
        }
        Some(chunk)
    }
}

/// In-memory chunk store holding at most `capacity` chunks.
///
/// When a `put` pushes the store over capacity, the [`EvictionPolicy`]
/// chooses which chunks to drop. Cleanable chunks are discarded silently.
/// Bootable chunks move to the overflow store if one is configured and are
/// otherwise reported through the loss callback. If the policy frees
/// nothing, the oldest unpinned chunk is booted.
pub struct MemoryChunkStore {
    capacity: usize,
    policy: Arc<dyn EvictionPolicy>,
    overflow: Option<Arc<dyn ChunkStore>>,
    inner: Mutex<MemoryInner>,
    lost_callback: Mutex<Option<SharedCallback>>,
    events: EventBus,
}

impl MemoryChunkStore {
    /// Create a store holding at most `capacity` chunks (at least one).
    pub fn new(capacity: usize, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            overflow: None,
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                pinned: None,
            }),
            lost_callback: Mutex::new(None),
            events: EventBus::new(),
        }
    }

    /// Send booted chunks to `overflow` instead of losing them.
    pub fn with_overflow(mut self, overflow: Arc<dyn ChunkStore>) -> Self {
        self.overflow = Some(overflow);
        self
    }

    /// Emit eviction events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Insert a chunk, run eviction, then hand booted chunks on.
    fn insert(&self, id: ChunkId, chunk: Arc<ChunkDataAccess>, pin: bool) {
        let mut booted = Vec::new();
        let mut cleaned = Vec::new();
        {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            if inner.entries.insert(id, chunk).is_none() {
                inner.order.push_back(id);
            }
            if pin {
                inner.pinned = Some(id);
            }

            if inner.entries.len() > self.capacity {
                // The incoming chunk and the last gotten one are never offered
                // to the policy.
                let pinned = inner.pinned;
                let protected = |c: &ChunkId| *c == id || Some(*c) == pinned;
                let candidates: Vec<ChunkId> =
                    inner.order.iter().filter(|c| !protected(*c)).copied().collect();
                let protected_count = inner.entries.len() - candidates.len();
                let desired_max = self.capacity.saturating_sub(protected_count);
                let plan = restrict_plan(self.policy.query(&candidates, desired_max), &candidates);

                for clean in &plan.cleanable {
                    if inner.take(clean).is_some() {
                        cleaned.push(*clean);
                    }
                }
                for boot in &plan.bootable {
                    if let Some(chunk) = inner.take(boot) {
                        booted.push((*boot, chunk));
                    }
                }

                while inner.entries.len() > self.capacity {
                    // Oldest unprotected chunk, else the pin gives way.
                    let victim = inner
                        .order
                        .iter()
                        .find(|c| !protected(*c))
                        .or_else(|| inner.order.iter().find(|c| **c != id))
                        .copied();
                    let Some(victim) = victim else {
                        break;
                    };
                    if let Some(chunk) = inner.take(&victim) {
                        trace!(id = %victim, "policy freed too little, booting oldest chunk");
                        booted.push((victim, chunk));
                    }
                }
            }
        }

        for id in cleaned {
            debug!(%id, "cleaned unreferenced chunk");
            self.events.emit(ChunkCleaned { chunk_id: id });
        }
        for (id, chunk) in booted {
            self.boot(id, chunk);
        }
    }

    fn boot(&self, id: ChunkId, chunk: Arc<ChunkDataAccess>) {
        match &self.overflow {
            Some(overflow) => {
                debug!(%id, "booting chunk to overflow store");
                overflow.put(id, into_owned(chunk));
                self.events.emit(ChunkBooted {
                    chunk_id: id,
                    to_overflow: true,
                });
            }
            None => {
                warn!(%id, "chunk booted with no overflow store, reporting lost");
                self.events.emit(ChunkBooted {
                    chunk_id: id,
                    to_overflow: false,
                });
                self.events.emit(ChunkLost { chunk_id: id });
                let callback = self
                    .lost_callback
                    .lock()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(callback) = callback {
                    callback(&id);
                }
            }
        }
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, id: ChunkId, data: ChunkDataAccess) {
        trace!(%id, size = data.data_size(), "storing chunk in memory");
        self.insert(id, Arc::new(data), false);
    }

    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>> {
        {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            if let Some(chunk) = inner.entries.get(id).cloned() {
                inner.pinned = Some(*id);
                return Some(chunk);
            }
        }

        let chunk = Arc::new(self.overflow.as_ref()?.remove(id)?);
        debug!(%id, "rehoming chunk from overflow store");
        self.insert(*id, chunk.clone(), true);
        Some(chunk)
    }

    fn remove(&self, id: &ChunkId) -> Option<ChunkDataAccess> {
        let taken = self
            .inner
            .lock()
            .expect("memory store lock poisoned")
            .take(id);
        match taken {
            Some(chunk) => Some(into_owned(chunk)),
            None => self.overflow.as_ref()?.remove(id),
        }
    }

    fn contains(&self, id: &ChunkId) -> bool {
        let in_memory = self
            .inner
            .lock()
            .expect("memory store lock poisoned")
            .entries
            .contains_key(id);
        in_memory || self.overflow.as_ref().is_some_and(|o| o.contains(id))
    }

    fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .entries
            .len()
    }

    fn size(&self) -> usize {
        self.capacity
    }

    fn set_lost_chunk_callback(&self, callback: LostChunkCallback) {
        *self.lost_callback.lock().expect("callback lock poisoned") = Some(Arc::from(callback));
    }
}
