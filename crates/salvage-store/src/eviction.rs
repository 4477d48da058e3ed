//! Eviction decisions for bounded stores.

use std::collections::HashSet;
use std::sync::Arc;

use salvage_manifest::ReferenceTracker;
use salvage_types::ChunkId;

/// What a store should drop to get back under capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Chunks nobody needs any more. Dropped without notification.
    pub cleanable: Vec<ChunkId>,
    /// Chunks still needed but pushed out for space. Moved to the overflow
    /// store if there is one, otherwise reported lost.
    pub bootable: Vec<ChunkId>,
}

/// Decides which resident chunks leave a full store.
pub trait EvictionPolicy: Send + Sync {
    /// Plan evictions among `resident` so that at most `desired_max`
    /// remain.
    fn query(&self, resident: &[ChunkId], desired_max: usize) -> EvictionPlan;
}

/// Evicts by future usage.
///
/// Chunks with no outstanding reference are cleanable. If still above
/// `desired_max`, the chunks whose next use is furthest away are booted.
pub struct ReferenceEvictionPolicy {
    tracker: Arc<dyn ReferenceTracker>,
}

impl ReferenceEvictionPolicy {
    pub fn new(tracker: Arc<dyn ReferenceTracker>) -> Self {
        Self { tracker }
    }
}

impl EvictionPolicy for ReferenceEvictionPolicy {
    fn query(&self, resident: &[ChunkId], desired_max: usize) -> EvictionPlan {
        let mut cleanable = Vec::new();
        let mut by_distance: Vec<(usize, ChunkId)> = Vec::with_capacity(resident.len());
        for id in resident {
            match self.tracker.next_usage(id) {
                Some(distance) => by_distance.push((distance, *id)),
                None => cleanable.push(*id),
            }
        }

        let mut bootable = Vec::new();
        if by_distance.len() > desired_max {
            let excess = by_distance.len() - desired_max;
            by_distance.sort_by(|a, b| b.0.cmp(&a.0));
            bootable = by_distance.into_iter().take(excess).map(|(_, id)| id).collect();
        }

        EvictionPlan { cleanable, bootable }
    }
}

/// Keep only ids that are actually resident, once each.
pub(crate) fn restrict_plan(plan: EvictionPlan, resident: &[ChunkId]) -> EvictionPlan {
    let resident: HashSet<&ChunkId> = resident.iter().collect();
    let mut seen = HashSet::new();
    let mut keep = |id: &ChunkId| resident.contains(id) && seen.insert(*id);
    let cleanable = plan.cleanable.into_iter().filter(|id| keep(id)).collect();
    let bootable = plan.bootable.into_iter().filter(|id| keep(id)).collect();
    EvictionPlan { cleanable, bootable }
}
