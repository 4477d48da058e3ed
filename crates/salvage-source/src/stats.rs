//! Counters for install source activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by the worker as it loads chunks.
#[derive(Debug, Default)]
pub struct InstallSourceStats {
    batches: AtomicU64,
    chunks_recycled: AtomicU64,
    chunks_failed: AtomicU64,
    fragment_reads: AtomicU64,
    bytes_read: AtomicU64,
}

/// Point-in-time copy of [`InstallSourceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Batches planned.
    pub batches: u64,
    /// Chunks rebuilt, verified and stored.
    pub chunks_recycled: u64,
    /// Chunk loads that failed (aborts excluded).
    pub chunks_failed: u64,
    /// Individual fragment reads from build files.
    pub fragment_reads: u64,
    /// Bytes read from build files.
    pub bytes_read: u64,
}

impl InstallSourceStats {
    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recycled(&self) {
        self.chunks_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.fragment_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            chunks_recycled: self.chunks_recycled.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            fragment_reads: self.fragment_reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}
