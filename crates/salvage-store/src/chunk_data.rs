//! Owned chunk buffers with scoped exclusive access.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

use salvage_types::ChunkHeader;

/// A chunk header together with its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkData {
    /// Header describing the payload.
    pub header: ChunkHeader,
    /// The payload bytes.
    pub data: Vec<u8>,
}

/// One chunk held in memory.
///
/// The header and buffer are only reachable through [`ChunkDataLock`], so
/// a writer always has exclusive access for the duration of the lock.
#[derive(Debug)]
pub struct ChunkDataAccess {
    inner: Mutex<ChunkData>,
}

/// Exclusive access to a chunk's header and buffer.
///
/// The lock is released when the guard is dropped.
pub struct ChunkDataLock<'a> {
    guard: MutexGuard<'a, ChunkData>,
}

impl ChunkDataAccess {
    /// Allocate a zero-filled buffer of exactly `size` bytes with a zeroed
    /// header.
    pub fn new(size: usize) -> Self {
        Self::from_parts(ChunkHeader::default(), vec![0u8; size])
    }

    /// Wrap an existing header and payload.
    pub fn from_parts(header: ChunkHeader, data: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(ChunkData { header, data }),
        }
    }

    /// Take exclusive access to the header and buffer.
    pub fn acquire_lock(&self) -> ChunkDataLock<'_> {
        ChunkDataLock {
            guard: self.inner.lock().expect("chunk data lock poisoned"),
        }
    }

    /// Give up access taken with [`acquire_lock`](Self::acquire_lock).
    pub fn release_lock(lock: ChunkDataLock<'_>) {
        drop(lock);
    }

    /// Size of the payload buffer.
    pub fn data_size(&self) -> usize {
        self.acquire_lock().data.len()
    }

    /// Copy the current header and payload.
    pub fn snapshot(&self) -> ChunkData {
        self.acquire_lock().clone()
    }

    /// Consume the accessor, returning its header and payload.
    pub fn into_parts(self) -> (ChunkHeader, Vec<u8>) {
        let data = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        (data.header, data.data)
    }
}

impl Deref for ChunkDataLock<'_> {
    type Target = ChunkData;

    fn deref(&self) -> &ChunkData {
        &self.guard
    }
}

impl DerefMut for ChunkDataLock<'_> {
    fn deref_mut(&mut self) -> &mut ChunkData {
        &mut self.guard
    }
}
