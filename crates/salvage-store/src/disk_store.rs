//! File-based overflow chunk store.
//!
//! Stores one file per chunk with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`.
//!
//! Each file holds `[u32 LE header length][postcard header][payload]`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use salvage_types::events::{ChunkCorrupted, ChunkLost, EventBus};
use salvage_types::{ChunkHeader, ChunkId};
use tracing::{debug, error, trace};

use crate::chunk_data::ChunkDataAccess;
use crate::error::StoreError;
use crate::traits::{ChunkStore, LostChunkCallback};

type SharedCallback = Arc<dyn Fn(&ChunkId) + Send + Sync>;

/// Unbounded chunk store backed by the local filesystem.
///
/// Writes are atomic: data is written to a temporary file first, then
/// renamed into place. Reads re-verify the payload against the hashes in
/// the stored header; a chunk that fails is deleted and reported lost.
pub struct DiskChunkStore {
    base_dir: PathBuf,
    index: Mutex<HashSet<ChunkId>>,
    lost_callback: Mutex<Option<SharedCallback>>,
    events: EventBus,
}

impl DiskChunkStore {
    /// Create a new disk store rooted at the given directory.
    ///
    /// The directory is created if it does not exist. Files already present
    /// are not adopted.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            index: Mutex::new(HashSet::new()),
            lost_callback: Mutex::new(None),
            events: EventBus::new(),
        })
    }

    /// Emit loss and corruption events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Compute the full file path for a chunk ID.
    fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    fn write_chunk(&self, id: &ChunkId, data: ChunkDataAccess) -> Result<(), StoreError> {
        let (header, payload) = data.into_parts();
        let encoded =
            postcard::to_allocvec(&header).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let header_len = u32::try_from(encoded.len())
            .map_err(|_| StoreError::Serialization("chunk header too large".into()))?;

        let mut bytes = Vec::with_capacity(4 + encoded.len() + payload.len());
        bytes.extend_from_slice(&header_len.to_le_bytes());
        bytes.extend_from_slice(&encoded);
        bytes.extend_from_slice(&payload);

        let path = self.chunk_path(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &path)?;

        debug!(%id, path = %path.display(), size = payload.len(), "stored chunk to file");
        Ok(())
    }

    /// Read and verify a chunk file. `Ok(None)` if there is no file.
    fn read_chunk(&self, id: &ChunkId) -> Result<Option<ChunkDataAccess>, StoreError> {
        let path = self.chunk_path(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        decode_chunk(id, &bytes).map(Some)
    }

    fn delete_file(&self, id: &ChunkId) {
        match std::fs::remove_file(self.chunk_path(id)) {
            Ok(()) => trace!(%id, "deleted chunk file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(%id, error = %e, "failed to delete chunk file"),
        }
    }

    fn report_lost(&self, id: &ChunkId) {
        self.events.emit(ChunkLost { chunk_id: *id });
        let callback = self
            .lost_callback
            .lock()
            .expect("callback lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(id);
        }
    }

    /// Load a chunk, treating any failure other than absence as a loss.
    fn load(&self, id: &ChunkId) -> Option<ChunkDataAccess> {
        if !self.index.lock().expect("disk index lock poisoned").contains(id) {
            return None;
        }
        match self.read_chunk(id) {
            Ok(Some(chunk)) => Some(chunk),
            Ok(None) => {
                self.index.lock().expect("disk index lock poisoned").remove(id);
                None
            }
            Err(e) => {
                error!(%id, error = %e, "chunk unreadable from disk store");
                self.index.lock().expect("disk index lock poisoned").remove(id);
                self.delete_file(id);
                if matches!(e, StoreError::CorruptChunk { .. }) {
                    self.events.emit(ChunkCorrupted { chunk_id: *id });
                }
                self.report_lost(id);
                None
            }
        }
    }
}

/// Split a chunk file into header and payload and verify the payload.
fn decode_chunk(id: &ChunkId, bytes: &[u8]) -> Result<ChunkDataAccess, StoreError> {
    let corrupt = |reason: &str| StoreError::CorruptChunk {
        id: *id,
        reason: reason.to_string(),
    };

    let (len_bytes, rest) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| corrupt("truncated header length"))?;
    let header_len = u32::from_le_bytes(*len_bytes) as usize;
    if rest.len() < header_len {
        return Err(corrupt("truncated header"));
    }
    let (encoded, payload) = rest.split_at(header_len);
    let header: ChunkHeader =
        postcard::from_bytes(encoded).map_err(|e| StoreError::Serialization(e.to_string()))?;

    if header.guid != *id {
        return Err(corrupt("header names a different chunk"));
    }
    let hashes = header.hashes();
    if !hashes.is_empty() && !hashes.matches(payload) {
        return Err(corrupt("payload does not match header hash"));
    }
    Ok(ChunkDataAccess::from_parts(header, payload.to_vec()))
}

impl ChunkStore for DiskChunkStore {
    fn put(&self, id: ChunkId, data: ChunkDataAccess) {
        // Stamp the id so the file is self-describing.
        data.acquire_lock().header.guid = id;
        match self.write_chunk(&id, data) {
            Ok(()) => {
                self.index.lock().expect("disk index lock poisoned").insert(id);
            }
            Err(e) => {
                error!(%id, error = %e, "failed to write chunk to disk store");
                self.index.lock().expect("disk index lock poisoned").remove(&id);
                self.delete_file(&id);
                self.report_lost(&id);
            }
        }
    }

    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>> {
        self.load(id).map(Arc::new)
    }

    fn remove(&self, id: &ChunkId) -> Option<ChunkDataAccess> {
        let chunk = self.load(id)?;
        self.index.lock().expect("disk index lock poisoned").remove(id);
        self.delete_file(id);
        Some(chunk)
    }

    fn contains(&self, id: &ChunkId) -> bool {
        self.index.lock().expect("disk index lock poisoned").contains(id)
    }

    fn len(&self) -> usize {
        self.index.lock().expect("disk index lock poisoned").len()
    }

    fn size(&self) -> usize {
        usize::MAX
    }

    fn set_lost_chunk_callback(&self, callback: LostChunkCallback) {
        *self.lost_callback.lock().expect("callback lock poisoned") = Some(Arc::from(callback));
    }
}
