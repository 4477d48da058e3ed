//! Recycling chunks from previously installed builds.
//!
//! A chunk the target build needs often already sits on disk, spread over
//! one or more files of an older installation. [`InstallChunkSource`]
//! rebuilds such chunks from those files, verifies them against the
//! manifest hash and places them in the chunk store.
//!
//! Each `get` that misses the store runs one batch:
//!
//! 1. drain repeat requirements,
//! 2. plan the next ids from the reference tracker, sized by store slack,
//! 3. rebuild and verify each planned id in order,
//! 4. report the ids that failed through the unavailable callback.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use salvage_manifest::{ChunkManifest, ReferenceTracker};
use salvage_store::{ChunkDataAccess, ChunkStore};
use salvage_types::events::{
    BatchStarted, ChunkLoadCompleted, ChunkLoadStarted, ChunksUnavailable, EventBus, LoadOutcome,
};
use salvage_types::{ChunkHashes, ChunkHeader, ChunkId, FragmentDescriptor, HashFlags, StorageFlags};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::InstallSourceConfig;
use crate::error::ChunkLoadError;
use crate::source::{ChunkSource, Controllable, UnavailableChunksCallback};
use crate::stats::{InstallSourceStats, StatsSnapshot};

/// How long a paused load sleeps before checking the flags again.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A previously completed installation usable as a chunk source.
#[derive(Clone)]
pub struct InstalledBuild {
    /// Directory the build is installed in.
    pub root: PathBuf,
    /// The manifest the build was installed from.
    pub manifest: Arc<dyn ChunkManifest>,
}

/// Per-build lookup computed once at construction.
struct SourceBuildIndex {
    root: PathBuf,
    manifest: Arc<dyn ChunkManifest>,
    /// Required chunks this build can rebuild from what is on disk.
    producible: HashSet<ChunkId>,
    fragments: HashMap<ChunkId, Vec<FragmentDescriptor>>,
}

#[derive(Default)]
struct SourceState {
    placed_in_store: HashSet<ChunkId>,
    failed_chunks: HashSet<ChunkId>,
    runtime_requests: HashSet<ChunkId>,
    /// Failures not yet reported through the callback.
    unavailable: HashSet<ChunkId>,
}

/// The build file currently held open by a load.
struct OpenFile {
    relative: PathBuf,
    full: PathBuf,
    file: File,
    len: u64,
}

/// Chunk source that rebuilds chunks from installed builds.
pub struct InstallChunkSource {
    config: InstallSourceConfig,
    store: Arc<dyn ChunkStore>,
    tracker: Arc<dyn ReferenceTracker>,
    builds: Vec<SourceBuildIndex>,
    available: HashSet<ChunkId>,
    state: Mutex<SourceState>,
    repeat_tx: mpsc::UnboundedSender<ChunkId>,
    repeat_rx: Mutex<mpsc::UnboundedReceiver<ChunkId>>,
    paused: AtomicBool,
    aborted: AtomicBool,
    unavailable_callback: Mutex<Option<UnavailableChunksCallback>>,
    stats: InstallSourceStats,
    events: EventBus,
}

impl InstallChunkSource {
    /// Index `builds` against the chunks the target build `required`.
    ///
    /// Only chunks that are both required and producible from some build's
    /// files become available.
    pub fn new(
        config: InstallSourceConfig,
        store: Arc<dyn ChunkStore>,
        tracker: Arc<dyn ReferenceTracker>,
        builds: Vec<InstalledBuild>,
        required: &HashSet<ChunkId>,
    ) -> Self {
        let builds: Vec<SourceBuildIndex> = builds
            .into_iter()
            .map(|build| {
                let mut producible = build
                    .manifest
                    .enumerate_producible_chunks(&build.root, required);
                producible.retain(|id| required.contains(id));
                let fragments = producible
                    .iter()
                    .map(|id| (*id, build.manifest.fragments(id)))
                    .collect();
                debug!(
                    root = %build.root.display(),
                    producible = producible.len(),
                    "indexed installed build"
                );
                SourceBuildIndex {
                    root: build.root,
                    manifest: build.manifest,
                    producible,
                    fragments,
                }
            })
            .collect();

        let available: HashSet<ChunkId> = builds
            .iter()
            .flat_map(|b| b.producible.iter().copied())
            .collect();
        info!(
            builds = builds.len(),
            required = required.len(),
            available = available.len(),
            "install chunk source ready"
        );

        let (repeat_tx, repeat_rx) = mpsc::unbounded_channel();
        Self {
            config: config.clamped(),
            store,
            tracker,
            builds,
            available,
            state: Mutex::new(SourceState::default()),
            repeat_tx,
            repeat_rx: Mutex::new(repeat_rx),
            paused: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            unavailable_callback: Mutex::new(None),
            stats: InstallSourceStats::default(),
            events: EventBus::new(),
        }
    }

    /// Emit batch and load events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Current activity counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Chunks this source has placed in the store and not been asked to
    /// repeat.
    pub fn placed_chunks(&self) -> HashSet<ChunkId> {
        self.lock_state().placed_in_store.clone()
    }

    /// Chunks that failed to load this session.
    pub fn failed_chunks(&self) -> HashSet<ChunkId> {
        self.lock_state().failed_chunks.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().expect("install source state lock poisoned")
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn wait_while_paused(&self) {
        while self.paused.load(Ordering::Acquire) && !self.is_aborted() {
            std::thread::sleep(PAUSE_POLL_INTERVAL);
        }
    }

    /// Rebuild `id` from an installed build and place it in the store.
    ///
    /// Returns immediately if the chunk was already placed. Failures other
    /// than [`ChunkLoadError::Aborted`] are remembered for the session and
    /// queued for the unavailable callback.
    #[tracing::instrument(skip(self))]
    pub fn load_from_build(&self, id: &ChunkId) -> Result<(), ChunkLoadError> {
        {
            let state = self.lock_state();
            if state.placed_in_store.contains(id) {
                trace!("chunk already placed");
                return Ok(());
            }
            if state.failed_chunks.contains(id) {
                return Err(ChunkLoadError::NotFound);
            }
        }
        if !self.available.contains(id) {
            return Err(ChunkLoadError::NotFound);
        }

        self.events.emit(ChunkLoadStarted { chunk_id: *id });
        let mut bytes_read = 0u64;
        let result = self.rebuild(id, &mut bytes_read);

        let outcome = match &result {
            Ok(_) => LoadOutcome::Success,
            Err(e) => e.outcome(),
        };
        let result = match result {
            Ok(chunk) => {
                self.lock_state().placed_in_store.insert(*id);
                self.store.put(*id, chunk);
                self.stats.record_recycled();
                debug!(bytes_read, "recycled chunk from installed build");
                Ok(())
            }
            Err(ChunkLoadError::Aborted) => {
                debug!("chunk load aborted");
                Err(ChunkLoadError::Aborted)
            }
            Err(e) => {
                warn!(error = %e, "failed to recycle chunk");
                let mut state = self.lock_state();
                state.failed_chunks.insert(*id);
                state.unavailable.insert(*id);
                drop(state);
                self.stats.record_failed();
                Err(e)
            }
        };

        self.events.emit(ChunkLoadCompleted {
            chunk_id: *id,
            outcome,
            bytes_read,
        });
        result
    }

    /// Read and verify `id`. Nothing is committed here.
    fn rebuild(&self, id: &ChunkId, bytes_read: &mut u64) -> Result<ChunkDataAccess, ChunkLoadError> {
        let (build, hashes) = self
            .builds
            .iter()
            .filter(|b| b.producible.contains(id))
            .find_map(|b| b.manifest.chunk_hashes(id).map(|h| (b, h)))
            .ok_or(ChunkLoadError::NotFound)?;
        if hashes.is_empty() {
            return Err(ChunkLoadError::MissingHashInfo);
        }

        let mut fragments = build
            .fragments
            .get(id)
            .filter(|fragments| !fragments.is_empty())
            .cloned()
            .ok_or(ChunkLoadError::MissingPartInfo)?;
        fragments.sort_by(|a, b| (&a.path, a.file_offset).cmp(&(&b.path, b.file_offset)));

        let chunk_size = fragments
            .iter()
            .map(FragmentDescriptor::chunk_end)
            .max()
            .and_then(|end| u32::try_from(end).ok())
            .ok_or(ChunkLoadError::MissingPartInfo)?;

        let chunk = ChunkDataAccess::new(chunk_size as usize);
        {
            let mut lock = chunk.acquire_lock();
            let mut open: Option<OpenFile> = None;
            for fragment in &fragments {
                self.wait_while_paused();
                if self.is_aborted() {
                    return Err(ChunkLoadError::Aborted);
                }

                if open.as_ref().is_none_or(|o| o.relative != fragment.path) {
                    open = Some(open_build_file(&build.root, &fragment.path)?);
                }
                let Some(current) = open.as_mut() else {
                    continue;
                };
                read_fragment(current, fragment, &mut lock.data)?;
                *bytes_read += u64::from(fragment.size);
                self.stats.record_read(u64::from(fragment.size));
            }

            if !hashes.matches(&lock.data) {
                return Err(ChunkLoadError::HashCheckFailed);
            }
            lock.header = verified_header(id, &hashes, chunk_size);
        }
        Ok(chunk)
    }

    /// Un-mark every id that was asked to be delivered again.
    fn drain_repeat_requirements(&self) {
        let mut rx = self.repeat_rx.lock().expect("repeat queue lock poisoned");
        let mut state = self.lock_state();
        while let Ok(id) = rx.try_recv() {
            if state.placed_in_store.remove(&id) {
                trace!(%id, "chunk marked for reload");
            }
        }
    }

    /// Ids to load for a `get` of `requested`, in load order.
    fn plan_batch(&self, requested: &ChunkId) -> Vec<ChunkId> {
        let slack = self.store.slack();
        let batch_size = slack.clamp(
            self.config.batch_fetch_minimum,
            self.config.batch_fetch_maximum,
        );

        let state = self.lock_state();
        let wanted = |id: &ChunkId| {
            self.available.contains(id)
                && (!self.config.chunk_ignore_set.contains(id) || state.runtime_requests.contains(id))
        };
        let mut plan: Vec<ChunkId> = self
            .tracker
            .next_references(batch_size, &wanted)
            .into_iter()
            .filter(|id| {
                id != requested
                    && !state.placed_in_store.contains(id)
                    && !state.failed_chunks.contains(id)
            })
            .collect();
        drop(state);

        plan.insert(0, *requested);
        // Loading more than the free slots would evict what this batch just
        // placed. With no slack at all, the requested chunk still loads.
        plan.truncate(batch_size.min(slack.max(1)));
        trace!(slack, batch_size, planned = plan.len(), "planned batch");
        plan
    }

    /// Report accumulated failures through the callback.
    fn flush_unavailable(&self) {
        let unavailable = std::mem::take(&mut self.lock_state().unavailable);
        if unavailable.is_empty() {
            return;
        }

        info!(count = unavailable.len(), "chunks unavailable from installed builds");
        let mut chunks: Vec<ChunkId> = unavailable.iter().copied().collect();
        chunks.sort();
        self.events.emit(ChunksUnavailable { chunks });

        let callback = self
            .unavailable_callback
            .lock()
            .expect("callback lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(&unavailable);
        }
    }
}

fn open_build_file(root: &Path, relative: &Path) -> Result<OpenFile, ChunkLoadError> {
    let full = root.join(relative);
    let open_fail = |source| ChunkLoadError::OpenFileFail {
        path: full.clone(),
        source,
    };
    let file = File::open(&full).map_err(open_fail)?;
    let len = file.metadata().map_err(open_fail)?.len();
    trace!(path = %full.display(), len, "opened build file");
    Ok(OpenFile {
        relative: relative.to_path_buf(),
        full,
        file,
        len,
    })
}

fn read_fragment(
    open: &mut OpenFile,
    fragment: &FragmentDescriptor,
    buffer: &mut [u8],
) -> Result<(), ChunkLoadError> {
    let too_short = |actual| ChunkLoadError::IncorrectFileSize {
        path: open.full.clone(),
        expected: fragment.file_end(),
        actual,
    };
    if open.len < fragment.file_end() {
        return Err(too_short(open.len));
    }

    let start = fragment.chunk_offset as usize;
    let end = start + fragment.size as usize;
    let read = open
        .file
        .seek(SeekFrom::Start(fragment.file_offset))
        .and_then(|_| open.file.read_exact(&mut buffer[start..end]));
    match read {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(too_short(open.len)),
        Err(source) => Err(ChunkLoadError::OpenFileFail {
            path: open.full.clone(),
            source,
        }),
    }
}

fn verified_header(id: &ChunkId, hashes: &ChunkHashes, size: u32) -> ChunkHeader {
    let mut hash_type = HashFlags::NONE;
    if hashes.rolling.is_some() {
        hash_type.insert(HashFlags::ROLLING);
    }
    if hashes.sha.is_some() {
        hash_type.insert(HashFlags::SHA1);
    }
    ChunkHeader {
        guid: *id,
        hash_type,
        rolling_hash: hashes.rolling.unwrap_or_default(),
        sha_hash: hashes.sha.unwrap_or_default(),
        data_size_compressed: size,
        data_size_uncompressed: size,
        stored_as: StorageFlags::Uncompressed,
    }
}

impl ChunkSource for InstallChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>> {
        if let Some(chunk) = self.store.get(id) {
            return Some(chunk);
        }
        if !self.available.contains(id) {
            return None;
        }

        self.drain_repeat_requirements();
        let plan = self.plan_batch(id);
        self.stats.record_batch();
        debug!(%id, batch = plan.len(), "loading batch from installed builds");
        self.events.emit(BatchStarted {
            chunks: plan.clone(),
        });

        for chunk_id in &plan {
            if self.is_aborted() {
                debug!("aborted, abandoning rest of batch");
                break;
            }
            // Failures are recorded and reported through the callback.
            let _ = self.load_from_build(chunk_id);
        }

        let chunk = self.store.get(id);
        self.flush_unavailable();
        chunk
    }

    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
        let (accepted, unhandled): (HashSet<ChunkId>, HashSet<ChunkId>) =
            ids.into_iter().partition(|id| self.available.contains(id));
        debug!(
            accepted = accepted.len(),
            unhandled = unhandled.len(),
            "runtime requirements added"
        );
        self.lock_state().runtime_requests.extend(accepted);
        unhandled
    }

    fn add_repeat_requirement(&self, id: &ChunkId) -> bool {
        if !self.available.contains(id) {
            return false;
        }
        trace!(%id, "repeat requirement queued");
        self.repeat_tx.send(*id).is_ok()
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        *self
            .unavailable_callback
            .lock()
            .expect("callback lock poisoned") = Some(callback);
    }

    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.available.clone()
    }

    fn harvest_remaining_chunks_from_file(&self, path: &Path) {
        let referenced = self.tracker.referenced_chunks();
        for build in &self.builds {
            let Ok(relative) = path.strip_prefix(&build.root) else {
                continue;
            };

            let mut harvest: Vec<ChunkId> = {
                let state = self.lock_state();
                build
                    .fragments
                    .iter()
                    .filter(|(id, fragments)| {
                        referenced.contains(*id)
                            && !state.placed_in_store.contains(*id)
                            && !state.failed_chunks.contains(*id)
                            && fragments.iter().any(|f| f.path == relative)
                    })
                    .map(|(id, _)| *id)
                    .collect()
            };
            harvest.sort_by_key(|id| (self.tracker.next_usage(id).unwrap_or(usize::MAX), *id));
            debug!(
                path = %path.display(),
                count = harvest.len(),
                "harvesting chunks from file"
            );

            for id in &harvest {
                if self.is_aborted() {
                    break;
                }
                // Failures are recorded and reported through the callback.
                let _ = self.load_from_build(id);
            }
        }
        self.flush_unavailable();
    }
}

impl Controllable for InstallChunkSource {
    fn set_paused(&self, paused: bool) {
        debug!(paused, "install source pause state changed");
        self.paused.store(paused, Ordering::Release);
    }

    fn abort(&self) {
        info!("install source aborted");
        self.aborted.store(true, Ordering::Release);
    }
}
