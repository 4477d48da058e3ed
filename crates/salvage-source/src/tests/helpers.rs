//! Shared test utilities for salvage-source tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use salvage_manifest::{
    BuildManifest, ChunkInfo, ChunkManifest, ChunkPart, ChunkReferenceTracker, FileManifest,
    ReferenceTracker,
};
use salvage_store::{ChunkDataAccess, ChunkStore, LostChunkCallback, MemoryChunkStore, ReferenceEvictionPolicy};
use salvage_types::{ChunkHashes, ChunkId, FragmentDescriptor, ShaHash, rolling_hash};
use tempfile::TempDir;

use crate::{InstallChunkSource, InstallSourceConfig, InstalledBuild};

pub const G0: ChunkId = ChunkId::from_u128(0x00);
pub const G1: ChunkId = ChunkId::from_u128(0x01);
pub const G2: ChunkId = ChunkId::from_u128(0x02);
pub const G5: ChunkId = ChunkId::from_u128(0x05);
pub const G9: ChunkId = ChunkId::from_u128(0x09);

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF ^ seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

pub fn part(chunk_id: ChunkId, offset: u32, size: u32) -> ChunkPart {
    ChunkPart {
        chunk_id,
        offset,
        size,
    }
}

/// Manifest info recording both hashes of `data`.
pub fn chunk_info(chunk_id: ChunkId, data: &[u8]) -> ChunkInfo {
    ChunkInfo {
        chunk_id,
        rolling_hash: Some(rolling_hash(data)),
        sha_hash: ShaHash::of(data),
        window_size: data.len() as u32,
    }
}

/// An installed build written to a temporary directory.
pub struct TestBuild {
    pub dir: TempDir,
    pub manifest: Arc<BuildManifest>,
    pub chunks: HashMap<ChunkId, Vec<u8>>,
}

impl TestBuild {
    /// Write every file as the concatenation of its chunk parts.
    pub fn write(chunks: Vec<(ChunkId, Vec<u8>)>, files: Vec<(&str, Vec<ChunkPart>)>) -> Self {
        let infos = chunks.iter().map(|(id, data)| chunk_info(*id, data)).collect();
        Self::write_with_infos(chunks, files, infos)
    }

    /// Like [`write`](Self::write) but with caller-supplied manifest infos.
    pub fn write_with_infos(
        chunks: Vec<(ChunkId, Vec<u8>)>,
        files: Vec<(&str, Vec<ChunkPart>)>,
        infos: Vec<ChunkInfo>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let chunks: HashMap<ChunkId, Vec<u8>> = chunks.into_iter().collect();

        let mut file_manifests = Vec::new();
        for (name, parts) in files {
            let mut contents = Vec::new();
            for p in &parts {
                let data = &chunks[&p.chunk_id];
                contents.extend_from_slice(&data[p.offset as usize..(p.offset + p.size) as usize]);
            }
            std::fs::write(dir.path().join(name), contents).unwrap();
            file_manifests.push(FileManifest {
                filename: PathBuf::from(name),
                chunk_parts: parts,
            });
        }

        let manifest = Arc::new(BuildManifest::new("1.0.0", file_manifests, infos));
        Self {
            dir,
            manifest,
            chunks,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn installed(&self) -> InstalledBuild {
        InstalledBuild {
            root: self.root().to_path_buf(),
            manifest: self.manifest.clone(),
        }
    }
}

/// The reference layout:
///
/// - `a.bin` = G0 (100 bytes) + G1[0..500]
/// - `b.bin` = G1[500..1000] + G5 + G9 + G2 (300 bytes each)
///
/// so G1 is rebuilt from `[a.bin @100, chunk 0, 500]` and
/// `[b.bin @0, chunk 500, 500]`.
pub fn scenario_build() -> TestBuild {
    TestBuild::write(
        vec![
            (G0, test_data(100, 0)),
            (G1, test_data(1000, 1)),
            (G5, test_data(300, 5)),
            (G9, test_data(300, 9)),
            (G2, test_data(300, 2)),
        ],
        vec![
            ("a.bin", vec![part(G0, 0, 100), part(G1, 0, 500)]),
            (
                "b.bin",
                vec![
                    part(G1, 500, 500),
                    part(G5, 0, 300),
                    part(G9, 0, 300),
                    part(G2, 0, 300),
                ],
            ),
        ],
    )
}

/// Chunk store wrapper that counts puts and can run a hook after each.
pub struct CountingStore {
    inner: MemoryChunkStore,
    pub puts: Mutex<Vec<ChunkId>>,
    pub on_put: Mutex<Option<Box<dyn Fn(&ChunkId) + Send + Sync>>>,
}

impl CountingStore {
    pub fn new(capacity: usize, tracker: Arc<dyn ReferenceTracker>) -> Self {
        Self {
            inner: MemoryChunkStore::new(capacity, Arc::new(ReferenceEvictionPolicy::new(tracker))),
            puts: Mutex::new(Vec::new()),
            on_put: Mutex::new(None),
        }
    }

    pub fn put_ids(&self) -> Vec<ChunkId> {
        self.puts.lock().unwrap().clone()
    }
}

impl ChunkStore for CountingStore {
    fn put(&self, id: ChunkId, data: ChunkDataAccess) {
        self.puts.lock().unwrap().push(id);
        self.inner.put(id, data);
        if let Some(hook) = self.on_put.lock().unwrap().as_ref() {
            hook(&id);
        }
    }

    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>> {
        self.inner.get(id)
    }

    fn remove(&self, id: &ChunkId) -> Option<ChunkDataAccess> {
        self.inner.remove(id)
    }

    fn contains(&self, id: &ChunkId) -> bool {
        self.inner.contains(id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn set_lost_chunk_callback(&self, callback: LostChunkCallback) {
        self.inner.set_lost_chunk_callback(callback);
    }
}

/// Manifest wrapper that can hide hashes or fragments of chosen chunks
/// while still reporting them producible.
pub struct StubManifest {
    pub inner: Arc<BuildManifest>,
    pub no_hashes: HashSet<ChunkId>,
    /// Chunks whose hash info is absent altogether.
    pub unknown_hashes: HashSet<ChunkId>,
    pub no_fragments: HashSet<ChunkId>,
    pub fragment_queries: AtomicUsize,
}

impl StubManifest {
    pub fn new(inner: Arc<BuildManifest>) -> Self {
        Self {
            inner,
            no_hashes: HashSet::new(),
            unknown_hashes: HashSet::new(),
            no_fragments: HashSet::new(),
            fragment_queries: AtomicUsize::new(0),
        }
    }
}

impl ChunkManifest for StubManifest {
    fn chunk_hashes(&self, id: &ChunkId) -> Option<ChunkHashes> {
        if self.no_hashes.contains(id) {
            return Some(ChunkHashes::default());
        }
        if self.unknown_hashes.contains(id) {
            return None;
        }
        self.inner.chunk_hashes(id)
    }

    fn fragments(&self, id: &ChunkId) -> Vec<FragmentDescriptor> {
        self.fragment_queries.fetch_add(1, Ordering::SeqCst);
        if self.no_fragments.contains(id) {
            return Vec::new();
        }
        self.inner.fragments(id)
    }

    fn enumerate_producible_chunks(
        &self,
        build_root: &Path,
        required: &HashSet<ChunkId>,
    ) -> HashSet<ChunkId> {
        let mut producible = self.inner.enumerate_producible_chunks(build_root, required);
        producible.extend(self.no_fragments.iter().filter(|id| required.contains(*id)));
        producible
    }

    fn chunk_ids(&self) -> HashSet<ChunkId> {
        self.inner.chunk_ids()
    }
}

pub fn tracker(order: &[ChunkId]) -> Arc<ChunkReferenceTracker> {
    Arc::new(ChunkReferenceTracker::from_references(order.to_vec()))
}

pub fn required(ids: &[ChunkId]) -> HashSet<ChunkId> {
    ids.iter().copied().collect()
}

/// A source over `builds` with a counting store of `capacity`.
pub fn make_source(
    config: InstallSourceConfig,
    capacity: usize,
    order: &[ChunkId],
    builds: Vec<InstalledBuild>,
) -> (Arc<InstallChunkSource>, Arc<CountingStore>) {
    let tracker = tracker(order);
    let store = Arc::new(CountingStore::new(capacity, tracker.clone()));
    let source = InstallChunkSource::new(config, store.clone(), tracker, builds, &required(order));
    (Arc::new(source), store)
}

/// Collects every set passed to the unavailable callback.
pub fn capture_unavailable(
    source: &dyn crate::ChunkSource,
) -> Arc<Mutex<Vec<HashSet<ChunkId>>>> {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    source.set_unavailable_chunks_callback(Arc::new(move |ids: &HashSet<ChunkId>| {
        sink.lock().unwrap().push(ids.clone());
    }));
    reports
}
