//! Replaying a target build through the install source chain.
//!
//! Connects salvage-manifest + salvage-store + salvage-source the way the
//! `salvage` tool does and consumes every chunk reference of the target.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use salvage_integration_tests::{
    Chunk, Harness, HarnessOptions, InstalledFixture, make_chunks, target_manifest,
};
use salvage_source::{ChunkSource, InstallSourceConfig, UnavailableChunksCallback};
use salvage_store::{ChunkDataAccess, ChunkStore};
use salvage_types::events::{BatchStarted, ChunkBooted, ChunkLost};
use salvage_types::{ChunkHeader, ChunkId};

/// Stand-in for a download source holding a fixed set of chunks.
struct PrecomputedSource {
    chunks: HashMap<ChunkId, Vec<u8>>,
    runtime: Mutex<HashSet<ChunkId>>,
    served: Mutex<Vec<ChunkId>>,
}

impl PrecomputedSource {
    fn new(chunks: &[Chunk]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (c.id, c.data.clone())).collect(),
            runtime: Mutex::new(HashSet::new()),
            served: Mutex::new(Vec::new()),
        }
    }
}

impl ChunkSource for PrecomputedSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkDataAccess>> {
        let data = self.chunks.get(id)?;
        self.served.lock().unwrap().push(*id);
        let header = ChunkHeader {
            guid: *id,
            data_size_compressed: data.len() as u32,
            data_size_uncompressed: data.len() as u32,
            ..Default::default()
        };
        Some(Arc::new(ChunkDataAccess::from_parts(header, data.clone())))
    }

    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
        let (mine, rest): (HashSet<ChunkId>, HashSet<ChunkId>) =
            ids.into_iter().partition(|id| self.chunks.contains_key(id));
        self.runtime.lock().unwrap().extend(mine);
        rest
    }

    fn add_repeat_requirement(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    fn set_unavailable_chunks_callback(&self, _callback: UnavailableChunksCallback) {}

    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.chunks.keys().copied().collect()
    }

    fn harvest_remaining_chunks_from_file(&self, _path: &Path) {}
}

/// Twelve chunks; the installed build holds the first eight, with one of
/// them split across two files.
fn twelve_chunk_setup() -> (Vec<Chunk>, InstalledFixture) {
    let c = make_chunks(12, 512, 1);
    let installed = InstalledFixture::write(
        &c,
        vec![
            ("old/app", vec![c[0].whole(), c[1].whole(), c[2].slice(0, 256)]),
            (
                "old/pack",
                vec![c[2].slice(256, 256), c[3].whole(), c[4].whole(), c[5].whole()],
            ),
            ("old/extra", vec![c[6].whole(), c[7].whole()]),
        ],
    );
    (c, installed)
}

fn twelve_chunk_target(c: &[Chunk]) -> salvage_manifest::BuildManifest {
    target_manifest(
        c,
        vec![
            ("bin/app", vec![c[0].id, c[1].id, c[2].id, c[3].id, c[8].id, c[4].id]),
            (
                "data/pack",
                vec![c[5].id, c[0].id, c[6].id, c[9].id, c[7].id, c[10].id, c[11].id, c[2].id],
            ),
        ],
    )
}

// -----------------------------------------------------------------------
// Full replay
// -----------------------------------------------------------------------

#[test]
fn test_replay_serves_every_producible_reference() {
    let (c, installed) = twelve_chunk_setup();
    let harness = Harness::new(
        twelve_chunk_target(&c),
        vec![installed.installed()],
        HarnessOptions {
            capacity: 4,
            ..Default::default()
        },
    );

    let expected_available: HashSet<ChunkId> = c[..8].iter().map(|c| c.id).collect();
    assert_eq!(harness.chain.available_chunks(), expected_available);

    let replay = harness.replay();
    assert_eq!(replay.references, 14);
    assert_eq!(replay.served, 10);
    assert_eq!(replay.missing, 4);
    assert_eq!(replay.mismatched, 0);
    assert_eq!(
        replay.missing_ids,
        c[8..].iter().map(|c| c.id).collect::<HashSet<_>>()
    );

    let stats = harness.install.stats();
    assert_eq!(stats.chunks_failed, 0);
    assert!(stats.chunks_recycled >= 8, "every available chunk loaded at least once");
    assert!(harness.install.failed_chunks().is_empty());
}

#[test]
fn test_lost_chunks_reloaded_through_repeat_requirement() {
    // Target reads A B C A B C; the store holds two chunks and has nowhere
    // to put what it boots.
    let c = make_chunks(3, 256, 40);
    let (a, b, cc) = (&c[0], &c[1], &c[2]);
    let installed = InstalledFixture::write(
        &c,
        vec![
            ("one.bin", vec![a.whole(), b.slice(0, 128)]),
            ("two.bin", vec![b.slice(128, 128), cc.whole()]),
        ],
    );
    let target = target_manifest(&c, vec![("new.bin", vec![a.id, b.id, cc.id, a.id, b.id, cc.id])]);
    let harness = Harness::new(
        target,
        vec![installed.installed()],
        HarnessOptions {
            capacity: 2,
            ..Default::default()
        },
    );
    let mut lost = harness.events.subscribe::<ChunkLost>();
    let mut booted = harness.events.subscribe::<ChunkBooted>();

    let replay = harness.replay();
    assert_eq!(replay.served, 6);
    assert_eq!(replay.mismatched, 0);

    // A is booted to make room for C, then B to make room for A again.
    let lost: Vec<ChunkId> = lost.drain().into_iter().map(|e| e.chunk_id).collect();
    assert_eq!(lost, vec![a.id, b.id]);
    assert!(booted.drain().iter().all(|e| !e.to_overflow));

    let stats = harness.install.stats();
    assert_eq!(stats.batches, 4);
    assert_eq!(stats.chunks_recycled, 5);
    assert_eq!(stats.fragment_reads, 7);
    assert_eq!(stats.bytes_read, 5 * 256);
    assert!(harness.store.is_empty());
}

// -----------------------------------------------------------------------
// Chained sources
// -----------------------------------------------------------------------

#[test]
fn test_fallback_source_fills_gaps() {
    let (c, installed) = twelve_chunk_setup();
    let fallback = Arc::new(PrecomputedSource::new(&c[8..]));
    let harness = Harness::new(
        twelve_chunk_target(&c),
        vec![installed.installed()],
        HarnessOptions {
            capacity: 4,
            fallbacks: vec![fallback.clone() as Arc<dyn ChunkSource>],
            ..Default::default()
        },
    );

    let all: HashSet<ChunkId> = c.iter().map(|c| c.id).collect();
    assert_eq!(harness.chain.available_chunks(), all);
    assert!(harness.chain.add_runtime_requirements(all).is_empty());
    assert_eq!(fallback.runtime.lock().unwrap().len(), 4);

    let replay = harness.replay();
    assert_eq!(replay.served, 14);
    assert_eq!(replay.missing, 0);
    assert_eq!(replay.mismatched, 0);

    let from_fallback: HashSet<ChunkId> = fallback.served.lock().unwrap().iter().copied().collect();
    assert_eq!(
        from_fallback,
        c[8..].iter().map(|c| c.id).collect::<HashSet<_>>()
    );
}

#[test]
fn test_ignored_chunks_not_prefetched() {
    let (c, installed) = twelve_chunk_setup();
    let config = InstallSourceConfig {
        chunk_ignore_set: [c[1].id, c[3].id].into_iter().collect(),
        ..Default::default()
    };
    let harness = Harness::new(
        twelve_chunk_target(&c),
        vec![installed.installed()],
        HarnessOptions {
            capacity: 16,
            config,
            ..Default::default()
        },
    );
    let mut batches = harness.events.subscribe::<BatchStarted>();

    let replay = harness.replay();
    assert_eq!(replay.served, 10);

    let batches = batches.drain();
    assert_eq!(
        batches[0].chunks,
        vec![c[0].id, c[2].id, c[4].id, c[5].id, c[6].id, c[7].id]
    );
    // Ignored chunks still load when the installer asks for them.
    assert_eq!(batches[1].chunks, vec![c[1].id]);
    assert_eq!(batches[2].chunks, vec![c[3].id]);
    assert_eq!(batches.len(), 3);
}

#[test]
fn test_unavailable_callback_reaches_chain_listener() {
    let (c, installed) = twelve_chunk_setup();
    installed.corrupt("old/extra", 10);
    let harness = Harness::new(
        twelve_chunk_target(&c),
        vec![installed.installed()],
        HarnessOptions::default(),
    );
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    harness
        .chain
        .set_unavailable_chunks_callback(Arc::new(move |ids: &HashSet<ChunkId>| {
            sink.lock().unwrap().push(ids.clone());
        }));

    let replay = harness.replay();
    assert!(replay.missing_ids.contains(&c[6].id));
    assert_eq!(replay.mismatched, 0);

    let reported: HashSet<ChunkId> = reports.lock().unwrap().iter().flatten().copied().collect();
    assert_eq!(reported, HashSet::from([c[6].id]));
}
