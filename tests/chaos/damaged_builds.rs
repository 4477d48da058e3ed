//! Recycling from damaged installations.
//!
//! Installed files are corrupted or truncated behind the source's back;
//! the pipeline must never serve data that fails verification and must
//! only lose the chunks that were actually damaged.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use salvage_integration_tests::{
    Chunk, Harness, HarnessOptions, InstalledFixture, make_chunks, target_manifest,
};
use salvage_source::{ChunkSource, Controllable};
use salvage_store::ChunkStore;
use salvage_types::ChunkId;

const CHUNK_SIZE: usize = 256;
const PER_FILE: usize = 8;
const FILES: [&str; 3] = ["pack0.bin", "pack1.bin", "pack2.bin"];

/// 24 chunks, eight whole chunks per file.
fn packed_build() -> (Vec<Chunk>, InstalledFixture) {
    let c = make_chunks(FILES.len() * PER_FILE, CHUNK_SIZE, 0xC0FFEE);
    let files = FILES
        .iter()
        .enumerate()
        .map(|(f, name)| {
            let parts = c[f * PER_FILE..(f + 1) * PER_FILE]
                .iter()
                .map(Chunk::whole)
                .collect();
            (*name, parts)
        })
        .collect();
    let installed = InstalledFixture::write(&c, files);
    (c, installed)
}

/// Every chunk once in a scrambled order, then every third chunk again.
fn scrambled_order(c: &[Chunk], seed: u32) -> Vec<ChunkId> {
    let mut order: Vec<ChunkId> = c.iter().map(|c| c.id).collect();
    let mut state = seed;
    for i in (1..order.len()).rev() {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        order.swap(i, (state >> 16) as usize % (i + 1));
    }
    let repeats: Vec<ChunkId> = order.iter().step_by(3).copied().collect();
    order.extend(repeats);
    order
}

fn harness_for(c: &[Chunk], installed: &InstalledFixture, capacity: usize) -> Harness {
    let target = target_manifest(c, vec![("new.bin", scrambled_order(c, 99))]);
    Harness::new(
        target,
        vec![installed.installed()],
        HarnessOptions {
            capacity,
            ..Default::default()
        },
    )
}

#[test]
fn test_random_corruption_never_serves_bad_data() {
    let (c, installed) = packed_build();

    // Pick distinct damage sites so no flip undoes another.
    let mut sites = BTreeSet::new();
    let mut state: u32 = 0x5EED;
    while sites.len() < 6 {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        let file = (state >> 8) as usize % FILES.len();
        let offset = (state >> 12) as usize % (PER_FILE * CHUNK_SIZE);
        sites.insert((file, offset));
    }
    let mut damaged = HashSet::new();
    for &(file, offset) in &sites {
        installed.corrupt(FILES[file], offset);
        damaged.insert(c[file * PER_FILE + offset / CHUNK_SIZE].id);
    }

    let harness = harness_for(&c, &installed, 6);
    let replay = harness.replay();

    assert_eq!(replay.mismatched, 0);
    assert_eq!(replay.missing_ids, damaged);
    assert_eq!(harness.install.failed_chunks(), damaged);
    assert_eq!(harness.install.stats().chunks_failed as usize, damaged.len());
    assert_eq!(replay.served + replay.missing, replay.references);
}

#[test]
fn test_truncation_after_indexing_fails_only_cut_chunks() {
    let (c, installed) = packed_build();
    let harness = harness_for(&c, &installed, 6);
    assert_eq!(harness.chain.available_chunks().len(), c.len());

    // Keep three and a half chunks of the middle file.
    installed.truncate(FILES[1], 3 * CHUNK_SIZE + CHUNK_SIZE / 2);
    let cut: HashSet<ChunkId> = c[PER_FILE + 3..2 * PER_FILE].iter().map(|c| c.id).collect();

    let replay = harness.replay();
    assert_eq!(replay.mismatched, 0);
    assert_eq!(replay.missing_ids, cut);
    assert_eq!(harness.install.failed_chunks(), cut);
}

#[test]
fn test_deleted_file_after_indexing() {
    let (c, installed) = packed_build();
    let harness = harness_for(&c, &installed, 4);
    std::fs::remove_file(installed.path(FILES[2])).unwrap();
    let gone: HashSet<ChunkId> = c[2 * PER_FILE..].iter().map(|c| c.id).collect();

    let replay = harness.replay();
    assert_eq!(replay.mismatched, 0);
    assert_eq!(replay.missing_ids, gone);
    assert_eq!(replay.served, replay.references - replay.missing);
}

#[test]
#[ntest::timeout(10000)]
fn test_abort_during_paused_replay() {
    let (c, installed) = packed_build();
    let harness = Arc::new(harness_for(&c, &installed, 6));
    harness.install.set_paused(true);

    let worker = {
        let harness = harness.clone();
        std::thread::spawn(move || harness.replay())
    };

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(harness.install.stats().fragment_reads, 0);

    harness.install.abort();
    let replay = worker.join().unwrap();

    assert_eq!(replay.served, 0);
    assert_eq!(replay.missing, replay.references);
    assert!(harness.store.is_empty());
    assert!(harness.install.failed_chunks().is_empty(), "aborts are not failures");
    assert_eq!(harness.install.stats().chunks_recycled, 0);
}
