//! Manifests persisted to disk and read back into the pipeline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use salvage_integration_tests::{
    Harness, HarnessOptions, InstalledFixture, make_chunks, target_manifest,
};
use salvage_manifest::{
    ChunkManifest, ChunkReferenceTracker, MANIFEST_VERSION, ManifestError, ReferenceTracker,
    deserialize_manifest, read_manifest_file, serialize_manifest, write_manifest_file,
};
use salvage_source::{ChunkSource, InstalledBuild};
use salvage_types::ChunkId;
use tempfile::TempDir;

#[test]
fn test_persisted_manifests_drive_replay() {
    let c = make_chunks(6, 300, 11);
    let installed = InstalledFixture::write(
        &c,
        vec![
            ("content/a.pak", vec![c[0].whole(), c[1].whole(), c[2].slice(0, 150)]),
            ("content/b.pak", vec![c[2].slice(150, 150), c[3].whole()]),
        ],
    );
    let target = target_manifest(
        &c,
        vec![("content/new.pak", c.iter().map(|c| c.id).collect())],
    );

    let dir = TempDir::new().unwrap();
    let installed_path = dir.path().join("installed.manifest");
    let target_path = dir.path().join("target.manifest");
    write_manifest_file(&installed_path, &installed.manifest).unwrap();
    write_manifest_file(&target_path, &target).unwrap();

    let reloaded_installed = read_manifest_file(&installed_path).unwrap();
    assert_eq!(&reloaded_installed, installed.manifest.as_ref());
    assert_eq!(
        reloaded_installed.fragments(&c[2].id),
        installed.manifest.fragments(&c[2].id)
    );

    let harness = Harness::new(
        read_manifest_file(&target_path).unwrap(),
        vec![InstalledBuild {
            root: installed.root().to_path_buf(),
            manifest: Arc::new(reloaded_installed),
        }],
        HarnessOptions::default(),
    );
    let replay = harness.replay();
    assert_eq!(replay.references, 6);
    assert_eq!(replay.served, 4);
    assert_eq!(replay.mismatched, 0);
    assert_eq!(
        replay.missing_ids,
        HashSet::from([c[4].id, c[5].id])
    );
}

#[test]
fn test_manifest_version_mismatch_rejected() {
    let c = make_chunks(1, 64, 3);
    let target = target_manifest(&c, vec![("only.bin", vec![c[0].id])]);
    let mut bytes = serialize_manifest(&target).unwrap();
    assert_eq!(bytes[0], MANIFEST_VERSION);
    bytes[0] = MANIFEST_VERSION + 1;

    match deserialize_manifest(&bytes) {
        Err(ManifestError::UnsupportedVersion { found, supported }) => {
            assert_eq!(found, MANIFEST_VERSION + 1);
            assert_eq!(supported, MANIFEST_VERSION);
        }
        other => panic!("expected UnsupportedVersion, got {other:?}"),
    }
}

#[test]
fn test_file_subset_limits_required_chunks() {
    let c = make_chunks(4, 64, 5);
    let target = target_manifest(
        &c,
        vec![
            ("bin/tool", vec![c[0].id, c[1].id]),
            ("data/blob", vec![c[2].id, c[3].id, c[0].id]),
        ],
    );

    let only_tool: HashSet<PathBuf> = HashSet::from([PathBuf::from("bin/tool")]);
    let tracker = ChunkReferenceTracker::from_manifest(&target, &only_tool);
    assert_eq!(tracker.referenced_chunks(), HashSet::from([c[0].id, c[1].id]));
    assert_eq!(tracker.remaining_references(), 2);
}

#[test]
fn test_modified_installed_file_not_producible() {
    let c = make_chunks(4, 128, 9);
    let installed = InstalledFixture::write(
        &c,
        vec![
            ("stable.bin", vec![c[0].whole(), c[1].whole()]),
            ("patched.bin", vec![c[2].whole(), c[3].whole()]),
        ],
    );
    // Someone patched the file in place; its size no longer matches.
    let mut contents = std::fs::read(installed.path("patched.bin")).unwrap();
    contents.push(0);
    std::fs::write(installed.path("patched.bin"), contents).unwrap();

    let required: HashSet<ChunkId> = c.iter().map(|c| c.id).collect();
    assert_eq!(
        installed
            .manifest
            .enumerate_producible_chunks(installed.root(), &required),
        HashSet::from([c[0].id, c[1].id])
    );

    let target = target_manifest(&c, vec![("new.bin", c.iter().map(|c| c.id).collect())]);
    let harness = Harness::new(target, vec![installed.installed()], HarnessOptions::default());
    assert_eq!(
        harness.chain.available_chunks(),
        HashSet::from([c[0].id, c[1].id])
    );
    assert_eq!(harness.replay().served, 2);
}
