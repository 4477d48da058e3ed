//! Build manifests and chunk reference tracking.
//!
//! This crate provides:
//! - [`ChunkManifest`] — the read-only view the install source needs of a
//!   build manifest: chunk hashes, the file fragments that rebuild a chunk,
//!   and which required chunks an installed build can produce.
//! - [`BuildManifest`] — a concrete manifest (files as ordered chunk parts
//!   plus per-chunk hash info), persisted with postcard.
//! - [`ReferenceTracker`] / [`ChunkReferenceTracker`] — the ordered list of
//!   chunk references the installer will consume, used for prefetch
//!   planning and eviction decisions.

mod error;
mod manifest;
mod tracker;

use std::collections::HashSet;
use std::path::Path;

use salvage_types::{ChunkHashes, ChunkId, FragmentDescriptor};

pub use error::ManifestError;
pub use manifest::{
    BuildManifest, ChunkInfo, ChunkPart, FileManifest, MANIFEST_VERSION, deserialize_manifest,
    read_manifest_file, serialize_manifest, write_manifest_file,
};
pub use tracker::{ChunkReferenceTracker, ReferenceTracker};

/// Read-only manifest queries used to recycle chunks from an installed build.
pub trait ChunkManifest: Send + Sync {
    /// Verification hashes for `id`, or `None` if the manifest has no
    /// record of the chunk at all.
    fn chunk_hashes(&self, id: &ChunkId) -> Option<ChunkHashes>;

    /// The fragments that rebuild `id` from this build's files.
    ///
    /// Empty unless the fragments cover the whole chunk.
    fn fragments(&self, id: &ChunkId) -> Vec<FragmentDescriptor>;

    /// The subset of `required` this build, installed at `build_root`,
    /// can rebuild from the files actually present on disk.
    fn enumerate_producible_chunks(
        &self,
        build_root: &Path,
        required: &HashSet<ChunkId>,
    ) -> HashSet<ChunkId>;

    /// Every chunk the manifest references.
    fn chunk_ids(&self) -> HashSet<ChunkId>;
}
