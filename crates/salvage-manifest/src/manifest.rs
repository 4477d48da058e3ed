//! Concrete build manifest and its postcard persistence.
//!
//! A [`BuildManifest`] lists every file of a build as an ordered sequence of
//! [`ChunkPart`]s, plus one [`ChunkInfo`] per chunk carrying its
//! verification hashes and uncompressed size. Reading a file's parts in
//! order reproduces the file; collecting every part of one chunk across all
//! files reproduces the chunk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use salvage_types::{ChunkHashes, ChunkId, FragmentDescriptor, ShaHash};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::ChunkManifest;
use crate::error::ManifestError;

/// Current manifest format version.
pub const MANIFEST_VERSION: u8 = 1;

/// A slice of one chunk that appears, in order, inside a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPart {
    /// The chunk the bytes belong to.
    pub chunk_id: ChunkId,
    /// Offset of the slice within the chunk.
    pub offset: u32,
    /// Length of the slice.
    pub size: u32,
}

/// One file of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// Path relative to the build root.
    pub filename: PathBuf,
    /// The file's contents as consecutive chunk slices.
    pub chunk_parts: Vec<ChunkPart>,
}

impl FileManifest {
    /// Size of the file described by the parts.
    pub fn file_size(&self) -> u64 {
        self.chunk_parts.iter().map(|p| u64::from(p.size)).sum()
    }
}

/// Hash and size information for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// The chunk's identifier.
    pub chunk_id: ChunkId,
    /// Weak rolling hash, if the generator recorded one.
    pub rolling_hash: Option<u64>,
    /// Strong SHA-1 digest; all zeros when not recorded.
    pub sha_hash: ShaHash,
    /// Uncompressed size of the chunk.
    pub window_size: u32,
}

impl ChunkInfo {
    /// The recorded hashes, treating an all-zero digest as absent.
    pub fn hashes(&self) -> ChunkHashes {
        ChunkHashes {
            rolling: self.rolling_hash,
            sha: (!self.sha_hash.is_zero()).then_some(self.sha_hash),
        }
    }
}

/// Serialized form of a [`BuildManifest`] (everything but the lookups).
#[derive(Clone, Serialize, Deserialize)]
struct ManifestContent {
    version: u8,
    build_version: String,
    files: Vec<FileManifest>,
    chunks: Vec<ChunkInfo>,
}

/// A build manifest with lookup tables for chunk and file queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ManifestContent", into = "ManifestContent")]
pub struct BuildManifest {
    version: u8,
    build_version: String,
    files: Vec<FileManifest>,
    chunks: Vec<ChunkInfo>,
    chunk_lookup: HashMap<ChunkId, usize>,
    file_lookup: HashMap<PathBuf, usize>,
}

impl From<ManifestContent> for BuildManifest {
    fn from(content: ManifestContent) -> Self {
        let chunk_lookup = content
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.chunk_id, i))
            .collect();
        let file_lookup = content
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.filename.clone(), i))
            .collect();
        Self {
            version: content.version,
            build_version: content.build_version,
            files: content.files,
            chunks: content.chunks,
            chunk_lookup,
            file_lookup,
        }
    }
}

impl From<BuildManifest> for ManifestContent {
    fn from(manifest: BuildManifest) -> Self {
        Self {
            version: manifest.version,
            build_version: manifest.build_version,
            files: manifest.files,
            chunks: manifest.chunks,
        }
    }
}

impl BuildManifest {
    /// Build a manifest from its files and chunk infos.
    pub fn new(
        build_version: impl Into<String>,
        files: Vec<FileManifest>,
        chunks: Vec<ChunkInfo>,
    ) -> Self {
        ManifestContent {
            version: MANIFEST_VERSION,
            build_version: build_version.into(),
            files,
            chunks,
        }
        .into()
    }

    /// The manifest format version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The build's version string.
    pub fn build_version(&self) -> &str {
        &self.build_version
    }

    /// All files of the build, in manifest order.
    pub fn files(&self) -> &[FileManifest] {
        &self.files
    }

    /// Look up a file by its build-relative path.
    pub fn file(&self, filename: &Path) -> Option<&FileManifest> {
        self.file_lookup.get(filename).map(|&i| &self.files[i])
    }

    /// Look up a chunk's info.
    pub fn chunk_info(&self, id: &ChunkId) -> Option<&ChunkInfo> {
        self.chunk_lookup.get(id).map(|&i| &self.chunks[i])
    }

    /// Every fragment that holds bytes of `id`, in manifest order.
    fn raw_fragments(&self, id: &ChunkId) -> Vec<FragmentDescriptor> {
        let mut fragments = Vec::new();
        for file in &self.files {
            let mut file_offset = 0u64;
            for part in &file.chunk_parts {
                if part.chunk_id == *id {
                    fragments.push(FragmentDescriptor {
                        path: file.filename.clone(),
                        file_offset,
                        chunk_offset: part.offset,
                        size: part.size,
                    });
                }
                file_offset += u64::from(part.size);
            }
        }
        fragments
    }
}

/// Reduce `fragments` to a set covering `[0, window_size)` exactly.
///
/// Fragments are taken by ascending chunk offset; one that adds nothing
/// beyond what is already covered is dropped. Returns an empty list if any
/// gap remains.
fn select_covering(mut fragments: Vec<FragmentDescriptor>, window_size: u32) -> Vec<FragmentDescriptor> {
    fragments.sort_by_key(|f| f.chunk_offset);

    let mut covered = 0u64;
    let mut selected = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        if u64::from(fragment.chunk_offset) > covered {
            break;
        }
        if fragment.chunk_end() > covered {
            covered = fragment.chunk_end();
            selected.push(fragment);
        }
    }

    if covered == u64::from(window_size) {
        selected
    } else {
        Vec::new()
    }
}

impl ChunkManifest for BuildManifest {
    fn chunk_hashes(&self, id: &ChunkId) -> Option<ChunkHashes> {
        self.chunk_info(id).map(ChunkInfo::hashes)
    }

    fn fragments(&self, id: &ChunkId) -> Vec<FragmentDescriptor> {
        let Some(info) = self.chunk_info(id) else {
            return Vec::new();
        };
        select_covering(self.raw_fragments(id), info.window_size)
    }

    fn enumerate_producible_chunks(
        &self,
        build_root: &Path,
        required: &HashSet<ChunkId>,
    ) -> HashSet<ChunkId> {
        let mut disk_sizes: HashMap<PathBuf, Option<u64>> = HashMap::new();
        let mut producible = HashSet::new();

        for id in required {
            if !self.chunk_lookup.contains_key(id) {
                continue;
            }
            let fragments = self.fragments(id);
            let can_make = !fragments.is_empty()
                && fragments.iter().all(|fragment| {
                    let on_disk = *disk_sizes
                        .entry(fragment.path.clone())
                        .or_insert_with(|| {
                            std::fs::metadata(build_root.join(&fragment.path))
                                .ok()
                                .map(|m| m.len())
                        });
                    let expected = self.file(&fragment.path).map(FileManifest::file_size);
                    on_disk.is_some() && on_disk == expected
                });
            if can_make {
                producible.insert(*id);
            } else {
                trace!(%id, root = %build_root.display(), "chunk not producible from build");
            }
        }

        debug!(
            root = %build_root.display(),
            required = required.len(),
            producible = producible.len(),
            "enumerated producible chunks"
        );
        producible
    }

    fn chunk_ids(&self) -> HashSet<ChunkId> {
        self.chunk_lookup.keys().copied().collect()
    }
}

/// Serialize a manifest to postcard bytes.
pub fn serialize_manifest(manifest: &BuildManifest) -> Result<Vec<u8>, ManifestError> {
    postcard::to_allocvec(manifest).map_err(|e| ManifestError::Serialization(e.to_string()))
}

/// Deserialize a manifest from postcard bytes.
///
/// Rejects manifests with unknown version numbers.
pub fn deserialize_manifest(bytes: &[u8]) -> Result<BuildManifest, ManifestError> {
    let manifest: BuildManifest =
        postcard::from_bytes(bytes).map_err(|e| ManifestError::Serialization(e.to_string()))?;
    if manifest.version != MANIFEST_VERSION {
        return Err(ManifestError::UnsupportedVersion {
            found: manifest.version,
            supported: MANIFEST_VERSION,
        });
    }
    Ok(manifest)
}

/// Load a manifest from a file on disk.
pub fn read_manifest_file(path: &Path) -> Result<BuildManifest, ManifestError> {
    let bytes = std::fs::read(path)?;
    deserialize_manifest(&bytes)
}

/// Save a manifest to a file on disk.
pub fn write_manifest_file(path: &Path, manifest: &BuildManifest) -> Result<(), ManifestError> {
    std::fs::write(path, serialize_manifest(manifest)?)?;
    Ok(())
}
