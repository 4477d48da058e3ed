//! Shared types and identifiers for salvage.
//!
//! This crate defines the core types used across the salvage workspace:
//! the chunk identifier ([`ChunkId`]), verification hashes ([`ShaHash`],
//! [`rolling_hash`], [`ChunkHashes`]), the in-memory chunk header
//! ([`ChunkHeader`]) and the file fragment descriptor
//! ([`FragmentDescriptor`]) used to rebuild a chunk from an installed build.

pub mod events;
mod hash;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use hash::{ROLLING_HASH_TABLE, ShaHash, rolling_hash};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// 128-bit content-addressed identifier for a chunk.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChunkId([u8; 16]);

impl ChunkId {
    /// Derive an ID from arbitrary data: the first 16 bytes of `blake3(data)`.
    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self(bytes)
    }

    /// Build an ID from a big-endian 128-bit integer.
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    /// Return the raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether this is the all-zero ID carried by a fresh header.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl From<[u8; 16]> for ChunkId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ChunkId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({self})")
    }
}

impl FromStr for ChunkId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

// ---------------------------------------------------------------------------
// Chunk header
// ---------------------------------------------------------------------------

/// Which hash fields of a [`ChunkHeader`] carry meaningful values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashFlags(u8);

impl HashFlags {
    /// No hash recorded.
    pub const NONE: Self = Self(0);
    /// The 64-bit rolling hash is set.
    pub const ROLLING: Self = Self(1);
    /// The SHA-1 digest is set.
    pub const SHA1: Self = Self(1 << 1);

    /// Whether every flag in `other` is also set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every flag in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for HashFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How a chunk's payload is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageFlags {
    /// Raw bytes.
    #[default]
    Uncompressed,
    /// Compressed with the installer's codec (never produced by salvage).
    Compressed,
}

/// Header describing one chunk held in memory.
///
/// A fresh header is entirely zeroed; the loader fills it in once the
/// chunk's bytes have been verified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// The chunk's identifier.
    pub guid: ChunkId,
    /// Which hash fields are meaningful.
    pub hash_type: HashFlags,
    /// Weak 64-bit rolling hash of the uncompressed data.
    pub rolling_hash: u64,
    /// Strong SHA-1 digest of the uncompressed data.
    pub sha_hash: ShaHash,
    /// Size of the payload as stored.
    pub data_size_compressed: u32,
    /// Size of the payload once decompressed.
    pub data_size_uncompressed: u32,
    /// Storage format of the payload.
    pub stored_as: StorageFlags,
}

impl ChunkHeader {
    /// The verification hashes recorded in this header.
    pub fn hashes(&self) -> ChunkHashes {
        ChunkHashes {
            rolling: self
                .hash_type
                .contains(HashFlags::ROLLING)
                .then_some(self.rolling_hash),
            sha: self
                .hash_type
                .contains(HashFlags::SHA1)
                .then_some(self.sha_hash),
        }
    }
}

// ---------------------------------------------------------------------------
// Verification hashes
// ---------------------------------------------------------------------------

/// The verification hashes a manifest records for a chunk.
///
/// Either field may be absent. A chunk with neither cannot be trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHashes {
    /// Weak rolling hash.
    pub rolling: Option<u64>,
    /// Strong SHA-1 digest.
    pub sha: Option<ShaHash>,
}

impl ChunkHashes {
    /// Compute both hashes over `data`.
    pub fn of(data: &[u8]) -> Self {
        Self {
            rolling: Some(rolling_hash(data)),
            sha: Some(ShaHash::of(data)),
        }
    }

    /// Whether at least one hash is recorded.
    pub fn is_empty(&self) -> bool {
        self.rolling.is_none() && self.sha.is_none()
    }

    /// Check `data` against the strongest recorded hash.
    ///
    /// The SHA-1 digest is used when present, otherwise the rolling hash.
    /// Returns `false` when no hash is recorded.
    pub fn matches(&self, data: &[u8]) -> bool {
        match (self.sha, self.rolling) {
            (Some(sha), _) => ShaHash::of(data) == sha,
            (None, Some(rolling)) => rolling_hash(data) == rolling,
            (None, None) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// File fragments
// ---------------------------------------------------------------------------

/// One contiguous slice of an installed file contributing to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    /// Source file, relative to the build root.
    pub path: PathBuf,
    /// Byte offset of the slice within the source file.
    pub file_offset: u64,
    /// Byte offset of the slice within the reconstructed chunk.
    pub chunk_offset: u32,
    /// Length of the slice in bytes.
    pub size: u32,
}

impl FragmentDescriptor {
    /// End of this fragment within the chunk (exclusive).
    pub fn chunk_end(&self) -> u64 {
        u64::from(self.chunk_offset) + u64::from(self.size)
    }

    /// End of this fragment within the source file (exclusive).
    pub fn file_end(&self) -> u64 {
        self.file_offset + u64::from(self.size)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
