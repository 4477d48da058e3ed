//! Weak and strong chunk hashes.
//!
//! The weak hash is a 64-bit cyclic polynomial rolling hash: each byte
//! rotates the running value left by one bit and XORs in a table entry.
//! The table is derived from the CRC-64 (ECMA-182, reflected) polynomial,
//! so hashes match those recorded by the chunk generator.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

const CRC64_POLYNOMIAL: u64 = 0xC96C_5795_D787_0F42;

/// Per-byte table for [`rolling_hash`].
pub const ROLLING_HASH_TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = i as u64;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 1 == 1 {
                (value >> 1) ^ CRC64_POLYNOMIAL
            } else {
                value >> 1
            };
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }
    table
}

/// Compute the 64-bit rolling hash of a whole data set.
pub fn rolling_hash(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |hash, byte| {
        hash.rotate_left(1) ^ ROLLING_HASH_TABLE[*byte as usize]
    })
}

/// A 20-byte SHA-1 digest.
///
/// The all-zero digest means "not recorded".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaHash([u8; 20]);

impl ShaHash {
    /// Hash `data` with SHA-1.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    /// Return the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Whether this is the all-zero placeholder.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl From<[u8; 20]> for ShaHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaHash({self})")
    }
}
