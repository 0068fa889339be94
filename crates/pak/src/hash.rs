//! Content hashing for streaming payload reuse.

use core::fmt;

use xxhash_rust::xxh3::xxh3_128_with_seed;

/// Seed of the content hash.
/// Cache files written with another seed are not comparable.
pub const CONTENT_HASH_SEED: u64 = 0x2B0E_9A7C_3F1D_5E63;

/// 128-bit hash value.
///
/// Stored as the low 64 bits followed by the high 64 bits, both little-endian.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash128(pub [u8; 16]);

impl Hash128 {
    pub const fn from_u128(value: u128) -> Self {
        Hash128(value.to_le_bytes())
    }

    pub const fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }

    /// Returns `[low, high]` halves.
    pub const fn as_u64(&self) -> [u64; 2] {
        let value = self.as_u128();
        [value as u64, (value >> 64) as u64]
    }
}

impl fmt::Debug for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.as_u128())
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.as_u128())
    }
}

/// Hashes streaming payload bytes.
pub fn content_hash(bytes: &[u8]) -> Hash128 {
    Hash128::from_u128(xxh3_128_with_seed(bytes, CONTENT_HASH_SEED))
}
