//! Keccak-256 helpers shared by the memory tree and the state witness.

use lazy_static::lazy_static;
use tiny_keccak::{Hasher, Keccak};

/// A 32-byte Keccak-256 digest.
pub type Hash = [u8; 32];

/// Hashes `data` with Keccak-256.
#[must_use]
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

/// Hashes the concatenation `left || right`.
#[must_use]
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Keccak::v256();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

lazy_static! {
    /// `ZERO_HASHES[i]` is the root of an all-zero subtree of depth `i`.
    ///
    /// Depth 0 is the all-zero 32-byte leaf itself.
    pub static ref ZERO_HASHES: [Hash; 256] = {
        let mut out = [[0u8; 32]; 256];
        for i in 1..256 {
            out[i] = hash_pair(&out[i - 1], &out[i - 1]);
        }
        out
    };
}
