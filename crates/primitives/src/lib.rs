pub mod consts;
pub mod hash;

pub use hash::{hash_pair, keccak256, Hash, ZERO_HASHES};
