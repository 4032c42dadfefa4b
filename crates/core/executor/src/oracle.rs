//! The preimage oracle boundary.

use hashbrown::HashMap;

use cannon_primitives::{keccak256, Hash};

use crate::VmFault;

/// Key type byte of a local (context-dependent) preimage key.
pub const LOCAL_KEY_TYPE: u8 = 1;
/// Key type byte of a keccak256 preimage key.
pub const KECCAK256_KEY_TYPE: u8 = 2;

/// Source of the content-addressed data a guest reads through the preimage channel.
///
/// Calls are synchronous; implementations backed by disk or network may block.
pub trait PreimageOracle {
    /// Receives a complete hint, without its length prefix.
    fn hint(&mut self, hint: &[u8]);

    /// Returns the preimage of `key`, or `None` if the oracle does not know it.
    fn get_preimage(&mut self, key: Hash) -> Option<Vec<u8>>;
}

impl<T: PreimageOracle + ?Sized> PreimageOracle for &mut T {
    fn hint(&mut self, hint: &[u8]) {
        (**self).hint(hint);
    }

    fn get_preimage(&mut self, key: Hash) -> Option<Vec<u8>> {
        (**self).get_preimage(key)
    }
}

impl<T: PreimageOracle + ?Sized> PreimageOracle for Box<T> {
    fn hint(&mut self, hint: &[u8]) {
        (**self).hint(hint);
    }

    fn get_preimage(&mut self, key: Hash) -> Option<Vec<u8>> {
        (**self).get_preimage(key)
    }
}

/// Turns a keccak256 digest into a preimage key.
#[must_use]
pub fn keccak256_key(data: &[u8]) -> Hash {
    let mut key = keccak256(data);
    key[0] = KECCAK256_KEY_TYPE;
    key
}

/// The local key for slot `index`.
#[must_use]
pub fn local_key(index: u64) -> Hash {
    let mut key = [0u8; 32];
    key[0] = LOCAL_KEY_TYPE;
    key[24..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Oracle serving preimages from a map and recording every hint it receives.
#[derive(Debug, Default, Clone)]
pub struct InMemoryOracle {
    preimages: HashMap<Hash, Vec<u8>>,
    hints: Vec<Vec<u8>>,
}

impl InMemoryOracle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Hash, data: Vec<u8>) {
        self.preimages.insert(key, data);
    }

    /// Stores `data` under its keccak256 key and returns the key.
    pub fn insert_keccak(&mut self, data: Vec<u8>) -> Hash {
        let key = keccak256_key(&data);
        self.preimages.insert(key, data);
        key
    }

    #[must_use]
    pub fn hints(&self) -> &[Vec<u8>] {
        &self.hints
    }
}

impl PreimageOracle for InMemoryOracle {
    fn hint(&mut self, hint: &[u8]) {
        self.hints.push(hint.to_vec());
    }

    fn get_preimage(&mut self, key: Hash) -> Option<Vec<u8>> {
        self.preimages.get(&key).cloned()
    }
}

/// Oracle for programs that never use the preimage channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOracle;

impl PreimageOracle for NullOracle {
    fn hint(&mut self, _hint: &[u8]) {}

    fn get_preimage(&mut self, _key: Hash) -> Option<Vec<u8>> {
        None
    }
}

/// Wraps an oracle, caching the most recent preimage and remembering the last read of a step so
/// it can be attached to the step witness.
#[derive(Debug)]
pub struct TrackingOracle<O> {
    inner: O,
    last_key: Option<Hash>,
    /// `[u64 big-endian length][data]` of `last_key`.
    last_preimage: Vec<u8>,
    last_offset: Option<u64>,
    num_requests: u64,
    total_size: u64,
}

impl<O: PreimageOracle> TrackingOracle<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            last_key: None,
            last_preimage: Vec::new(),
            last_offset: None,
            num_requests: 0,
            total_size: 0,
        }
    }

    /// Forgets the read recorded by the previous step.
    pub fn reset(&mut self) {
        self.last_offset = None;
    }

    pub fn hint(&mut self, hint: &[u8]) {
        log::debug!("hint: {}", hex::encode(hint));
        self.inner.hint(hint);
    }

    /// Reads up to `max_len` bytes (at most 8) of the length-prefixed preimage of `key` starting
    /// at `offset`.
    pub fn read_preimage(
        &mut self,
        key: Hash,
        offset: u64,
        max_len: u64,
    ) -> Result<([u8; 8], u64), VmFault> {
        if self.last_key != Some(key) {
            let data = self
                .inner
                .get_preimage(key)
                .ok_or_else(|| VmFault::PreimageNotFound(hex::encode(key)))?;
            let mut preimage = Vec::with_capacity(8 + data.len());
            preimage.extend_from_slice(&(data.len() as u64).to_be_bytes());
            preimage.extend_from_slice(&data);
            self.num_requests += 1;
            self.total_size += preimage.len() as u64;
            self.last_key = Some(key);
            self.last_preimage = preimage;
        }
        self.last_offset = Some(offset);

        let len = self.last_preimage.len() as u64;
        let mut dat = [0u8; 8];
        if offset > len {
            return Err(VmFault::PreimageOffsetOutOfBounds { offset, len });
        }
        let start = offset as usize;
        let n = (len - offset).min(max_len).min(8) as usize;
        dat[..n].copy_from_slice(&self.last_preimage[start..start + n]);
        Ok((dat, n as u64))
    }

    /// Key, length-prefixed value and offset of the read made since the last reset.
    #[must_use]
    pub fn last_preimage(&self) -> Option<(Hash, &[u8], u64)> {
        match (self.last_offset, self.last_key) {
            (Some(offset), Some(key)) => Some((key, &self.last_preimage, offset)),
            _ => None,
        }
    }

    /// Number of preimages fetched from the wrapped oracle.
    #[must_use]
    pub fn num_requests(&self) -> u64 {
        self.num_requests
    }

    /// Total size of the fetched preimages, length prefixes included.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut O {
        &mut self.inner
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_types() {
        let key = keccak256_key(b"hello");
        assert_eq!(key[0], KECCAK256_KEY_TYPE);
        assert_eq!(key[1..], keccak256(b"hello")[1..]);

        let key = local_key(0x0102);
        assert_eq!(key[0], LOCAL_KEY_TYPE);
        assert_eq!(key[30..], [1, 2]);
    }

    #[test]
    fn reads_are_length_prefixed() {
        let mut oracle = InMemoryOracle::new();
        let key = oracle.insert_keccak(b"hello world".to_vec());
        let mut tracking = TrackingOracle::new(oracle);

        let (dat, n) = tracking.read_preimage(key, 0, 8).unwrap();
        assert_eq!((dat, n), ([0, 0, 0, 0, 0, 0, 0, 11], 8));
        let (dat, n) = tracking.read_preimage(key, 8, 3).unwrap();
        assert_eq!(&dat[..n as usize], b"hel");
        // Cached after the first fetch.
        assert_eq!(tracking.num_requests(), 1);
        assert_eq!(tracking.total_size(), 19);

        let (_, value, offset) = tracking.last_preimage().unwrap();
        assert_eq!(offset, 8);
        assert_eq!(value.len(), 19);
        tracking.reset();
        assert!(tracking.last_preimage().is_none());
    }

    #[test]
    fn read_at_end_and_beyond() {
        let mut oracle = InMemoryOracle::new();
        let key = oracle.insert_keccak(vec![7; 4]);
        let mut tracking = TrackingOracle::new(oracle);
        assert_eq!(tracking.read_preimage(key, 12, 8).unwrap().1, 0);
        let err = tracking.read_preimage(key, 13, 8).unwrap_err();
        assert!(matches!(err, VmFault::PreimageOffsetOutOfBounds { offset: 13, len: 12 }));
    }

    #[test]
    fn missing_preimage() {
        let mut tracking = TrackingOracle::new(NullOracle);
        assert!(matches!(
            tracking.read_preimage([0; 32], 0, 4),
            Err(VmFault::PreimageNotFound(_))
        ));
    }

    #[test]
    fn hints_are_forwarded() {
        let mut tracking = TrackingOracle::new(InMemoryOracle::new());
        tracking.hint(b"l1-block 0x01");
        assert_eq!(tracking.inner().hints(), [b"l1-block 0x01".to_vec()]);
    }
}
