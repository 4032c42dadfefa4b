use cannon_primitives::{
    consts::{PAGE_ADDR_MASK, PAGE_ADDR_SIZE, PAGE_SIZE},
    hash_pair, keccak256, Hash,
};

/// Number of internal nodes of the page tree (the 32-byte leaves live in the data itself).
const CACHE_LEN: usize = PAGE_SIZE / 32;

/// A 4 KiB page plus memoized hashes of its internal Merkle nodes.
///
/// Node `1` is the page root, nodes `64..128` hash 64 bytes of data each, and the gindices
/// `128..256` address the 32-byte leaves directly.
#[derive(Clone)]
pub struct CachedPage {
    pub data: Box<[u8; PAGE_SIZE]>,
    cache: Box<[Hash; CACHE_LEN]>,
    ok: [bool; CACHE_LEN],
}

impl Default for CachedPage {
    fn default() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            cache: Box::new([[0u8; 32]; CACHE_LEN]),
            ok: [false; CACHE_LEN],
        }
    }
}

impl CachedPage {
    /// Marks every cached node covering `page_addr` as stale.
    pub fn invalidate(&mut self, page_addr: u64) {
        debug_assert!(page_addr <= PAGE_ADDR_MASK);
        // The bottom cache layer holds nodes over two 32-byte leaves.
        let mut k = (((1u64 << PAGE_ADDR_SIZE) | page_addr) >> 6) as usize;
        while k > 0 {
            self.ok[k] = false;
            k >>= 1;
        }
    }

    pub fn invalidate_full(&mut self) {
        self.ok = [false; CACHE_LEN];
    }

    pub fn merkle_root(&mut self) -> Hash {
        for i in (0..PAGE_SIZE).step_by(64) {
            let j = CACHE_LEN / 2 + i / 64;
            if self.ok[j] {
                continue;
            }
            self.cache[j] = keccak256(&self.data[i..i + 64]);
            self.ok[j] = true;
        }
        let mut i = CACHE_LEN - 2;
        while i > 0 {
            let j = i >> 1;
            if !self.ok[j] {
                self.cache[j] = hash_pair(&self.cache[i], &self.cache[i + 1]);
                self.ok[j] = true;
            }
            i -= 2;
        }
        self.cache[1]
    }

    /// Hash of the node at `gindex` within this page, `1 <= gindex < 256`.
    pub fn merkleize_subtree(&mut self, gindex: u64) -> Hash {
        debug_assert!(gindex > 0 && gindex < 2 * CACHE_LEN as u64);
        self.merkle_root();
        let gindex = gindex as usize;
        if gindex >= CACHE_LEN {
            let node = gindex & (CACHE_LEN - 1);
            let mut out = [0u8; 32];
            out.copy_from_slice(&self.data[node * 32..node * 32 + 32]);
            return out;
        }
        self.cache[gindex]
    }
}
