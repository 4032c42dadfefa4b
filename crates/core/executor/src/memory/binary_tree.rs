use hashbrown::HashMap;

use cannon_primitives::{
    consts::{PAGE_ADDR_MASK, PAGE_ADDR_SIZE},
    hash_pair, Hash, ZERO_HASHES,
};

use super::{MemoryError, PageTable};
use crate::Arch;

/// Merkleization strategy over a [`PageTable`].
///
/// Implementations own their node cache; the page table is lent to them on every call so the
/// memory stays the only owner of page data.
pub trait PageIndex {
    fn new(arch: Arch) -> Self
    where
        Self: Sized;

    fn merkle_root(&mut self, pages: &mut PageTable) -> Hash;

    /// Returns the memory proof for the 32-byte leaf containing `addr`.
    fn merkle_proof(&mut self, pages: &mut PageTable, addr: u64) -> Vec<u8>;

    fn merkleize_subtree(&mut self, pages: &mut PageTable, gindex: u64)
        -> Result<Hash, MemoryError>;

    /// Marks the ancestors of a page as stale, e.g. after it is allocated.
    fn add_page(&mut self, page_index: u64);

    /// Invalidates the leaf containing `addr` and every node above it.
    fn invalidate(&mut self, pages: &mut PageTable, addr: u64);
}

/// Sparse binary Merkle tree keyed by generalized index.
///
/// An absent node is the root of an all-zero subtree, a `None` node must be recomputed from its
/// children.
#[derive(Clone, Debug)]
pub struct BinaryTreeIndex {
    arch: Arch,
    nodes: HashMap<u64, Option<Hash>>,
}

impl BinaryTreeIndex {
    fn leaf_count(&self) -> u32 {
        self.arch.mem_proof_leaf_count()
    }

    fn merkleize(&mut self, pages: &mut PageTable, gindex: u64) -> Hash {
        let page_key_size = self.arch.page_key_size();
        let l = u64::BITS - gindex.leading_zeros();
        if l > page_key_size {
            let depth_into_page = l - 1 - page_key_size;
            let page_index = (gindex >> depth_into_page) & self.arch.page_key_mask();
            return match pages.get_mut(page_index) {
                Some(page) => {
                    let page_gindex =
                        (1u64 << depth_into_page) | (gindex & ((1u64 << depth_into_page) - 1));
                    page.merkleize_subtree(page_gindex)
                }
                None => ZERO_HASHES[(self.leaf_count() - l) as usize],
            };
        }
        match self.nodes.get(&gindex).copied() {
            None => ZERO_HASHES[(self.leaf_count() - l) as usize],
            Some(Some(hash)) => hash,
            Some(None) => {
                let left = self.merkleize(pages, gindex << 1);
                let right = self.merkleize(pages, (gindex << 1) | 1);
                let hash = hash_pair(&left, &right);
                self.nodes.insert(gindex, Some(hash));
                hash
            }
        }
    }

    /// Collects the leaf and the siblings on the path to `addr`, deepest first.
    fn traverse_branch(
        &mut self,
        pages: &mut PageTable,
        parent: u64,
        addr: u64,
        depth: u32,
        proof: &mut Vec<Hash>,
    ) {
        let leaf_depth = self.arch.word_bits() - 5;
        if depth == leaf_depth {
            proof.push(self.merkleize(pages, parent));
            return;
        }
        let mut node = parent << 1;
        let mut sibling = node | 1;
        if addr & (1u64 << (self.arch.word_bits() - 1 - depth)) != 0 {
            std::mem::swap(&mut node, &mut sibling);
        }
        self.traverse_branch(pages, node, addr, depth + 1, proof);
        proof.push(self.merkleize(pages, sibling));
    }
}

impl PageIndex for BinaryTreeIndex {
    fn new(arch: Arch) -> Self {
        Self { arch, nodes: HashMap::new() }
    }

    fn merkle_root(&mut self, pages: &mut PageTable) -> Hash {
        self.merkleize(pages, 1)
    }

    fn merkle_proof(&mut self, pages: &mut PageTable, addr: u64) -> Vec<u8> {
        let mut proof = Vec::with_capacity(self.leaf_count() as usize);
        self.traverse_branch(pages, 1, addr, 0, &mut proof);
        proof.concat()
    }

    fn merkleize_subtree(
        &mut self,
        pages: &mut PageTable,
        gindex: u64,
    ) -> Result<Hash, MemoryError> {
        if u64::BITS - gindex.leading_zeros() > self.leaf_count() {
            return Err(MemoryError::GindexTooDeep(gindex));
        }
        Ok(self.merkleize(pages, gindex))
    }

    fn add_page(&mut self, page_index: u64) {
        let mut gindex = (1u64 << self.arch.page_key_size()) | page_index;
        while gindex > 0 {
            self.nodes.insert(gindex, None);
            gindex >>= 1;
        }
    }

    fn invalidate(&mut self, pages: &mut PageTable, addr: u64) {
        let page_index = addr >> PAGE_ADDR_SIZE;
        match pages.get_mut(page_index) {
            Some(page) => page.invalidate(addr & PAGE_ADDR_MASK),
            None => return,
        }
        // (1 << word_bits | addr) >> PAGE_ADDR_SIZE, split so the shift cannot overflow.
        let mut gindex = (1u64 << self.arch.page_key_size()) | page_index;
        while gindex > 0 {
            self.nodes.insert(gindex, None);
            gindex >>= 1;
        }
    }
}
