//! Paged guest memory with an incrementally maintained Merkle index.

mod binary_tree;
mod json;
mod page;

pub use binary_tree::{BinaryTreeIndex, PageIndex};
pub use json::JsonPage;
pub use page::CachedPage;

use std::{
    fmt::Debug,
    io::{self, Read, Write},
};

use hashbrown::HashMap;
use itertools::Itertools;
use thiserror::Error;

use cannon_primitives::{
    consts::{PAGE_ADDR_MASK, PAGE_ADDR_SIZE, PAGE_SIZE},
    Hash,
};

use crate::Arch;

/// Sentinel for an empty slot of the last-page cache; never a valid page index.
const NO_PAGE: u64 = u64::MAX;

/// Errors raised by [`Memory`].
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("unaligned memory access: {0:x}")]
    Unaligned(u64),

    #[error("gindex too deep: {0}")]
    GindexTooDeep(u64),

    #[error("duplicate page index {0:#x}")]
    DuplicatePage(u64),

    #[error("page index {0:#x} out of range")]
    PageIndexOutOfRange(u64),

    #[error("memory io: {0}")]
    Io(#[from] io::Error),
}

/// Owner of every allocated page.
///
/// Pages live in an arena so the memory can cache slot numbers instead of references.
#[derive(Clone, Default)]
pub struct PageTable {
    pages: Vec<CachedPage>,
    slots: HashMap<u64, usize>,
}

impl PageTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[must_use]
    pub fn contains(&self, page_index: u64) -> bool {
        self.slots.contains_key(&page_index)
    }

    #[must_use]
    pub fn get(&self, page_index: u64) -> Option<&CachedPage> {
        self.slots.get(&page_index).map(|&slot| &self.pages[slot])
    }

    pub fn get_mut(&mut self, page_index: u64) -> Option<&mut CachedPage> {
        self.slots.get(&page_index).map(|&slot| &mut self.pages[slot])
    }

    /// Page indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.keys().copied().sorted_unstable()
    }

    fn slot(&self, page_index: u64) -> Option<usize> {
        self.slots.get(&page_index).copied()
    }

    fn insert(&mut self, page_index: u64) -> usize {
        let slot = self.pages.len();
        self.pages.push(CachedPage::default());
        self.slots.insert(page_index, slot);
        slot
    }
}

/// Guest memory: a lazily allocated page table, the Merkle index over it, and a two-entry cache
/// of the most recently used pages.
#[derive(Clone)]
pub struct Memory<I: PageIndex = BinaryTreeIndex> {
    arch: Arch,
    pages: PageTable,
    index: I,
    /// `(page index, slot)`, most recent first.
    last_page: [(u64, usize); 2],
}

impl<I: PageIndex> Debug for Memory<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("arch", &self.arch)
            .field("pages", &self.pages.len())
            .finish_non_exhaustive()
    }
}

impl<I: PageIndex> Memory<I> {
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        Self { arch, pages: PageTable::default(), index: I::new(arch), last_page: [(NO_PAGE, 0); 2] }
    }

    #[must_use]
    pub const fn arch(&self) -> Arch {
        self.arch
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn page(&self, page_index: u64) -> Option<&CachedPage> {
        self.pages.get(page_index)
    }

    pub fn page_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.indices()
    }

    /// Allocated size in a human readable unit, e.g. `"12.0 MiB"`.
    #[must_use]
    pub fn usage(&self) -> String {
        const UNIT: u64 = 1024;
        let total = self.pages.len() as u64 * PAGE_SIZE as u64;
        if total < UNIT {
            return format!("{total} B");
        }
        let (mut div, mut exp) = (UNIT, 0usize);
        let mut n = total / UNIT;
        while n >= UNIT {
            div *= UNIT;
            exp += 1;
            n /= UNIT;
        }
        let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
        format!("{:.1} {prefix}iB", total as f64 / div as f64)
    }

    pub fn merkle_root(&mut self) -> Hash {
        self.index.merkle_root(&mut self.pages)
    }

    pub fn merkle_proof(&mut self, addr: u64) -> Vec<u8> {
        self.index.merkle_proof(&mut self.pages, addr)
    }

    pub fn merkleize_subtree(&mut self, gindex: u64) -> Result<Hash, MemoryError> {
        self.index.merkleize_subtree(&mut self.pages, gindex)
    }

    fn page_lookup(&mut self, page_index: u64) -> Option<usize> {
        if self.last_page[0].0 == page_index {
            return Some(self.last_page[0].1);
        }
        if self.last_page[1].0 == page_index {
            return Some(self.last_page[1].1);
        }
        let slot = self.pages.slot(page_index)?;
        self.last_page[1] = self.last_page[0];
        self.last_page[0] = (page_index, slot);
        Some(slot)
    }

    fn alloc_slot(&mut self, page_index: u64) -> usize {
        match self.pages.slot(page_index) {
            Some(slot) => slot,
            None => {
                self.index.add_page(page_index);
                self.pages.insert(page_index)
            }
        }
    }

    /// Returns the page at `page_index`, allocating a zero page if needed.
    pub fn alloc_page(&mut self, page_index: u64) -> &mut CachedPage {
        let slot = self.alloc_slot(page_index);
        &mut self.pages.pages[slot]
    }

    fn check_aligned(&self, addr: u64) -> Result<(), MemoryError> {
        if addr & self.arch.ext_mask() != 0 {
            return Err(MemoryError::Unaligned(addr));
        }
        Ok(())
    }

    /// Writes a word at an aligned address, allocating the page on first touch.
    pub fn set_word(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.check_aligned(addr)?;
        let page_index = addr >> PAGE_ADDR_SIZE;
        let page_addr = (addr & PAGE_ADDR_MASK) as usize;
        let slot = match self.page_lookup(page_index) {
            Some(slot) => {
                self.index.invalidate(&mut self.pages, addr);
                slot
            }
            None => self.alloc_slot(page_index),
        };
        let width = self.arch.word_bytes() as usize;
        let page = &mut self.pages.pages[slot];
        self.arch.write_word(&mut page.data[page_addr..page_addr + width], value);
        Ok(())
    }

    /// Reads a word at an aligned address; unallocated memory reads as zero.
    pub fn get_word(&mut self, addr: u64) -> Result<u64, MemoryError> {
        self.check_aligned(addr)?;
        let Some(slot) = self.page_lookup(addr >> PAGE_ADDR_SIZE) else {
            return Ok(0);
        };
        let page_addr = (addr & PAGE_ADDR_MASK) as usize;
        let width = self.arch.word_bytes() as usize;
        Ok(self.arch.read_word(&self.pages.pages[slot].data[page_addr..page_addr + width]))
    }

    /// Bit offset of the 4-byte-aligned `addr` within its containing word.
    fn u32_shift(&self, addr: u64) -> u32 {
        self.arch.word_bits() - 32 - ((addr & self.arch.ext_mask() & 4) as u32) * 8
    }

    /// Reads the 32-bit value at a 4-byte aligned address, e.g. an instruction word.
    pub fn get_u32(&mut self, addr: u64) -> Result<u32, MemoryError> {
        if addr & 3 != 0 {
            return Err(MemoryError::Unaligned(addr));
        }
        let word = self.get_word(addr & self.arch.address_mask())?;
        Ok((word >> self.u32_shift(addr)) as u32)
    }

    pub fn set_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        if addr & 3 != 0 {
            return Err(MemoryError::Unaligned(addr));
        }
        let word_addr = addr & self.arch.address_mask();
        let shift = self.u32_shift(addr);
        let word = self.get_word(word_addr)?;
        let word = (word & !(0xFFFF_FFFFu64 << shift)) | (u64::from(value) << shift);
        self.set_word(word_addr, word)
    }

    /// Copies everything `r` yields into memory starting at `addr`.
    pub fn set_memory_range<R: Read>(&mut self, mut addr: u64, mut r: R) -> io::Result<()> {
        let mut chunk = vec![0u8; PAGE_SIZE];
        loop {
            let page_index = addr >> PAGE_ADDR_SIZE;
            let page_addr = (addr & PAGE_ADDR_MASK) as usize;
            let read_len = PAGE_SIZE - page_addr;
            let n = match r.read(&mut chunk[..read_len]) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            let existed = self.page_lookup(page_index).is_some();
            let page = self.alloc_page(page_index);
            page.invalidate_full();
            page.data[page_addr..page_addr + n].copy_from_slice(&chunk[..n]);
            if existed {
                self.index.add_page(page_index);
            }
            addr = self.arch.mask(addr.wrapping_add(n as u64));
        }
    }

    /// A reader over `count` bytes starting at `addr`; unallocated pages read as zeros.
    #[must_use]
    pub fn read_memory_range(&self, addr: u64, count: u64) -> MemoryReader<'_, I> {
        MemoryReader { memory: self, addr, count }
    }

    /// Writes `[pageCount][pageIndex, page]*` with big-endian words, pages in index order.
    pub fn serialize<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut word = vec![0u8; self.arch.word_bytes() as usize];
        self.arch.write_word(&mut word, self.pages.len() as u64);
        out.write_all(&word)?;
        for page_index in self.pages.indices() {
            self.arch.write_word(&mut word, page_index);
            out.write_all(&word)?;
            if let Some(page) = self.pages.get(page_index) {
                out.write_all(&page.data[..])?;
            }
        }
        Ok(())
    }

    pub fn deserialize<R: Read>(arch: Arch, r: &mut R) -> Result<Self, MemoryError> {
        let mut memory = Self::new(arch);
        let mut word = vec![0u8; arch.word_bytes() as usize];
        r.read_exact(&mut word)?;
        let page_count = arch.read_word(&word);
        for _ in 0..page_count {
            r.read_exact(&mut word)?;
            let page_index = arch.read_word(&word);
            if page_index > arch.page_key_mask() {
                return Err(MemoryError::PageIndexOutOfRange(page_index));
            }
            if memory.pages.contains(page_index) {
                return Err(MemoryError::DuplicatePage(page_index));
            }
            let page = memory.alloc_page(page_index);
            r.read_exact(&mut page.data[..])?;
        }
        Ok(memory)
    }

    /// The page list of the legacy JSON state format.
    #[must_use]
    pub fn to_json_pages(&self) -> Vec<JsonPage> {
        self.pages
            .indices()
            .filter_map(|index| {
                self.pages.get(index).map(|page| JsonPage { index, data: page.data.to_vec() })
            })
            .collect()
    }

    pub fn from_json_pages(arch: Arch, pages: Vec<JsonPage>) -> Result<Self, MemoryError> {
        let mut memory = Self::new(arch);
        for JsonPage { index, data } in pages {
            if index > arch.page_key_mask() {
                return Err(MemoryError::PageIndexOutOfRange(index));
            }
            if memory.pages.contains(index) {
                return Err(MemoryError::DuplicatePage(index));
            }
            if data.len() != PAGE_SIZE {
                return Err(MemoryError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("page {index:#x} has {} bytes", data.len()),
                )));
            }
            memory.alloc_page(index).data.copy_from_slice(&data);
        }
        Ok(memory)
    }
}

/// Lazy reader produced by [`Memory::read_memory_range`].
pub struct MemoryReader<'a, I: PageIndex = BinaryTreeIndex> {
    memory: &'a Memory<I>,
    addr: u64,
    count: u64,
}

impl<I: PageIndex> Read for MemoryReader<'_, I> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.count == 0 || buf.is_empty() {
            return Ok(0);
        }
        let start = (self.addr & PAGE_ADDR_MASK) as usize;
        let n = (PAGE_SIZE - start).min(buf.len()).min(self.count.min(PAGE_SIZE as u64) as usize);
        match self.memory.pages.get(self.addr >> PAGE_ADDR_SIZE) {
            Some(page) => buf[..n].copy_from_slice(&page.data[start..start + n]),
            None => buf[..n].fill(0),
        }
        self.addr = self.memory.arch.mask(self.addr.wrapping_add(n as u64));
        self.count -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use cannon_primitives::{hash_pair, ZERO_HASHES};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn fold_proof(arch: Arch, addr: u64, proof: &[u8]) -> Hash {
        let leaf_count = arch.mem_proof_leaf_count() as usize;
        assert_eq!(proof.len(), leaf_count * 32);
        let mut node: Hash = proof[..32].try_into().unwrap();
        for i in 1..leaf_count {
            let sibling: Hash = proof[i * 32..(i + 1) * 32].try_into().unwrap();
            if (addr >> (4 + i)) & 1 == 1 {
                node = hash_pair(&sibling, &node);
            } else {
                node = hash_pair(&node, &sibling);
            }
        }
        node
    }

    /// Rebuilds the root of `memory` from scratch using only page roots.
    fn full_root(memory: &Memory) -> Hash {
        let arch = memory.arch();
        let mut fresh: Memory = Memory::new(arch);
        for index in memory.page_indices() {
            fresh.alloc_page(index).data.copy_from_slice(&memory.page(index).unwrap().data[..]);
        }
        fresh.merkle_root()
    }

    #[test]
    fn empty_root() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        assert_eq!(memory.merkle_root(), ZERO_HASHES[27]);
        let mut memory: Memory = Memory::new(Arch::Mips64);
        assert_eq!(memory.merkle_root(), ZERO_HASHES[59]);
    }

    #[test]
    fn get_set_word() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        assert_eq!(memory.get_word(0x1000).unwrap(), 0);
        memory.set_word(0x1000, 0xdead_beef).unwrap();
        assert_eq!(memory.get_word(0x1000).unwrap(), 0xdead_beef);
        assert_eq!(memory.page(1).unwrap().data[..4], [0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(memory.set_word(0x1002, 1), Err(MemoryError::Unaligned(0x1002))));
        assert!(matches!(memory.get_word(0x1001), Err(MemoryError::Unaligned(0x1001))));

        let mut memory: Memory = Memory::new(Arch::Mips64);
        memory.set_word(0x2008, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(memory.get_word(0x2008).unwrap(), 0x0102_0304_0506_0708);
        assert!(matches!(memory.set_word(0x2004, 1), Err(MemoryError::Unaligned(_))));
    }

    #[test]
    fn u32_views() {
        let mut memory: Memory = Memory::new(Arch::Mips64);
        memory.set_u32(0x104, 0xaabb_ccdd).unwrap();
        memory.set_u32(0x100, 0x1122_3344).unwrap();
        assert_eq!(memory.get_word(0x100).unwrap(), 0x1122_3344_aabb_ccdd);
        assert_eq!(memory.get_u32(0x104).unwrap(), 0xaabb_ccdd);
        assert!(matches!(memory.get_u32(0x102), Err(MemoryError::Unaligned(0x102))));

        let mut memory: Memory = Memory::new(Arch::Mips32);
        memory.set_u32(0x104, 7).unwrap();
        assert_eq!(memory.get_word(0x104).unwrap(), 7);
    }

    #[test]
    fn last_page_cache_is_transparent() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        for page in [1u64, 2, 3, 1, 3, 2, 7, 1] {
            memory.set_word(page << 12, page).unwrap();
        }
        for page in [1u64, 2, 3, 7] {
            assert_eq!(memory.get_word(page << 12).unwrap(), page);
        }
        assert_eq!(memory.page_count(), 4);
    }

    #[test]
    fn incremental_root_matches_full_recompute() {
        for arch in [Arch::Mips32, Arch::Mips64] {
            let mut rng = StdRng::seed_from_u64(7);
            let mut memory: Memory = Memory::new(arch);
            for round in 0..200 {
                let page = rng.gen_range(0..16u64);
                let offset = rng.gen_range(0..4096u64) & arch.address_mask();
                let addr = if arch.is_mips32() { (page << 12) | offset } else {
                    (page << 40) | (page << 12) | offset
                };
                memory.set_word(addr, rng.gen::<u64>() & arch.word_mask()).unwrap();
                if round % 17 == 0 {
                    let root = memory.merkle_root();
                    assert_eq!(root, full_root(&memory));
                }
            }
            assert_eq!(memory.merkle_root(), full_root(&memory));
        }
    }

    #[test]
    fn proofs_fold_to_root() {
        for arch in [Arch::Mips32, Arch::Mips64] {
            let mut rng = StdRng::seed_from_u64(11);
            let mut memory: Memory = Memory::new(arch);
            let mut addrs = vec![0u64, 0x1000, 0x7FFF_FFF0 & arch.address_mask()];
            for _ in 0..20 {
                let addr = rng.gen::<u64>() & arch.address_mask();
                memory.set_word(addr, rng.gen::<u64>() & arch.word_mask()).unwrap();
                addrs.push(addr);
            }
            let root = memory.merkle_root();
            for addr in addrs {
                let proof = memory.merkle_proof(addr);
                assert_eq!(fold_proof(arch, addr, &proof), root, "addr {addr:#x}");
            }
            // An untouched page still proves against the same root.
            let proof = memory.merkle_proof(0x4000_0000);
            assert_eq!(&proof[..32], &[0u8; 32]);
            assert_eq!(fold_proof(arch, 0x4000_0000, &proof), root);
        }
    }

    #[test]
    fn proof_leaf_contains_word() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        memory.set_word(0x1004, 0x1122_3344).unwrap();
        let proof = memory.merkle_proof(0x1004);
        assert_eq!(&proof[4..8], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn gindex_too_deep() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        assert!(memory.merkleize_subtree(1 << 27).is_ok());
        assert!(matches!(memory.merkleize_subtree(1 << 28), Err(MemoryError::GindexTooDeep(_))));
    }

    #[test]
    fn memory_range_round_trip() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        memory.set_memory_range(0x1ff0, &data[..]).unwrap();
        assert_eq!(memory.page_count(), 4);

        let mut out = Vec::new();
        memory.read_memory_range(0x1ff0, data.len() as u64).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let mut zeros = Vec::new();
        memory.read_memory_range(0x10_0000, 100).read_to_end(&mut zeros).unwrap();
        assert_eq!(zeros, vec![0u8; 100]);
        assert_eq!(memory.merkle_root(), full_root(&memory));
    }

    #[test]
    fn memory_range_overwrite_updates_root() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        memory.set_word(0x2000, 1).unwrap();
        let before = memory.merkle_root();
        memory.set_memory_range(0x2000, &[9u8, 9, 9, 9][..]).unwrap();
        assert_ne!(memory.merkle_root(), before);
        assert_eq!(memory.merkle_root(), full_root(&memory));
    }

    #[test]
    fn serialize_round_trip() {
        for arch in [Arch::Mips32, Arch::Mips64] {
            let mut memory: Memory = Memory::new(arch);
            memory.set_word(0x5000, 3).unwrap();
            memory.set_word(0x1000, 1).unwrap();
            memory.set_word(0xFFFF_F000, 2).unwrap();
            let mut buf = Vec::new();
            memory.serialize(&mut buf).unwrap();
            let word = arch.word_bytes() as usize;
            assert_eq!(buf.len(), word + 3 * (word + PAGE_SIZE));
            // Pages are written in index order.
            assert_eq!(arch.read_word(&buf[word..2 * word]), 1);

            let mut decoded = Memory::<BinaryTreeIndex>::deserialize(arch, &mut &buf[..]).unwrap();
            assert_eq!(decoded.page_count(), 3);
            assert_eq!(decoded.get_word(0xFFFF_F000).unwrap(), 2);
            assert_eq!(decoded.merkle_root(), memory.merkle_root());
        }
    }

    #[test]
    fn deserialize_rejects_duplicate_pages() {
        let arch = Arch::Mips32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        for _ in 0..2 {
            buf.extend_from_slice(&5u32.to_be_bytes());
            buf.extend_from_slice(&[0u8; PAGE_SIZE]);
        }
        let err = Memory::<BinaryTreeIndex>::deserialize(arch, &mut &buf[..]).unwrap_err();
        assert!(matches!(err, MemoryError::DuplicatePage(5)));
    }

    #[test]
    fn deserialize_rejects_truncated_input() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 10]);
        let err = Memory::<BinaryTreeIndex>::deserialize(Arch::Mips32, &mut &buf[..]).unwrap_err();
        assert!(matches!(err, MemoryError::Io(_)));
    }

    #[test]
    fn usage_units() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        assert_eq!(memory.usage(), "0 B");
        memory.set_word(0, 1).unwrap();
        assert_eq!(memory.usage(), "4.0 KiB");
        for i in 0..256u64 {
            memory.set_word(i << 12, 1).unwrap();
        }
        assert_eq!(memory.usage(), "1.0 MiB");
    }
}
