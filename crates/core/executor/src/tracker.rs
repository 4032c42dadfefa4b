use crate::{memory::Memory, Arch, VmFault};

/// Records the memory words a step touches and captures their pre-state proofs.
///
/// A step may access at most one word, or two adjacent words (the second through
/// [`MemoryTracker::track2`]). Tracking is a no-op while proofs are disabled.
#[derive(Debug, Clone)]
pub struct MemoryTracker {
    arch: Arch,
    enabled: bool,
    last_addr: Option<u64>,
    mem_proof: Vec<u8>,
    mem_proof2: Vec<u8>,
}

impl MemoryTracker {
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        let size = arch.mem_proof_size();
        Self {
            arch,
            enabled: false,
            last_addr: None,
            mem_proof: vec![0; size],
            mem_proof2: vec![0; size],
        }
    }

    /// Clears everything recorded by the previous step.
    pub fn reset(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.last_addr = None;
        self.mem_proof.fill(0);
        self.mem_proof2.fill(0);
    }

    pub fn track(&mut self, memory: &mut Memory, addr: u64) -> Result<(), VmFault> {
        if !self.enabled || self.last_addr == Some(addr) {
            return Ok(());
        }
        if let Some(last) = self.last_addr {
            return Err(VmFault::UnexpectedMemoryAccess { addr, last });
        }
        self.last_addr = Some(addr);
        self.mem_proof = memory.merkle_proof(addr);
        Ok(())
    }

    /// Tracks the word right after the one recorded by [`MemoryTracker::track`].
    pub fn track2(&mut self, memory: &mut Memory, addr: u64) -> Result<(), VmFault> {
        if !self.enabled {
            return Ok(());
        }
        let last = self.last_addr.unwrap_or(u64::MAX);
        if self.arch.mask(last.wrapping_add(self.arch.word_bytes())) != addr {
            return Err(VmFault::DisjointMemoryAccess { addr, last });
        }
        self.mem_proof2 = memory.merkle_proof(addr);
        Ok(())
    }

    #[must_use]
    pub fn mem_proof(&self) -> &[u8] {
        &self.mem_proof
    }

    #[must_use]
    pub fn mem_proof2(&self) -> &[u8] {
        &self.mem_proof2
    }

    #[must_use]
    pub fn last_addr(&self) -> Option<u64> {
        self.last_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_records_nothing() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        let mut tracker = MemoryTracker::new(Arch::Mips32);
        tracker.track(&mut memory, 0x100).unwrap();
        tracker.track(&mut memory, 0x200).unwrap();
        assert_eq!(tracker.last_addr(), None);
        assert!(tracker.mem_proof().iter().all(|b| *b == 0));
    }

    #[test]
    fn single_access() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        memory.set_word(0x100, 0xabcd).unwrap();
        let mut tracker = MemoryTracker::new(Arch::Mips32);
        tracker.reset(true);
        tracker.track(&mut memory, 0x100).unwrap();
        // Repeating the same address is allowed.
        tracker.track(&mut memory, 0x100).unwrap();
        assert_eq!(tracker.mem_proof(), &memory.merkle_proof(0x100)[..]);
        assert!(matches!(
            tracker.track(&mut memory, 0x200),
            Err(VmFault::UnexpectedMemoryAccess { addr: 0x200, last: 0x100 })
        ));
    }

    #[test]
    fn adjacent_second_access() {
        let mut memory: Memory = Memory::new(Arch::Mips64);
        let mut tracker = MemoryTracker::new(Arch::Mips64);
        tracker.reset(true);
        tracker.track(&mut memory, 0x100).unwrap();
        tracker.track2(&mut memory, 0x108).unwrap();
        assert_eq!(tracker.mem_proof2().len(), Arch::Mips64.mem_proof_size());
        assert!(matches!(
            tracker.track2(&mut memory, 0x110),
            Err(VmFault::DisjointMemoryAccess { .. })
        ));

        tracker.reset(true);
        assert_eq!(tracker.last_addr(), None);
        assert!(tracker.track2(&mut memory, 0x108).is_err());
    }
}
