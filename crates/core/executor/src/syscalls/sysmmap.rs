use cannon_primitives::consts::{errno::MIPS_EINVAL, PAGE_ADDR_MASK, PAGE_SIZE};

use crate::Arch;

/// `mmap`: a bump allocator over the heap range.
///
/// A zero hint allocates `a1` bytes, rounded up to whole pages, at the current heap pointer. Any
/// other hint is returned as is without touching the heap. Returns `(v0, v1, new_heap)`.
#[must_use]
pub fn sys_mmap(arch: Arch, a0: u64, a1: u64, heap: u64) -> (u64, u64, u64) {
    let mut size = a1;
    if size & PAGE_ADDR_MASK != 0 {
        // adjust size to align with page size
        size = arch.mask(size.wrapping_add(PAGE_SIZE as u64 - (size & PAGE_ADDR_MASK)));
    }

    if a0 != 0 {
        return (a0, 0, heap);
    }

    let new_heap = arch.mask(heap.wrapping_add(size));
    // Fail when the heap would pass its end, wrap around, or the rounded size overflowed.
    if new_heap > arch.heap_end() || new_heap < heap || size < a1 {
        return (arch.sys_error_signal(), MIPS_EINVAL, heap);
    }
    (heap, 0, new_heap)
}

/// `brk` always reports the fixed program break.
#[must_use]
pub const fn sys_brk(arch: Arch) -> (u64, u64) {
    (arch.program_break(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_pages() {
        let arch = Arch::Mips32;
        let heap = arch.heap_start();
        assert_eq!(sys_mmap(arch, 0, 1, heap), (heap, 0, heap + 0x1000));
        assert_eq!(sys_mmap(arch, 0, 0x2000, heap), (heap, 0, heap + 0x2000));
        assert_eq!(sys_mmap(arch, 0, 0, heap), (heap, 0, heap));
    }

    #[test]
    fn hint_is_passed_through() {
        let arch = Arch::Mips64;
        assert_eq!(sys_mmap(arch, 0x1234_0000, 0x1000, 0x5000), (0x1234_0000, 0, 0x5000));
    }

    #[test]
    fn heap_end_boundary() {
        for arch in [Arch::Mips32, Arch::Mips64] {
            let end = arch.heap_end();
            let heap = end - 0x3000;
            // Exactly up to the end succeeds.
            assert_eq!(sys_mmap(arch, 0, 0x3000, heap), (heap, 0, end));
            assert_eq!(sys_mmap(arch, 0, 0x2001, heap), (heap, 0, end));
            // One page too many fails and leaves the heap alone.
            assert_eq!(
                sys_mmap(arch, 0, 0x3001, heap),
                (arch.sys_error_signal(), MIPS_EINVAL, heap)
            );
        }
    }

    #[test]
    fn wrapping_sizes_fail() {
        let arch = Arch::Mips32;
        let heap = arch.heap_start();
        // Rounding overflows the word.
        assert_eq!(sys_mmap(arch, 0, 0xFFFF_FFFF, heap).1, MIPS_EINVAL);
        // The new heap wraps around to low memory.
        assert_eq!(sys_mmap(arch, 0, 0xFFFF_0000, heap).1, MIPS_EINVAL);
    }

    #[test]
    fn program_break() {
        assert_eq!(sys_brk(Arch::Mips32), (0x4000_0000, 0));
        assert_eq!(sys_brk(Arch::Mips64), (0x4000_0000_0000, 0));
    }
}
