//! Word-width parameters of the two supported MIPS targets.
//!
//! Machine words are carried as `u64` everywhere. On [`Arch::Mips32`] every value written to a
//! register or memory is kept masked to the low 32 bits.

use serde::{Deserialize, Serialize};

use cannon_primitives::consts::PAGE_ADDR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    Mips32,
    Mips64,
}

impl Arch {
    #[must_use]
    pub const fn is_mips32(self) -> bool {
        matches!(self, Arch::Mips32)
    }

    /// Width of a machine word in bits.
    #[must_use]
    pub const fn word_bits(self) -> u32 {
        match self {
            Arch::Mips32 => 32,
            Arch::Mips64 => 64,
        }
    }

    #[must_use]
    pub const fn word_bytes(self) -> u64 {
        (self.word_bits() / 8) as u64
    }

    #[must_use]
    pub const fn word_mask(self) -> u64 {
        match self {
            Arch::Mips32 => 0xFFFF_FFFF,
            Arch::Mips64 => u64::MAX,
        }
    }

    /// Mask of the byte offset within a word.
    #[must_use]
    pub const fn ext_mask(self) -> u64 {
        self.word_bytes() - 1
    }

    /// Mask that aligns an address down to its containing word.
    #[must_use]
    pub const fn address_mask(self) -> u64 {
        self.word_mask() & !self.ext_mask()
    }

    /// Number of address bits that select a page.
    #[must_use]
    pub const fn page_key_size(self) -> u32 {
        self.word_bits() - PAGE_ADDR_SIZE
    }

    #[must_use]
    pub const fn page_key_mask(self) -> u64 {
        (1u64 << self.page_key_size()) - 1
    }

    /// Number of 32-byte entries in a memory proof: the leaf plus one sibling per level.
    #[must_use]
    pub const fn mem_proof_leaf_count(self) -> u32 {
        self.word_bits() - 4
    }

    #[must_use]
    pub const fn mem_proof_size(self) -> usize {
        self.mem_proof_leaf_count() as usize * 32
    }

    /// The `-1` value syscalls return on error.
    #[must_use]
    pub const fn sys_error_signal(self) -> u64 {
        self.word_mask()
    }

    #[must_use]
    pub const fn heap_start(self) -> u64 {
        match self {
            Arch::Mips32 => 0x05_00_00_00,
            Arch::Mips64 => 0x10_00_00_00_00_00_00_00,
        }
    }

    #[must_use]
    pub const fn heap_end(self) -> u64 {
        match self {
            Arch::Mips32 => 0x60_00_00_00,
            Arch::Mips64 => 0x60_00_00_00_00_00_00_00,
        }
    }

    /// The value returned by `brk`.
    #[must_use]
    pub const fn program_break(self) -> u64 {
        match self {
            Arch::Mips32 => 0x40_00_00_00,
            Arch::Mips64 => 0x00_00_40_00_00_00_00_00,
        }
    }

    /// Initial stack pointer.
    #[must_use]
    pub const fn high_memory_start(self) -> u64 {
        match self {
            Arch::Mips32 => 0x7F_FF_D0_00,
            Arch::Mips64 => 0x7F_FF_FF_FF_D0_00,
        }
    }

    #[inline]
    #[must_use]
    pub const fn mask(self, value: u64) -> u64 {
        value & self.word_mask()
    }

    /// Interprets a canonical word as a signed integer of the target width.
    #[inline]
    #[must_use]
    pub const fn signed(self, value: u64) -> i64 {
        match self {
            Arch::Mips32 => value as u32 as i32 as i64,
            Arch::Mips64 => value as i64,
        }
    }

    /// Sign-extends the low `idx` bits of `dat` to the full word width.
    ///
    /// Any set bit at or above `idx - 1` selects the negative branch.
    #[must_use]
    pub const fn sign_extend(self, dat: u64, idx: u32) -> u64 {
        let bits = self.word_bits();
        let dat = self.mask(dat);
        let is_signed = (dat >> (idx - 1)) != 0;
        let mask = if idx >= 64 { u64::MAX } else { (1u64 << idx) - 1 };
        let signed = if idx >= bits { 0 } else { ((1u64 << (bits - idx)) - 1) << idx };
        if is_signed {
            (dat & mask) | signed
        } else {
            dat & mask
        }
    }

    /// Reads a big-endian word from `bytes`, which must be exactly `word_bytes` long.
    #[must_use]
    pub fn read_word(self, bytes: &[u8]) -> u64 {
        bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    /// Writes `value` as a big-endian word into `out`, which must be `word_bytes` long.
    pub fn write_word(self, out: &mut [u8], value: u64) {
        let width = self.word_bytes() as usize;
        out[..width].copy_from_slice(&value.to_be_bytes()[8 - width..]);
    }
}

#[cfg(test)]
mod tests {
    use super::Arch;

    #[test]
    fn masks() {
        assert_eq!(Arch::Mips32.address_mask(), 0xFFFF_FFFC);
        assert_eq!(Arch::Mips64.address_mask(), 0xFFFF_FFFF_FFFF_FFF8);
        assert_eq!(Arch::Mips32.page_key_size(), 20);
        assert_eq!(Arch::Mips64.page_key_size(), 52);
        assert_eq!(Arch::Mips32.mem_proof_size(), 28 * 32);
        assert_eq!(Arch::Mips64.mem_proof_size(), 60 * 32);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(Arch::Mips32.sign_extend(0x8000, 16), 0xFFFF_8000);
        assert_eq!(Arch::Mips32.sign_extend(0x7FFF, 16), 0x7FFF);
        assert_eq!(Arch::Mips64.sign_extend(0x8000, 16), 0xFFFF_FFFF_FFFF_8000);
        assert_eq!(Arch::Mips64.sign_extend(0x8000_0000, 32), 0xFFFF_FFFF_8000_0000);
        assert_eq!(Arch::Mips32.sign_extend(0x8000_0000, 32), 0x8000_0000);
        assert_eq!(Arch::Mips64.sign_extend(0x80, 8), 0xFFFF_FFFF_FFFF_FF80);
    }

    #[test]
    fn signed_view() {
        assert_eq!(Arch::Mips32.signed(0xFFFF_FFFF), -1);
        assert_eq!(Arch::Mips64.signed(0xFFFF_FFFF), 0xFFFF_FFFF);
    }

    #[test]
    fn word_bytes_round_trip() {
        let mut buf = [0u8; 8];
        Arch::Mips32.write_word(&mut buf, 0xdead_beef);
        assert_eq!(&buf[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(Arch::Mips32.read_word(&buf[..4]), 0xdead_beef);
        Arch::Mips64.write_word(&mut buf, 0x0102_0304_0506_0708);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
