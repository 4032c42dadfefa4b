//! VM state: CPU scalars, threads, the two state layouts and their encodings.

mod multi;
mod single;
mod versioned;

pub use multi::*;
pub use single::*;
pub use versioned::*;

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cannon_primitives::{keccak256, Hash};

use crate::{memory::MemoryError, Arch};

/// Program counters and the HI/LO registers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuScalars {
    pub pc: u64,
    pub next_pc: u64,
    pub lo: u64,
    pub hi: u64,
}

/// State of the LL/SC reservation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LlStatus {
    #[default]
    None = 0,
    /// Reserved by `ll`.
    Active32 = 1,
    /// Reserved by `lld`.
    Active64 = 2,
}

impl TryFrom<u8> for LlStatus {
    type Error = StateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LlStatus::None),
            1 => Ok(LlStatus::Active32),
            2 => Ok(LlStatus::Active64),
            _ => Err(StateError::Malformed(format!("invalid LL status {value}"))),
        }
    }
}

/// A guest thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: u64,
    pub exit_code: u8,
    pub exited: bool,
    pub cpu: CpuScalars,
    pub registers: [u64; 32],
}

impl ThreadState {
    #[must_use]
    pub fn new(thread_id: u64) -> Self {
        Self { thread_id, exit_code: 0, exited: false, cpu: CpuScalars::default(), registers: [0; 32] }
    }

    /// Witness encoding of the thread, also its binary encoding:
    /// `[tid][exitCode u8][exited u8][pc][nextPC][hi][lo][registers]`, big-endian words.
    #[must_use]
    pub fn serialize(&self, arch: Arch) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::serialized_size(arch));
        let mut w = BinaryWriter::new(arch, &mut out);
        // Writing into a Vec cannot fail.
        let _ = self.encode(&mut w);
        out
    }

    #[must_use]
    pub const fn serialized_size(arch: Arch) -> usize {
        (1 + 4 + 32) * arch.word_bytes() as usize + 2
    }

    /// Hash of the witness encoding.
    #[must_use]
    pub fn hash(&self, arch: Arch) -> Hash {
        keccak256(&self.serialize(arch))
    }

    pub(crate) fn encode<W: Write>(&self, w: &mut BinaryWriter<'_, W>) -> io::Result<()> {
        w.word(self.thread_id)?;
        w.u8(self.exit_code)?;
        w.bool(self.exited)?;
        w.word(self.cpu.pc)?;
        w.word(self.cpu.next_pc)?;
        w.word(self.cpu.hi)?;
        w.word(self.cpu.lo)?;
        for reg in self.registers {
            w.word(reg)?;
        }
        Ok(())
    }

    pub(crate) fn decode<R: Read>(r: &mut BinaryReader<'_, R>) -> Result<Self, StateError> {
        let thread_id = r.word()?;
        let exit_code = r.u8()?;
        let exited = r.bool()?;
        let cpu = CpuScalars { pc: r.word()?, next_pc: r.word()?, hi: r.word()?, lo: r.word()? };
        let mut registers = [0u64; 32];
        for reg in &mut registers {
            *reg = r.word()?;
        }
        Ok(Self { thread_id, exit_code, exited, cpu, registers })
    }
}

/// Tag byte of the versioned state container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StateVersion {
    SingleThreaded = 0,
    MultiThreaded = 1,
    /// Single-threaded with `fcntl(F_GETFD)` support.
    SingleThreaded2 = 2,
    MultiThreaded64 = 3,
}

impl StateVersion {
    #[must_use]
    pub const fn arch(self) -> Arch {
        match self {
            StateVersion::MultiThreaded64 => Arch::Mips64,
            _ => Arch::Mips32,
        }
    }

    #[must_use]
    pub const fn is_multi_threaded(self) -> bool {
        matches!(self, StateVersion::MultiThreaded | StateVersion::MultiThreaded64)
    }
}

impl TryFrom<u8> for StateVersion {
    type Error = StateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StateVersion::SingleThreaded),
            1 => Ok(StateVersion::MultiThreaded),
            2 => Ok(StateVersion::SingleThreaded2),
            3 => Ok(StateVersion::MultiThreaded64),
            _ => Err(StateError::UnknownVersion(value)),
        }
    }
}

/// Errors raised while loading or storing a state.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("unknown state version {0}")]
    UnknownVersion(u8),

    #[error("JSON serialization is not supported for state version {0:?}")]
    JsonNotSupported(StateVersion),

    #[error("malformed state: {0}")]
    Malformed(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("state io: {0}")]
    Io(#[from] io::Error),
}

/// Exit status folded into the first byte of the state hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmStatus {
    Valid = 0,
    Invalid = 1,
    Panic = 2,
    Unfinished = 3,
}

impl VmStatus {
    #[must_use]
    pub const fn new(exited: bool, exit_code: u8) -> Self {
        if !exited {
            return VmStatus::Unfinished;
        }
        match exit_code {
            0 => VmStatus::Valid,
            1 => VmStatus::Invalid,
            _ => VmStatus::Panic,
        }
    }
}

/// Hash of a state witness with the VM status in the first byte.
#[must_use]
pub fn state_hash(witness: &[u8], exited: bool, exit_code: u8) -> Hash {
    let mut hash = keccak256(witness);
    hash[0] = VmStatus::new(exited, exit_code) as u8;
    hash
}

/// Big-endian writer for the binary state encoding, word width taken from the architecture.
pub struct BinaryWriter<'a, W> {
    arch: Arch,
    out: &'a mut W,
}

impl<'a, W: Write> BinaryWriter<'a, W> {
    pub fn new(arch: Arch, out: &'a mut W) -> Self {
        Self { arch, out }
    }

    pub fn word(&mut self, value: u64) -> io::Result<()> {
        let width = self.arch.word_bytes() as usize;
        self.out.write_all(&value.to_be_bytes()[8 - width..])
    }

    pub fn u8(&mut self, value: u8) -> io::Result<()> {
        self.out.write_all(&[value])
    }

    pub fn bool(&mut self, value: bool) -> io::Result<()> {
        self.u8(u8::from(value))
    }

    pub fn u64(&mut self, value: u64) -> io::Result<()> {
        self.out.write_all(&value.to_be_bytes())
    }

    pub fn hash(&mut self, value: &Hash) -> io::Result<()> {
        self.out.write_all(value)
    }

    /// Writes `[u32 length][bytes]`.
    pub fn bytes(&mut self, value: &[u8]) -> io::Result<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "byte string too long"))?;
        self.out.write_all(&len.to_be_bytes())?;
        self.out.write_all(value)
    }

    pub fn inner(&mut self) -> &mut W {
        self.out
    }
}

/// Counterpart of [`BinaryWriter`].
pub struct BinaryReader<'a, R> {
    arch: Arch,
    input: &'a mut R,
}

impl<'a, R: Read> BinaryReader<'a, R> {
    pub fn new(arch: Arch, input: &'a mut R) -> Self {
        Self { arch, input }
    }

    pub fn word(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let width = self.arch.word_bytes() as usize;
        self.input.read_exact(&mut buf[8 - width..])?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.input.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn bool(&mut self) -> Result<bool, StateError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StateError::Malformed(format!("invalid bool byte {other}"))),
        }
    }

    pub fn u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn hash(&mut self) -> io::Result<Hash> {
        let mut buf = [0u8; 32];
        self.input.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut len = [0u8; 4];
        self.input.read_exact(&mut len)?;
        let mut buf = Vec::new();
        self.input.by_ref().take(u64::from(u32::from_be_bytes(len))).read_to_end(&mut buf)?;
        if buf.len() != u32::from_be_bytes(len) as usize {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(buf)
    }

    pub fn inner(&mut self) -> &mut R {
        self.input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte() {
        assert_eq!(VmStatus::new(false, 7), VmStatus::Unfinished);
        assert_eq!(VmStatus::new(true, 0), VmStatus::Valid);
        assert_eq!(VmStatus::new(true, 1), VmStatus::Invalid);
        assert_eq!(VmStatus::new(true, 2), VmStatus::Panic);
        assert_eq!(VmStatus::new(true, 255), VmStatus::Panic);

        let witness = [1u8, 2, 3];
        let hash = state_hash(&witness, false, 0);
        assert_eq!(hash[0], 3);
        assert_eq!(hash[1..], keccak256(&witness)[1..]);
    }

    #[test]
    fn thread_encoding() {
        let mut thread = ThreadState::new(9);
        thread.exited = true;
        thread.exit_code = 4;
        thread.cpu = CpuScalars { pc: 0x100, next_pc: 0x104, lo: 1, hi: 2 };
        thread.registers[29] = 0x7fff_d000;
        for arch in [Arch::Mips32, Arch::Mips64] {
            let bytes = thread.serialize(arch);
            assert_eq!(bytes.len(), ThreadState::serialized_size(arch));
            let w = arch.word_bytes() as usize;
            assert_eq!(arch.read_word(&bytes[..w]), 9);
            assert_eq!(bytes[w..w + 2], [4, 1]);
            // hi is written before lo
            assert_eq!(arch.read_word(&bytes[w + 2 + 2 * w..w + 2 + 3 * w]), 2);

            let mut input = &bytes[..];
            let decoded = ThreadState::decode(&mut BinaryReader::new(arch, &mut input)).unwrap();
            assert_eq!(decoded, thread);
        }
    }

    #[test]
    fn versions() {
        assert_eq!(StateVersion::try_from(3).unwrap().arch(), Arch::Mips64);
        assert!(StateVersion::try_from(1).unwrap().is_multi_threaded());
        assert!(matches!(StateVersion::try_from(4), Err(StateError::UnknownVersion(4))));
    }

    #[test]
    fn byte_strings() {
        let mut out = Vec::new();
        BinaryWriter::new(Arch::Mips32, &mut out).bytes(&[1, 2, 3]).unwrap();
        assert_eq!(out, [0, 0, 0, 3, 1, 2, 3]);
        let mut truncated = &out[..5];
        assert!(BinaryReader::new(Arch::Mips32, &mut truncated).bytes().is_err());
    }
}
