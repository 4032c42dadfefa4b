use thiserror::Error;

use crate::{memory::MemoryError, Arch};

/// Fatal faults raised while stepping the VM.
///
/// The messages are matched by dispute tooling and must not change.
#[derive(Error, Debug)]
pub enum VmFault {
    #[error("invalid pc: {0:#x}")]
    InvalidPc(u64),

    #[error("invalid instruction: {0:x}")]
    InvalidInstruction(u32),

    #[error("branch in delay slot")]
    BranchInDelaySlot,

    #[error("jump in delay slot")]
    JumpInDelaySlot,

    #[error("instruction divide by zero")]
    DivideByZero,

    #[error("unimplemented syscall: {0}")]
    UnimplementedSyscall(u64),

    #[error("invalid clone flags: {0:#x}")]
    InvalidCloneFlags(u64),

    #[error("active thread stack is empty")]
    EmptyThreadStack,

    #[error("preimage offset out-of-bounds: {offset} > {len}")]
    PreimageOffsetOutOfBounds { offset: u64, len: u64 },

    #[error("missing preimage for key {0}")]
    PreimageNotFound(String),

    #[error(
        "unexpected different mem access at {addr:08x}, already have access at {last:08x} buffered"
    )]
    UnexpectedMemoryAccess { addr: u64, last: u64 },

    #[error("unexpected disjointed mem access at {addr:08x}, last memory access is at {last:08x} buffered")]
    DisjointMemoryAccess { addr: u64, last: u64 },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl VmFault {
    /// The revert reason an on-chain verifier reports for the same fault.
    ///
    /// `None` stands for a revert without data. A misaligned PC is such a revert on 32-bit
    /// targets while 64-bit verifiers raise the `InvalidPC()` custom error.
    #[must_use]
    pub fn revert_reason(&self, arch: Arch) -> Option<&'static str> {
        match self {
            VmFault::InvalidPc(_) => match arch {
                Arch::Mips32 => None,
                Arch::Mips64 => Some("InvalidPC()"),
            },
            VmFault::DivideByZero => Some("division by zero"),
            VmFault::InvalidInstruction(_) => Some("invalid instruction"),
            VmFault::BranchInDelaySlot => Some("branch in delay slot"),
            VmFault::JumpInDelaySlot => Some("jump in delay slot"),
            VmFault::UnimplementedSyscall(_) => Some("unimplemented syscall"),
            VmFault::InvalidCloneFlags(_) => Some("invalid clone flags"),
            VmFault::EmptyThreadStack => Some("active thread stack is empty"),
            VmFault::PreimageOffsetOutOfBounds { .. } => Some("preimage offset out-of-bounds"),
            VmFault::PreimageNotFound(_)
            | VmFault::UnexpectedMemoryAccess { .. }
            | VmFault::DisjointMemoryAccess { .. }
            | VmFault::Memory(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::VmFault;
    use crate::{memory::MemoryError, Arch};

    #[test]
    fn messages() {
        assert_eq!(VmFault::DivideByZero.to_string(), "instruction divide by zero");
        assert_eq!(VmFault::UnimplementedSyscall(4999).to_string(), "unimplemented syscall: 4999");
        assert_eq!(VmFault::EmptyThreadStack.to_string(), "active thread stack is empty");
        assert_eq!(VmFault::InvalidInstruction(0xfc00_0000).to_string(), "invalid instruction: fc000000");
        assert_eq!(
            VmFault::Memory(MemoryError::Unaligned(0x1001)).to_string(),
            "unaligned memory access: 1001"
        );
    }

    #[test]
    fn revert_reasons() {
        assert_eq!(VmFault::DivideByZero.revert_reason(Arch::Mips32), Some("division by zero"));
        assert_eq!(VmFault::InvalidPc(2).revert_reason(Arch::Mips32), None);
        assert_eq!(VmFault::InvalidPc(2).revert_reason(Arch::Mips64), Some("InvalidPC()"));
    }
}
