//! Linux syscall emulation shared by both VMs.
//!
//! Each family lives in its own module. Handlers return the `(v0, v1)` pair the VM writes back
//! to `$v0` and `$a3`; threading syscalls are left to the multi-threaded VM.

mod code;
mod sysclock;
mod sysclone;
mod sysfcntl;
mod sysmmap;
mod sysread;
mod syswrite;

pub use code::*;
pub use sysclock::*;
pub use sysclone::*;
pub use sysfcntl::*;
pub use sysmmap::*;
pub use sysread::*;
pub use syswrite::*;

use std::io::Write;

use cannon_primitives::Hash;

use crate::{
    memory::Memory, oracle::TrackingOracle, state::CpuScalars, tracker::MemoryTracker, Arch,
};

/// `$v0` holds the syscall number on entry and the return value on exit.
pub const REG_SYSCALL_NUM: usize = 2;
/// `$a3` carries the errno on exit.
pub const REG_SYSCALL_ERRNO: usize = 7;

/// Register arguments of a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub number: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
}

impl SyscallArgs {
    #[must_use]
    pub fn from_registers(registers: &[u64; 32]) -> Self {
        Self {
            number: registers[REG_SYSCALL_NUM],
            a0: registers[4],
            a1: registers[5],
            a2: registers[6],
            a3: registers[7],
        }
    }
}

/// Writes the syscall results back and advances the PC.
pub fn handle_syscall_updates(
    arch: Arch,
    cpu: &mut CpuScalars,
    registers: &mut [u64; 32],
    v0: u64,
    v1: u64,
) {
    registers[REG_SYSCALL_NUM] = arch.mask(v0);
    registers[REG_SYSCALL_ERRNO] = arch.mask(v1);
    cpu.pc = cpu.next_pc;
    cpu.next_pc = arch.mask(cpu.next_pc.wrapping_add(4));
}

/// Syscall variations between state versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallFeatures {
    /// `fcntl(F_GETFD)` is answered instead of failing with EINVAL.
    pub fcntl_getfd: bool,
    /// The eventfd descriptor exists and never has data.
    pub eventfd: bool,
}

/// The slice of VM state the I/O syscalls operate on.
pub struct SyscallContext<'a, O> {
    pub arch: Arch,
    pub features: SyscallFeatures,
    pub memory: &'a mut Memory,
    pub tracker: &'a mut MemoryTracker,
    pub oracle: &'a mut TrackingOracle<O>,
    pub preimage_key: &'a mut Hash,
    pub preimage_offset: &'a mut u64,
    pub last_hint: &'a mut Vec<u8>,
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
    /// Words written to memory by the handler.
    written: Vec<u64>,
}

impl<'a, O> SyscallContext<'a, O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arch: Arch,
        features: SyscallFeatures,
        memory: &'a mut Memory,
        tracker: &'a mut MemoryTracker,
        oracle: &'a mut TrackingOracle<O>,
        preimage_key: &'a mut Hash,
        preimage_offset: &'a mut u64,
        last_hint: &'a mut Vec<u8>,
        stdout: &'a mut dyn Write,
        stderr: &'a mut dyn Write,
    ) -> Self {
        Self {
            arch,
            features,
            memory,
            tracker,
            oracle,
            preimage_key,
            preimage_offset,
            last_hint,
            stdout,
            stderr,
            written: Vec::new(),
        }
    }

    /// Addresses of the words the handler stored to, in order.
    #[must_use]
    pub fn written(&self) -> &[u64] {
        &self.written
    }

    /// Ends the call, handing back the written addresses.
    #[must_use]
    pub fn into_written(self) -> Vec<u64> {
        self.written
    }

    pub(crate) fn record_write(&mut self, addr: u64) {
        self.written.push(addr);
    }
}
