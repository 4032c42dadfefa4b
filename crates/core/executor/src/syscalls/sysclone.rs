use cannon_primitives::consts::clone::VALID_CLONE_FLAGS;

use crate::{
    state::{CpuScalars, ThreadState},
    Arch, VmFault,
};

use super::{REG_SYSCALL_ERRNO, REG_SYSCALL_NUM};

/// Builds the thread created by `clone(flags, stack)`.
///
/// Only the exact flag set the Go runtime uses for new threads is accepted. The child resumes
/// after the syscall with the parent's registers, `stack` as its stack pointer, and sees a
/// successful zero return.
pub fn clone_thread(
    arch: Arch,
    parent: &ThreadState,
    thread_id: u64,
    flags: u64,
    stack: u64,
) -> Result<ThreadState, VmFault> {
    if flags != VALID_CLONE_FLAGS {
        return Err(VmFault::InvalidCloneFlags(flags));
    }
    let mut child = ThreadState {
        thread_id,
        exit_code: 0,
        exited: false,
        cpu: CpuScalars {
            pc: parent.cpu.next_pc,
            next_pc: arch.mask(parent.cpu.next_pc.wrapping_add(4)),
            hi: parent.cpu.hi,
            lo: parent.cpu.lo,
        },
        registers: parent.registers,
    };
    child.registers[29] = stack;
    child.registers[REG_SYSCALL_NUM] = 0;
    child.registers[REG_SYSCALL_ERRNO] = 0;
    Ok(child)
}
