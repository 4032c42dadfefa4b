use cannon_primitives::consts::{
    errno::{MIPS_EAGAIN, MIPS_EBADF},
    fd::*,
};

use crate::{oracle::PreimageOracle, VmFault};

use super::SyscallContext;

/// `read(fd, addr, count)`.
///
/// Preimage reads copy at most one word's worth of the length-prefixed preimage into the word
/// containing `addr`, merging with the bytes already there, and advance the preimage offset.
/// Hint reads pretend to consume everything.
pub fn sys_read<O: PreimageOracle>(
    ctx: &mut SyscallContext<'_, O>,
    a0: u64,
    a1: u64,
    a2: u64,
) -> Result<(u64, u64), VmFault> {
    let arch = ctx.arch;
    match a0 {
        // read nothing, no error
        FD_STDIN => Ok((0, 0)),
        FD_PREIMAGE_READ => {
            let eff_addr = a1 & arch.address_mask();
            ctx.tracker.track(ctx.memory, eff_addr)?;
            let mem = ctx.memory.get_word(eff_addr)?;

            let alignment = a1 & arch.ext_mask();
            let space = arch.word_bytes() - alignment;
            let (dat, len) =
                ctx.oracle.read_preimage(*ctx.preimage_key, *ctx.preimage_offset, space.min(a2))?;

            let word_bytes = arch.word_bytes() as usize;
            let mut out = [0u8; 8];
            arch.write_word(&mut out, mem);
            let start = alignment as usize;
            out[start..start + len as usize].copy_from_slice(&dat[..len as usize]);
            ctx.memory.set_word(eff_addr, arch.read_word(&out[..word_bytes]))?;
            ctx.record_write(eff_addr);

            *ctx.preimage_offset += len;
            log::trace!(
                "read {len} preimage bytes, new offset {}, addr {eff_addr:#x}",
                *ctx.preimage_offset
            );
            Ok((len, 0))
        }
        // don't actually read into memory, the hint response is ignored anyway
        FD_HINT_READ => Ok((a2, 0)),
        FD_EVENT_FD if ctx.features.eventfd => Ok((arch.sys_error_signal(), MIPS_EAGAIN)),
        _ => Ok((arch.sys_error_signal(), MIPS_EBADF)),
    }
}
