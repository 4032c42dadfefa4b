use std::io::{self, Read};

use cannon_primitives::consts::{
    errno::{MIPS_EAGAIN, MIPS_EBADF},
    fd::*,
};

use crate::{memory::MemoryError, oracle::PreimageOracle, VmFault};

use super::SyscallContext;

/// `write(fd, addr, count)`.
///
/// stdout and stderr are forwarded to the injected writers. The hint channel buffers
/// `[u32 big-endian length][payload]` frames across calls and hands each complete payload to
/// the oracle. Preimage-key writes shift up to a word of bytes into the key and reset the
/// offset.
pub fn sys_write<O: PreimageOracle>(
    ctx: &mut SyscallContext<'_, O>,
    a0: u64,
    a1: u64,
    a2: u64,
) -> Result<(u64, u64), VmFault> {
    let arch = ctx.arch;
    match a0 {
        FD_STDOUT => {
            // Guest output is best effort and never changes the VM state.
            let _ = io::copy(&mut ctx.memory.read_memory_range(a1, a2), ctx.stdout);
            Ok((a2, 0))
        }
        FD_STDERR => {
            let _ = io::copy(&mut ctx.memory.read_memory_range(a1, a2), ctx.stderr);
            Ok((a2, 0))
        }
        FD_HINT_WRITE => {
            let mut data = Vec::new();
            ctx.memory
                .read_memory_range(a1, a2)
                .read_to_end(&mut data)
                .map_err(MemoryError::from)?;
            ctx.last_hint.extend_from_slice(&data);
            process_hints(ctx);
            Ok((a2, 0))
        }
        FD_PREIMAGE_WRITE => {
            let eff_addr = a1 & arch.address_mask();
            ctx.tracker.track(ctx.memory, eff_addr)?;
            let mem = ctx.memory.get_word(eff_addr)?;

            let alignment = (a1 & arch.ext_mask()) as usize;
            let space = arch.word_bytes() - alignment as u64;
            let count = a2.min(space) as usize;

            let mut word = [0u8; 8];
            arch.write_word(&mut word, mem);
            let key = &mut *ctx.preimage_key;
            key.copy_within(count.., 0);
            key[32 - count..].copy_from_slice(&word[alignment..alignment + count]);
            *ctx.preimage_offset = 0;
            log::trace!("preimage key is now {}", hex::encode(*key));
            Ok((count as u64, 0))
        }
        FD_EVENT_FD if ctx.features.eventfd => Ok((arch.sys_error_signal(), MIPS_EAGAIN)),
        _ => Ok((arch.sys_error_signal(), MIPS_EBADF)),
    }
}

/// Dispatches every complete frame buffered in `last_hint`, keeping a trailing partial frame.
fn process_hints<O: PreimageOracle>(ctx: &mut SyscallContext<'_, O>) {
    let mut consumed = 0;
    while ctx.last_hint.len() - consumed >= 4 {
        let rest = &ctx.last_hint[consumed..];
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len > rest.len() - 4 {
            break;
        }
        ctx.oracle.hint(&rest[4..4 + len]);
        consumed += 4 + len;
    }
    ctx.last_hint.drain(..consumed);
}
