use cannon_primitives::consts::{
    clock::{CLOCK_GETTIME_MONOTONIC, CLOCK_GETTIME_REALTIME},
    errno::MIPS_EINVAL,
    HZ,
};

use crate::VmFault;

use super::SyscallContext;

/// `clock_gettime(clock, timespec)`.
///
/// The monotonic clock is derived from the step counter at [`HZ`] steps per second; the
/// realtime clock is pinned to the Unix epoch. The two timespec words are stored at
/// `timespec` and the word after it.
pub fn sys_clock_gettime<O>(
    ctx: &mut SyscallContext<'_, O>,
    step: u64,
    a0: u64,
    a1: u64,
) -> Result<(u64, u64), VmFault> {
    let arch = ctx.arch;
    let (secs, nsecs) = match a0 {
        CLOCK_GETTIME_MONOTONIC => (step / HZ, (step % HZ) * (1_000_000_000 / HZ)),
        CLOCK_GETTIME_REALTIME => (0, 0),
        _ => return Ok((arch.sys_error_signal(), MIPS_EINVAL)),
    };

    let eff_addr = a1 & arch.address_mask();
    ctx.tracker.track(ctx.memory, eff_addr)?;
    ctx.memory.set_word(eff_addr, arch.mask(secs))?;
    ctx.record_write(eff_addr);

    let nsecs_addr = arch.mask(eff_addr.wrapping_add(arch.word_bytes()));
    ctx.tracker.track2(ctx.memory, nsecs_addr)?;
    ctx.memory.set_word(nsecs_addr, arch.mask(nsecs))?;
    ctx.record_write(nsecs_addr);
    Ok((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{syscalls::tests::Fixture, Arch};

    #[test]
    fn monotonic_from_steps() {
        let mut fx = Fixture::new(Arch::Mips32);
        let step = 3 * HZ + 123;
        let mut ctx = fx.ctx();
        let ret = sys_clock_gettime(&mut ctx, step, CLOCK_GETTIME_MONOTONIC, 0x202).unwrap();
        assert_eq!(ret, (0, 0));
        assert_eq!(ctx.written(), [0x200, 0x204]);
        assert_eq!(fx.memory.get_word(0x200).unwrap(), 3);
        assert_eq!(fx.memory.get_word(0x204).unwrap(), 123 * 100);
    }

    #[test]
    fn realtime_is_the_epoch() {
        let mut fx = Fixture::new(Arch::Mips64);
        fx.memory.set_word(0x300, 7).unwrap();
        fx.memory.set_word(0x308, 7).unwrap();
        fx.tracker.reset(true);
        sys_clock_gettime(&mut fx.ctx(), 99, CLOCK_GETTIME_REALTIME, 0x300).unwrap();
        assert_eq!(fx.memory.get_word(0x300).unwrap(), 0);
        assert_eq!(fx.memory.get_word(0x308).unwrap(), 0);
        assert_eq!(fx.tracker.last_addr(), Some(0x300));
    }

    #[test]
    fn unknown_clock() {
        let mut fx = Fixture::new(Arch::Mips32);
        assert_eq!(
            sys_clock_gettime(&mut fx.ctx(), 0, 7, 0x300).unwrap(),
            (0xFFFF_FFFF, MIPS_EINVAL)
        );
    }
}
