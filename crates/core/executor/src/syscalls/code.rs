use enum_map::Enum;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::Arch;

/// Linux system calls known to the VM.
///
/// A system call is invoked by the `syscall` instruction with its number in register V0 and the
/// arguments in A0..A3. Numbering follows the o32 ABI (`4000 + n`) on 32-bit targets and the n64
/// ABI (`5000 + n`) on 64-bit targets; a few calls only exist on one of them.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Ord, PartialOrd, Serialize, Deserialize, Enum,
)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum SyscallCode {
    SYS_MMAP,
    SYS_BRK,
    SYS_CLONE,
    SYS_EXIT_GROUP,
    SYS_READ,
    SYS_WRITE,
    SYS_FCNTL,
    SYS_EXIT,
    SYS_SCHED_YIELD,
    SYS_GETTID,
    SYS_FUTEX,
    SYS_OPEN,
    SYS_NANOSLEEP,
    SYS_CLOCK_GETTIME,
    SYS_GETPID,
    SYS_EVENTFD2,

    /// The following are executed as no-ops by the multi-threaded VM.
    SYS_MUNMAP,
    SYS_SCHED_GETAFFINITY,
    SYS_MADVISE,
    SYS_RT_SIGPROCMASK,
    SYS_SIGALTSTACK,
    SYS_RT_SIGACTION,
    SYS_PRLIMIT64,
    SYS_CLOSE,
    SYS_PREAD64,
    SYS_STAT,
    SYS_FSTAT,
    SYS_FSTAT64,
    SYS_OPENAT,
    SYS_READLINK,
    SYS_READLINKAT,
    SYS_IOCTL,
    SYS_EPOLL_CREATE1,
    SYS_PIPE2,
    SYS_EPOLL_CTL,
    SYS_EPOLL_PWAIT,
    SYS_GETRANDOM,
    SYS_UNAME,
    SYS_STAT64,
    SYS_GETUID,
    SYS_GETGID,
    SYS_LLSEEK,
    SYS_MINCORE,
    SYS_TGKILL,
    SYS_GETRLIMIT,
    SYS_LSEEK,

    /// Profiling timers, also no-ops.
    SYS_SETITIMER,
    SYS_TIMER_CREATE,
    SYS_TIMER_SETTIME,
    SYS_TIMER_DELETE,
}

impl SyscallCode {
    /// Looks up the syscall `number` in the numbering of `arch`.
    #[must_use]
    pub fn from_u64(arch: Arch, number: u64) -> Option<Self> {
        SyscallCode::iter().find(|code| code.number(arch) == Some(number))
    }

    /// The syscall number on `arch`, `None` when the call does not exist there.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub const fn number(self, arch: Arch) -> Option<u64> {
        let (o32, n64) = match self {
            SyscallCode::SYS_MMAP => (4090, Some(5009)),
            SyscallCode::SYS_BRK => (4045, Some(5012)),
            SyscallCode::SYS_CLONE => (4120, Some(5055)),
            SyscallCode::SYS_EXIT_GROUP => (4246, Some(5205)),
            SyscallCode::SYS_READ => (4003, Some(5000)),
            SyscallCode::SYS_WRITE => (4004, Some(5001)),
            SyscallCode::SYS_FCNTL => (4055, Some(5070)),
            SyscallCode::SYS_EXIT => (4001, Some(5058)),
            SyscallCode::SYS_SCHED_YIELD => (4162, Some(5023)),
            SyscallCode::SYS_GETTID => (4222, Some(5178)),
            SyscallCode::SYS_FUTEX => (4238, Some(5194)),
            SyscallCode::SYS_OPEN => (4005, Some(5002)),
            SyscallCode::SYS_NANOSLEEP => (4166, Some(5034)),
            SyscallCode::SYS_CLOCK_GETTIME => (4263, Some(5222)),
            SyscallCode::SYS_GETPID => (4020, Some(5038)),
            SyscallCode::SYS_EVENTFD2 => (4325, Some(5284)),

            SyscallCode::SYS_MUNMAP => (4091, Some(5011)),
            SyscallCode::SYS_SCHED_GETAFFINITY => (4240, Some(5196)),
            SyscallCode::SYS_MADVISE => (4218, Some(5027)),
            SyscallCode::SYS_RT_SIGPROCMASK => (4195, Some(5014)),
            SyscallCode::SYS_SIGALTSTACK => (4206, Some(5129)),
            SyscallCode::SYS_RT_SIGACTION => (4194, Some(5013)),
            SyscallCode::SYS_PRLIMIT64 => (4338, Some(5297)),
            SyscallCode::SYS_CLOSE => (4006, Some(5003)),
            SyscallCode::SYS_PREAD64 => (4200, Some(5016)),
            SyscallCode::SYS_STAT => (4106, Some(5004)),
            SyscallCode::SYS_FSTAT => (4108, Some(5005)),
            SyscallCode::SYS_FSTAT64 => (4215, None),
            SyscallCode::SYS_OPENAT => (4288, Some(5247)),
            SyscallCode::SYS_READLINK => (4085, Some(5087)),
            SyscallCode::SYS_READLINKAT => (4298, Some(5257)),
            SyscallCode::SYS_IOCTL => (4054, Some(5015)),
            SyscallCode::SYS_EPOLL_CREATE1 => (4326, Some(5285)),
            SyscallCode::SYS_PIPE2 => (4328, Some(5287)),
            SyscallCode::SYS_EPOLL_CTL => (4249, Some(5208)),
            SyscallCode::SYS_EPOLL_PWAIT => (4313, Some(5272)),
            SyscallCode::SYS_GETRANDOM => (4353, Some(5313)),
            SyscallCode::SYS_UNAME => (4122, Some(5061)),
            SyscallCode::SYS_STAT64 => (4213, None),
            SyscallCode::SYS_GETUID => (4024, Some(5100)),
            SyscallCode::SYS_GETGID => (4047, Some(5102)),
            SyscallCode::SYS_LLSEEK => (4140, None),
            SyscallCode::SYS_MINCORE => (4217, Some(5026)),
            SyscallCode::SYS_TGKILL => (4266, Some(5225)),
            SyscallCode::SYS_GETRLIMIT => (4076, Some(5095)),
            SyscallCode::SYS_LSEEK => (4019, Some(5008)),

            SyscallCode::SYS_SETITIMER => (4104, Some(5036)),
            SyscallCode::SYS_TIMER_CREATE => (4257, Some(5216)),
            SyscallCode::SYS_TIMER_SETTIME => (4258, Some(5217)),
            SyscallCode::SYS_TIMER_DELETE => (4261, Some(5220)),
        };
        match arch {
            Arch::Mips32 => Some(o32),
            Arch::Mips64 => n64,
        }
    }

    /// Returns true for the calls the multi-threaded VM acknowledges with `(0, 0)`.
    #[must_use]
    pub const fn is_noop(self) -> bool {
        (self as usize) >= (SyscallCode::SYS_MUNMAP as usize)
    }
}

impl std::fmt::Display for SyscallCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_is_unique_per_arch() {
        for arch in [Arch::Mips32, Arch::Mips64] {
            let mut numbers: Vec<u64> = SyscallCode::iter().filter_map(|c| c.number(arch)).collect();
            let len = numbers.len();
            numbers.sort_unstable();
            numbers.dedup();
            assert_eq!(numbers.len(), len, "{arch:?}");
        }
    }

    #[test]
    fn lookup() {
        assert_eq!(SyscallCode::from_u64(Arch::Mips32, 4090), Some(SyscallCode::SYS_MMAP));
        assert_eq!(SyscallCode::from_u64(Arch::Mips64, 5009), Some(SyscallCode::SYS_MMAP));
        assert_eq!(SyscallCode::from_u64(Arch::Mips64, 5055), Some(SyscallCode::SYS_CLONE));
        assert_eq!(SyscallCode::from_u64(Arch::Mips32, 4215), Some(SyscallCode::SYS_FSTAT64));
        // fstat64 has no n64 counterpart
        assert_eq!(SyscallCode::SYS_FSTAT64.number(Arch::Mips64), None);
        assert_eq!(SyscallCode::from_u64(Arch::Mips32, 5009), None);
        assert_eq!(SyscallCode::from_u64(Arch::Mips32, 4999), None);
    }

    #[test]
    fn noop_classes() {
        assert!(!SyscallCode::SYS_EVENTFD2.is_noop());
        assert!(!SyscallCode::SYS_MMAP.is_noop());
        assert!(SyscallCode::SYS_MUNMAP.is_noop());
        assert!(SyscallCode::SYS_TIMER_DELETE.is_noop());
        assert!(SyscallCode::SYS_LSEEK.is_noop());
    }
}
