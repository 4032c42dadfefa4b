/// Page geometry shared by the memory and the tree index.
pub const PAGE_ADDR_SIZE: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_ADDR_SIZE;
pub const PAGE_ADDR_MASK: u64 = (PAGE_SIZE - 1) as u64;

/// Number of consecutive steps a thread may run before it is preempted.
pub const SCHED_QUANTUM: u64 = 100_000;

/// Steps per second of the pseudo monotonic clock.
pub const HZ: u64 = 10_000_000;

/// Guest file descriptors.
pub mod fd {
    pub const FD_STDIN: u64 = 0;
    pub const FD_STDOUT: u64 = 1;
    pub const FD_STDERR: u64 = 2;
    pub const FD_HINT_READ: u64 = 3;
    pub const FD_HINT_WRITE: u64 = 4;
    pub const FD_PREIMAGE_READ: u64 = 5;
    pub const FD_PREIMAGE_WRITE: u64 = 6;
    pub const FD_EVENT_FD: u64 = 100;
}

/// MIPS errno values returned in `$a3`.
pub mod errno {
    pub const MIPS_EBADF: u64 = 0x9;
    pub const MIPS_EAGAIN: u64 = 0xb;
    pub const MIPS_EINVAL: u64 = 0x16;
}

pub mod clone {
    pub const CLONE_VM: u64 = 0x100;
    pub const CLONE_FS: u64 = 0x200;
    pub const CLONE_FILES: u64 = 0x400;
    pub const CLONE_SIGHAND: u64 = 0x800;
    pub const CLONE_THREAD: u64 = 0x10000;
    pub const CLONE_SYSVSEM: u64 = 0x40000;

    /// The only flag combination `clone` accepts: a Go runtime thread.
    pub const VALID_CLONE_FLAGS: u64 =
        CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND | CLONE_SYSVSEM | CLONE_THREAD;
}

pub mod futex {
    pub const FUTEX_WAIT_PRIVATE: u64 = 128;
    pub const FUTEX_WAKE_PRIVATE: u64 = 129;
}

pub mod clock {
    pub const CLOCK_GETTIME_REALTIME: u64 = 0;
    pub const CLOCK_GETTIME_MONOTONIC: u64 = 1;
}

pub mod fcntl {
    pub const F_GETFD: u64 = 1;
    pub const F_GETFL: u64 = 3;
}

/// `EFD_NONBLOCK` as defined by the MIPS Linux ABI.
pub const EFD_NONBLOCK: u64 = 0x80;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_mask() {
        assert_eq!(clone::VALID_CLONE_FLAGS, 0x50f00);
    }

    #[test]
    fn page_geometry() {
        assert_eq!(PAGE_SIZE, 4096);
        assert_eq!(PAGE_ADDR_MASK, 0xfff);
    }
}
