use cannon_primitives::consts::{
    errno::{MIPS_EBADF, MIPS_EINVAL},
    fcntl::{F_GETFD, F_GETFL},
    fd::*,
};

use crate::Arch;

use super::SyscallFeatures;

/// `fcntl(fd, cmd)`, answering `F_GETFD` and `F_GETFL` for the fixed descriptors.
#[must_use]
pub fn sys_fcntl(arch: Arch, features: SyscallFeatures, a0: u64, a1: u64) -> (u64, u64) {
    let error = arch.sys_error_signal();
    match a1 {
        F_GETFD if features.fcntl_getfd => match a0 {
            FD_STDIN | FD_STDOUT | FD_STDERR | FD_PREIMAGE_READ | FD_HINT_READ
            | FD_PREIMAGE_WRITE | FD_HINT_WRITE => (0, 0), // no flags set
            _ => (error, MIPS_EBADF),
        },
        F_GETFL => match a0 {
            FD_STDIN | FD_PREIMAGE_READ | FD_HINT_READ => (0, 0), // O_RDONLY
            FD_STDOUT | FD_STDERR | FD_PREIMAGE_WRITE | FD_HINT_WRITE => (1, 0), // O_WRONLY
            _ => (error, MIPS_EBADF),
        },
        // cmd not recognized by this kernel
        _ => (error, MIPS_EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: SyscallFeatures = SyscallFeatures { fcntl_getfd: true, eventfd: true };

    #[test]
    fn get_fl() {
        assert_eq!(sys_fcntl(Arch::Mips32, ALL, FD_STDIN, F_GETFL), (0, 0));
        assert_eq!(sys_fcntl(Arch::Mips32, ALL, FD_HINT_WRITE, F_GETFL), (1, 0));
        assert_eq!(sys_fcntl(Arch::Mips32, ALL, 42, F_GETFL), (0xFFFF_FFFF, MIPS_EBADF));
    }

    #[test]
    fn get_fd_depends_on_version() {
        assert_eq!(sys_fcntl(Arch::Mips64, ALL, FD_PREIMAGE_READ, F_GETFD), (0, 0));
        assert_eq!(sys_fcntl(Arch::Mips64, ALL, 42, F_GETFD), (u64::MAX, MIPS_EBADF));
        let legacy = SyscallFeatures::default();
        assert_eq!(sys_fcntl(Arch::Mips32, legacy, FD_STDIN, F_GETFD), (0xFFFF_FFFF, MIPS_EINVAL));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(sys_fcntl(Arch::Mips32, ALL, FD_STDIN, 4), (0xFFFF_FFFF, MIPS_EINVAL));
    }
}
