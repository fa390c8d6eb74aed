//! Syscall number to name lookup for trace output.
//!
//! Only the syscalls that commonly show up when debugging a command are
//! listed; anything else is printed by number.

use std::collections::HashMap;

use once_cell::sync::Lazy;

#[cfg(target_arch = "x86_64")]
const TABLE: &[(u64, &str)] = &[
    (0, "read"),
    (1, "write"),
    (2, "open"),
    (3, "close"),
    (4, "stat"),
    (5, "fstat"),
    (6, "lstat"),
    (7, "poll"),
    (8, "lseek"),
    (9, "mmap"),
    (10, "mprotect"),
    (11, "munmap"),
    (12, "brk"),
    (13, "rt_sigaction"),
    (14, "rt_sigprocmask"),
    (16, "ioctl"),
    (17, "pread64"),
    (20, "writev"),
    (21, "access"),
    (22, "pipe"),
    (23, "select"),
    (32, "dup"),
    (33, "dup2"),
    (35, "nanosleep"),
    (39, "getpid"),
    (41, "socket"),
    (42, "connect"),
    (43, "accept"),
    (44, "sendto"),
    (45, "recvfrom"),
    (49, "bind"),
    (50, "listen"),
    (56, "clone"),
    (57, "fork"),
    (58, "vfork"),
    (59, "execve"),
    (60, "exit"),
    (61, "wait4"),
    (62, "kill"),
    (63, "uname"),
    (72, "fcntl"),
    (78, "getdents"),
    (79, "getcwd"),
    (80, "chdir"),
    (82, "rename"),
    (83, "mkdir"),
    (84, "rmdir"),
    (87, "unlink"),
    (89, "readlink"),
    (96, "gettimeofday"),
    (102, "getuid"),
    (104, "getgid"),
    (107, "geteuid"),
    (108, "getegid"),
    (110, "getppid"),
    (137, "statfs"),
    (155, "pivot_root"),
    (157, "prctl"),
    (158, "arch_prctl"),
    (165, "mount"),
    (166, "umount2"),
    (186, "gettid"),
    (202, "futex"),
    (217, "getdents64"),
    (218, "set_tid_address"),
    (228, "clock_gettime"),
    (231, "exit_group"),
    (257, "openat"),
    (262, "newfstatat"),
    (272, "unshare"),
    (273, "set_robust_list"),
    (293, "pipe2"),
    (302, "prlimit64"),
    (308, "setns"),
    (318, "getrandom"),
    (332, "statx"),
    (334, "rseq"),
    (435, "clone3"),
];

#[cfg(target_arch = "aarch64")]
const TABLE: &[(u64, &str)] = &[
    (17, "getcwd"),
    (23, "dup"),
    (24, "dup3"),
    (25, "fcntl"),
    (29, "ioctl"),
    (34, "mkdirat"),
    (35, "unlinkat"),
    (39, "umount2"),
    (40, "mount"),
    (41, "pivot_root"),
    (43, "statfs"),
    (49, "chdir"),
    (56, "openat"),
    (57, "close"),
    (59, "pipe2"),
    (61, "getdents64"),
    (62, "lseek"),
    (63, "read"),
    (64, "write"),
    (66, "writev"),
    (67, "pread64"),
    (78, "readlinkat"),
    (79, "newfstatat"),
    (80, "fstat"),
    (93, "exit"),
    (94, "exit_group"),
    (96, "set_tid_address"),
    (97, "unshare"),
    (98, "futex"),
    (99, "set_robust_list"),
    (101, "nanosleep"),
    (113, "clock_gettime"),
    (129, "kill"),
    (134, "rt_sigaction"),
    (135, "rt_sigprocmask"),
    (160, "uname"),
    (167, "prctl"),
    (172, "getpid"),
    (173, "getppid"),
    (174, "getuid"),
    (175, "geteuid"),
    (176, "getgid"),
    (177, "getegid"),
    (178, "gettid"),
    (198, "socket"),
    (200, "bind"),
    (201, "listen"),
    (203, "connect"),
    (214, "brk"),
    (215, "munmap"),
    (220, "clone"),
    (221, "execve"),
    (222, "mmap"),
    (226, "mprotect"),
    (260, "wait4"),
    (261, "prlimit64"),
    (268, "setns"),
    (278, "getrandom"),
    (291, "statx"),
    (293, "rseq"),
    (435, "clone3"),
];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const TABLE: &[(u64, &str)] = &[];

static NAMES: Lazy<HashMap<u64, &'static str>> = Lazy::new(|| TABLE.iter().copied().collect());

/// Name of syscall `number` on this architecture, if known.
pub fn name(number: u64) -> Option<&'static str> {
    NAMES.get(&number).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_no_duplicate_numbers() {
        assert_eq!(NAMES.len(), TABLE.len());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_64_names() {
        assert_eq!(name(59), Some("execve"));
        assert_eq!(name(165), Some("mount"));
        assert_eq!(name(100_000), None);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_aarch64_names() {
        assert_eq!(name(221), Some("execve"));
        assert_eq!(name(40), Some("mount"));
    }
}
