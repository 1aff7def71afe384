//! Syscall numbers and constants for x86_64 Linux

// Syscall numbers
pub const SYS_WRITE: u64 = 1;
pub const SYS_GETTID: u64 = 186;
pub const SYS_ARCH_PRCTL: u64 = 158;

// arch_prctl() operations
pub const ARCH_GET_FS: i32 = 0x1003;
