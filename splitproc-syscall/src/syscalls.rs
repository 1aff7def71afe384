//! Higher-level syscall wrappers
//!
//! Type-safe wrappers around raw syscalls with proper error handling.
//! None of these touch TLS, so they stay valid while a crossing has
//! the proxy's thread identity installed.

use core::arch::asm;

use crate::constants::*;
use crate::errno::Errno;
use crate::raw;

/// Write to file descriptor
#[inline(always)]
pub unsafe fn write(fd: i32, buf: *const u8, count: usize) -> Result<usize, Errno> {
    let ret = raw::syscall3(SYS_WRITE, fd as u64, buf as u64, count as u64);
    Errno::from_syscall_ret(ret)
}

/// Kernel thread id of the caller
#[inline(always)]
pub fn gettid() -> i32 {
    unsafe { raw::syscall0(SYS_GETTID) as i32 }
}

/// Read the FS base of the calling thread through the kernel.
#[inline(always)]
pub fn arch_get_fs() -> Result<u64, Errno> {
    let mut addr: u64 = 0;
    let ret = unsafe {
        raw::syscall2(
            SYS_ARCH_PRCTL,
            ARCH_GET_FS as u64,
            &mut addr as *mut u64 as u64,
        )
    };
    Errno::from_syscall_ret(ret).map(|_| addr)
}

/// Thread pointer of the calling thread, read from the TCB self slot.
///
/// On x86_64 the word at `%fs:0` holds the address the FS base points
/// to. Thread-local lookups resolve against this word, which is what a
/// crossing rewrites.
#[inline(always)]
pub fn thread_pointer() -> usize {
    let tp: usize;
    unsafe {
        asm!(
            "mov {}, qword ptr fs:0",
            out(reg) tp,
            options(nostack, preserves_flags, readonly)
        );
    }
    tp
}
