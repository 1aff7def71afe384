//! Raw syscall wrappers for splitproc
//!
//! This crate provides no_std syscall wrappers using inline assembly.
//! They are used on the crossing path, where the calling thread's TLS
//! image belongs to the other context and libc (whose `errno` lives in
//! TLS) must not be entered.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(target_arch = "x86_64")]
pub mod raw;
#[cfg(target_arch = "x86_64")]
pub mod syscalls;
pub mod constants;
pub mod errno;

#[cfg(target_arch = "x86_64")]
pub use syscalls::*;
pub use constants::*;
pub use errno::Errno;
