//! Error handling for syscalls

use core::fmt;

/// Syscall error wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// Check if return value is an error (negative values in range [-4095, -1])
    #[inline(always)]
    pub fn from_syscall_ret(ret: i64) -> Result<usize, Self> {
        if (-4095..0).contains(&ret) {
            Err(Errno(-ret as i32))
        } else {
            Ok(ret as usize)
        }
    }

    pub const EINVAL: i32 = 22;
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Errno {}
