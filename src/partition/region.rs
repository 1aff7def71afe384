//! Address-space reservation and region descriptors

use std::ptr;
use std::sync::OnceLock;

use libc::{
    c_void, mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_NORESERVE,
    MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};

use super::layout::align_up;
use crate::error::{Result, SplitError};

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

/// Location of one execution context's thread-identity image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Start of the image (bottom of the static TLS block).
    pub base: usize,
    /// Bytes of image: static TLS plus TCB header.
    pub size: usize,
    /// Offset of the thread pointer inside the image.
    pub tp_offset: usize,
    pub initialized: bool,
    /// Bumped every time the region is rebuilt.
    pub generation: u64,
}

impl RegionDescriptor {
    pub fn thread_pointer(&self) -> usize {
        self.base + self.tp_offset
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// A span of address space held for the proxy for the life of the
/// partition. Nothing else in the process can be mapped into it.
#[derive(Debug)]
pub struct Reservation {
    base: *mut u8,
    len: usize,
}

// SAFETY: the reservation is plain address space; access to its contents
// is serialized by the partition's owner.
unsafe impl Send for Reservation {}

impl Reservation {
    pub fn reserve(len: usize) -> Result<Self> {
        let len = align_up(len.max(1), page_size());
        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == MAP_FAILED {
            return Err(SplitError::Partition(format!(
                "cannot reserve {} bytes of address space: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            base: addr as *mut u8,
            len,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Make the first `len` bytes readable and writable.
    pub fn commit(&self, len: usize) -> Result<()> {
        let len = align_up(len, page_size());
        if len > self.len {
            return Err(SplitError::Partition(format!(
                "commit of {} bytes exceeds reservation of {}",
                len, self.len
            )));
        }
        let ret = unsafe { mprotect(self.base as *mut c_void, len, PROT_READ | PROT_WRITE) };
        if ret != 0 {
            return Err(SplitError::Partition(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Throw away everything in the reservation by mapping fresh pages
    /// over it in place. The address range itself stays held.
    pub fn discard(&self) -> Result<()> {
        let addr = unsafe {
            mmap(
                self.base as *mut c_void,
                self.len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE | MAP_FIXED,
                -1,
                0,
            )
        };
        if addr == MAP_FAILED || addr as *mut u8 != self.base {
            return Err(SplitError::Partition(format!(
                "cannot discard proxy region at {:p}: {}",
                self.base,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            munmap(self.base as *mut c_void, self.len);
        }
    }
}
