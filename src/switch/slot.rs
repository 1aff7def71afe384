//! Where the calling thread's identity window lives

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::partition::TlsLayout;

/// Source of the thread pointer a crossing swaps identity under.
///
/// # Safety
/// For every thread that may cross, `thread_pointer()` must return an
/// address with `layout.tls_size` bytes of writable memory below it and
/// `layout.tcb_size` bytes at and above it, for the layout the slot is
/// used with.
pub unsafe trait ThreadSlot: Send + Sync {
    fn thread_pointer(&self) -> usize;
}

/// The hardware thread pointer of the calling thread (x86_64 `%fs`).
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareSlot;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
unsafe impl ThreadSlot for HardwareSlot {
    #[inline(always)]
    fn thread_pointer(&self) -> usize {
        splitproc_syscall::thread_pointer()
    }
}

/// An identity window backed by ordinary memory.
///
/// Used where the proxy library does not consult the hardware thread
/// pointer, and by tests, which must not rewrite the live TCB of the
/// test harness thread.
pub struct MemorySlot {
    base: NonNull<u8>,
    alloc_layout: Layout,
    layout: TlsLayout,
}

// SAFETY: the window is only written through raw pointers by crossings,
// which are serialized by the owning runtime.
unsafe impl Send for MemorySlot {}
unsafe impl Sync for MemorySlot {}

impl MemorySlot {
    /// Allocate a zeroed window whose TCB self references point at its
    /// own thread pointer, like a freshly created thread's.
    pub fn new(layout: TlsLayout) -> Self {
        let alloc_layout = Layout::from_size_align(layout.len().max(1), 64)
            .unwrap_or_else(|_| Layout::new::<[u8; 64]>());
        let ptr = unsafe { alloc::alloc_zeroed(alloc_layout) };
        let base = match NonNull::new(ptr) {
            Some(p) => p,
            None => alloc::handle_alloc_error(alloc_layout),
        };
        let slot = Self {
            base,
            alloc_layout,
            layout,
        };
        let tp = slot.tp();
        slot.write_word(layout.tp_offset() + layout.self_offset, tp);
        slot.write_word(layout.tp_offset() + layout.header_self_offset, tp);
        slot
    }

    fn tp(&self) -> usize {
        self.base.as_ptr() as usize + self.layout.tp_offset()
    }

    pub fn layout(&self) -> TlsLayout {
        self.layout
    }

    /// Copy of the whole window.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.layout.len()];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr(), out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Overwrite bytes at `offset` from the start of the window.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.layout.len(), "write past window");
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    pub fn read_word(&self, offset: usize) -> usize {
        assert!(offset + 8 <= self.layout.len(), "read past window");
        unsafe { (self.base.as_ptr().add(offset) as *const usize).read_unaligned() }
    }

    pub fn write_word(&self, offset: usize, value: usize) {
        self.write(offset, &value.to_ne_bytes());
    }
}

unsafe impl ThreadSlot for MemorySlot {
    fn thread_pointer(&self) -> usize {
        self.tp()
    }
}

impl Drop for MemorySlot {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.alloc_layout) };
    }
}
