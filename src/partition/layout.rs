//! Geometry of the thread-identity window
//!
//! On x86_64 glibc (TLS variant II) the static TLS block sits directly
//! below the thread pointer and the TCB header starts at it:
//!
//! ```text
//!   tp - tls_size                tp                       tp + tcb_size
//!   |------ static TLS block ----|-- tcbhead_t (used part) --|
//!                                ^ self (offset 0), header.self (offset 16)
//! ```
//!
//! A crossing copies this whole window. The TLS size comes from the
//! running process rather than from a constant, since it depends on which
//! objects with TLS segments are loaded.

use crate::error::{Result, SplitError};

/// Used part of `tcbhead_t` on x86_64 glibc:
/// `&((struct pthread *) tp)->header.__unused2 - tp`.
pub const X86_64_TCB_HEADER_SIZE: usize = 120;

/// Offset of `tcbhead_t.tcb`, the word `%fs:0` loads.
pub const X86_64_SELF_OFFSET: usize = 0;

/// Offset of `tcbhead_t.self`.
pub const X86_64_HEADER_SELF_OFFSET: usize = 16;

const TLS_BLOCK_ALIGN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsLayout {
    /// Bytes of static TLS below the thread pointer.
    pub tls_size: usize,
    /// Bytes of TCB header at and above the thread pointer.
    pub tcb_size: usize,
    /// Offset from the thread pointer of the pointer TLS lookups go through.
    pub self_offset: usize,
    /// Offset from the thread pointer of the TCB's own self reference.
    pub header_self_offset: usize,
}

impl TlsLayout {
    /// x86_64 glibc geometry with an explicit TLS size.
    pub fn x86_64(tls_size: usize) -> Self {
        Self {
            tls_size: align_up(tls_size, TLS_BLOCK_ALIGN),
            tcb_size: X86_64_TCB_HEADER_SIZE,
            self_offset: X86_64_SELF_OFFSET,
            header_self_offset: X86_64_HEADER_SELF_OFFSET,
        }
    }

    /// Derive the layout of the running process.
    ///
    /// `tls_override` replaces the probed TLS size. Fails if the calling
    /// thread's TCB does not have the expected self references.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub fn probe(tls_override: Option<usize>) -> Result<Self> {
        let tls_size = match tls_override {
            Some(n) => n,
            None => static_tls_size(),
        };
        let layout = Self::x86_64(tls_size);

        let tp = splitproc_syscall::thread_pointer();
        let fs = splitproc_syscall::arch_get_fs()
            .map_err(|e| SplitError::Partition(format!("arch_prctl(ARCH_GET_FS) failed: {}", e)))?;
        if fs as usize != tp {
            return Err(SplitError::Partition(format!(
                "FS base 0x{:x} does not match TCB self pointer 0x{:x}",
                fs, tp
            )));
        }
        // SAFETY: tp is the live TCB of the calling thread.
        unsafe { layout.check_fixed_fields(tp as *const u8, tp, tp) }
            .map_err(|e| SplitError::Partition(format!("incompatible thread library: {}", e)))?;

        log::debug!(
            "Probed TLS layout: tls={} tcb={} (tp=0x{:x})",
            layout.tls_size,
            layout.tcb_size,
            tp
        );
        Ok(layout)
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
    pub fn probe(_tls_override: Option<usize>) -> Result<Self> {
        Err(SplitError::Partition(
            "thread-identity layout is only known for x86_64 Linux".into(),
        ))
    }

    /// Total window size.
    pub fn len(&self) -> usize {
        self.tls_size + self.tcb_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the thread pointer from the start of the window.
    pub fn tp_offset(&self) -> usize {
        self.tls_size
    }

    /// Check the self-reference words of the TCB at `tp`.
    ///
    /// # Safety
    /// `tp` must point to at least `tcb_size` readable bytes.
    pub unsafe fn check_fixed_fields(
        &self,
        tp: *const u8,
        expected_self: usize,
        expected_header_self: usize,
    ) -> Result<()> {
        let self_ptr = (tp.add(self.self_offset) as *const usize).read_unaligned();
        let header_self = (tp.add(self.header_self_offset) as *const usize).read_unaligned();
        if self_ptr != expected_self || header_self != expected_header_self {
            return Err(SplitError::Crossing(format!(
                "TCB fixed fields mismatch at {:p}: self=0x{:x} (want 0x{:x}), header.self=0x{:x} (want 0x{:x})",
                tp, self_ptr, expected_self, header_self, expected_header_self
            )));
        }
        Ok(())
    }
}

pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Offset below the thread pointer of a TLS block of `memsz` bytes placed
/// under `offset` bytes of earlier blocks. The block start keeps the
/// alignment phase of its segment's `p_vaddr`, as glibc's
/// `_dl_determine_tlsoffset` places it.
fn tls_block_offset(offset: usize, memsz: usize, align: usize, vaddr: usize) -> usize {
    let align = align.max(1);
    let firstbyte = vaddr.wrapping_neg() & (align - 1);
    align_up((offset + memsz).saturating_sub(firstbyte), align) + firstbyte
}

/// Size of the static TLS area used by every object loaded right now,
/// following the variant II rule: each module sits below the previous one.
///
/// glibc also reserves a surplus below that for objects `dlopen`ed later
/// with initial-exec TLS. The surplus is not part of the result, so a
/// process that loads such objects after startup has to configure
/// `SPLITPROC_TLS_BYTES` to cover them.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub fn static_tls_size() -> usize {
    use std::ffi::c_void;

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let offset = &mut *(data as *mut usize);
        let info = &*info;
        if info.dlpi_phdr.is_null() {
            return 0;
        }
        let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for phdr in phdrs.iter().filter(|p| p.p_type == libc::PT_TLS) {
            *offset = tls_block_offset(
                *offset,
                phdr.p_memsz as usize,
                phdr.p_align as usize,
                phdr.p_vaddr as usize,
            );
        }
        0
    }

    let mut offset: usize = 0;
    unsafe {
        libc::dl_iterate_phdr(Some(visit), &mut offset as *mut usize as *mut c_void);
    }
    offset
}
