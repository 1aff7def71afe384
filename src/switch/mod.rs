//! Crossing between the managed and the proxy context
//!
//! A crossing swaps the calling thread's identity window (static TLS
//! block plus TCB header) with the proxy's image:
//!
//! - enter: save the window, copy the proxy image over it, and point the
//!   TCB self word at the window's own thread pointer so TLS lookups
//!   resolve in place. `header.self` keeps the image address, which leaves
//!   the TCB's internal lists where the proxy built them.
//! - leave: copy the window (with the proxy's mutations) back into the
//!   image, restore the image's self word, then restore the saved window.
//!
//! Between the two steps nothing on this thread may touch TLS, which rules
//! out logging and libc calls that set `errno`.
//!
//! Crossings are not reentrant and must be serialized by the caller; the
//! runtime holds a `CrossingLock` around every crossing.

pub mod slot;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub use slot::HardwareSlot;
pub use slot::{MemorySlot, ThreadSlot};

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::error::{Result, SplitError};
use crate::lock;
use crate::partition::{RegionDescriptor, TlsLayout};

fn current_tid() -> i32 {
    #[cfg(target_arch = "x86_64")]
    {
        splitproc_syscall::gettid()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        unsafe { libc::syscall(libc::SYS_gettid) as i32 }
    }
}

/// Everything needed to undo one crossing, at a stable address so the
/// emergency hook can reach it without TLS.
pub struct CrossingState {
    owner_tid: i32,
    window: *mut u8,
    image: *mut u8,
    len: usize,
    self_at: usize,
    header_self_at: usize,
    managed_tp: usize,
    image_tp: usize,
    saved: Box<[u8]>,
    released: AtomicBool,
}

impl CrossingState {
    unsafe fn swap_in(&mut self) {
        ptr::copy_nonoverlapping(self.window, self.saved.as_mut_ptr(), self.len);
        ptr::copy_nonoverlapping(self.image, self.window, self.len);
        (self.window.add(self.self_at) as *mut usize).write_unaligned(self.managed_tp);
    }

    /// Undo `swap_in`. Only the first call does anything.
    unsafe fn swap_out(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        ptr::copy_nonoverlapping(self.window, self.image, self.len);
        (self.image.add(self.self_at) as *mut usize).write_unaligned(self.image_tp);
        ptr::copy_nonoverlapping(self.saved.as_ptr(), self.window, self.len);
        true
    }

    unsafe fn word(base: *const u8, offset: usize) -> usize {
        (base.add(offset) as *const usize).read_unaligned()
    }

    /// Fixed fields right after entering. Runs with the proxy identity
    /// installed, so a mismatch comes back as the raw `(self, header.self)`
    /// words and the caller reports it after leaving.
    fn check_entered(&self) -> Option<(usize, usize)> {
        let (s, h) = unsafe {
            (
                Self::word(self.window, self.self_at),
                Self::word(self.window, self.header_self_at),
            )
        };
        if s != self.managed_tp || h != self.image_tp {
            Some((s, h))
        } else {
            None
        }
    }

    /// Fixed fields right after leaving: the window is back to what was
    /// saved and the image refers to itself again.
    fn check_left(&self) -> Result<()> {
        let (ws, wh, is, saved_s, saved_h) = unsafe {
            (
                Self::word(self.window, self.self_at),
                Self::word(self.window, self.header_self_at),
                Self::word(self.image, self.self_at),
                Self::word(self.saved.as_ptr(), self.self_at),
                Self::word(self.saved.as_ptr(), self.header_self_at),
            )
        };
        if ws != saved_s || wh != saved_h || is != self.image_tp {
            return Err(SplitError::Crossing(format!(
                "after leave: window self=0x{:x}/header=0x{:x} (want 0x{:x}/0x{:x}), image self=0x{:x} (want 0x{:x})",
                ws, wh, saved_s, saved_h, is, self.image_tp
            )));
        }
        Ok(())
    }
}

/// Counters for observing crossings from the outside.
#[derive(Debug, Default)]
pub struct CrossingProbe {
    active: AtomicUsize,
    max_active: AtomicUsize,
    total: AtomicU64,
}

impl CrossingProbe {
    fn on_enter(&self) {
        let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(n, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn on_leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Crossings currently in progress.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of crossings ever in progress at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

/// Per-runtime crossing machinery: the active crossing (if any), the
/// probe, and whether fixed fields are validated.
pub struct ContextSwitch {
    active: AtomicPtr<CrossingState>,
    probe: CrossingProbe,
    validate: bool,
}

impl ContextSwitch {
    pub fn new(validate: bool) -> Self {
        Self {
            active: AtomicPtr::new(ptr::null_mut()),
            probe: CrossingProbe::default(),
            validate,
        }
    }

    pub fn probe(&self) -> &CrossingProbe {
        &self.probe
    }

    /// Whether the calling thread is inside a crossing of this switch.
    pub fn in_proxy(&self) -> bool {
        let p = self.active.load(Ordering::SeqCst);
        !p.is_null() && unsafe { (*p).owner_tid } == current_tid()
    }

    /// Enter the proxy context.
    ///
    /// # Safety
    /// The caller must serialize all crossings of this switch, and `slot`
    /// and `proxy` must describe valid windows of `layout.len()` bytes.
    pub unsafe fn enter<'a>(
        &'a self,
        slot: &dyn ThreadSlot,
        proxy: &RegionDescriptor,
        layout: &TlsLayout,
    ) -> Result<Crossing<'a>> {
        if self.in_proxy() {
            return Err(SplitError::Crossing(
                "nested entry into the proxy context".into(),
            ));
        }
        if !proxy.initialized {
            return Err(SplitError::Crossing(
                "proxy region is not initialized".into(),
            ));
        }
        if proxy.size != layout.len() {
            return Err(SplitError::Crossing(format!(
                "proxy image is {} bytes but the layout needs {}",
                proxy.size,
                layout.len()
            )));
        }

        let managed_tp = slot.thread_pointer();
        let mut state = Box::new(CrossingState {
            owner_tid: current_tid(),
            window: (managed_tp - layout.tp_offset()) as *mut u8,
            image: proxy.base as *mut u8,
            len: layout.len(),
            self_at: layout.tp_offset() + layout.self_offset,
            header_self_at: layout.tp_offset() + layout.header_self_offset,
            managed_tp,
            image_tp: proxy.thread_pointer(),
            saved: vec![0u8; layout.len()].into_boxed_slice(),
            released: AtomicBool::new(false),
        });

        self.probe.on_enter();
        state.swap_in();
        self.active.store(&mut *state as *mut CrossingState, Ordering::SeqCst);

        let wrong = state.check_entered();
        let image_tp = state.image_tp;
        let crossing = Crossing {
            switch: self,
            state: Some(state),
        };
        if self.validate {
            if let Some((s, h)) = wrong {
                // Dropping the crossing puts the managed window back.
                drop(crossing);
                let e = SplitError::Crossing(format!(
                    "after enter: self=0x{:x} (want 0x{:x}), header.self=0x{:x} (want 0x{:x})",
                    s, managed_tp, h, image_tp
                ));
                log::error!("Crossing into proxy failed validation: {}", e);
                return Err(e);
            }
        }
        Ok(crossing)
    }

    /// Put the managed identity back from a signal handler running on the
    /// crossing thread. Async-signal-safe: no allocation, no TLS. The
    /// crossing's guard still releases everything else when it drops.
    pub fn emergency_leave(&self) -> bool {
        let p = self.active.load(Ordering::SeqCst);
        if p.is_null() {
            return false;
        }
        unsafe {
            if (*p).owner_tid != current_tid() {
                return false;
            }
            if !(*p).swap_out() {
                return false;
            }
        }
        // No logger here: it would take locks the interrupted code may hold.
        #[cfg(target_arch = "x86_64")]
        {
            const MSG: &[u8] = b"splitproc: left proxy context from a signal handler\n";
            let _ = unsafe { splitproc_syscall::write(2, MSG.as_ptr(), MSG.len()) };
        }
        true
    }
}

/// An active crossing. Dropping it leaves the proxy context.
pub struct Crossing<'a> {
    switch: &'a ContextSwitch,
    state: Option<Box<CrossingState>>,
}

impl Crossing<'_> {
    /// Leave explicitly, reporting validation failures.
    pub fn leave(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let state = match self.state.take() {
            Some(s) => s,
            None => return Ok(()),
        };
        let swapped = unsafe { state.swap_out() };
        self.switch.active.store(ptr::null_mut(), Ordering::SeqCst);
        self.switch.probe.on_leave();
        if !swapped {
            log::warn!("Crossing was already released by the emergency hook");
        }
        if self.switch.validate {
            state.check_left()?;
        }
        Ok(())
    }
}

impl Drop for Crossing<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("Leaving the proxy context corrupted thread identity: {}", e);
            std::process::abort();
        }
    }
}

/// Serializes crossings and owns what may only be touched inside one.
pub struct CrossingLock<T> {
    lock: lock::Mutex,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for CrossingLock<T> {}
unsafe impl<T: Send> Sync for CrossingLock<T> {}

impl<T> CrossingLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: lock::Mutex::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> CrossingLockGuard<'_, T> {
        self.lock.lock();
        CrossingLockGuard { owner: self }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

pub struct CrossingLockGuard<'a, T> {
    owner: &'a CrossingLock<T>,
}

impl<T> Deref for CrossingLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for CrossingLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for CrossingLockGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;

    fn setup() -> (TlsLayout, MemorySlot, Partition) {
        let layout = TlsLayout::x86_64(64);
        let slot = MemorySlot::new(layout);
        let partition = Partition::split(layout, &slot, 1 << 16).unwrap();
        (layout, slot, partition)
    }

    fn image_bytes(proxy: &RegionDescriptor) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(proxy.base as *const u8, proxy.size).to_vec() }
    }

    #[test]
    fn test_crossing_symmetry() {
        let (layout, slot, partition) = setup();
        slot.write(0, b"managed-tls-data");
        let before = slot.snapshot();

        let switch = ContextSwitch::new(true);
        let proxy = *partition.proxy();
        let crossing = unsafe { switch.enter(&slot, &proxy, &layout).unwrap() };

        // Inside: window holds the proxy image, self word relocated.
        let tp = slot.thread_pointer();
        assert_eq!(slot.read_word(layout.tp_offset()), tp);
        assert_eq!(slot.read_word(layout.tp_offset() + 16), proxy.thread_pointer());
        assert_ne!(&slot.snapshot()[..16], b"managed-tls-data");

        // Proxy mutates its TLS.
        slot.write(8, b"proxy!!!");
        crossing.leave().unwrap();

        assert_eq!(slot.snapshot(), before, "managed window must be bit-identical");
        let image = image_bytes(&proxy);
        assert_eq!(&image[8..16], b"proxy!!!", "proxy mutation must persist");
        let image_self = usize::from_ne_bytes(
            image[layout.tp_offset()..layout.tp_offset() + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(image_self, proxy.thread_pointer());
        assert_eq!(switch.probe().total(), 1);
        assert_eq!(switch.probe().active(), 0);
    }

    #[test]
    fn test_crossing_released_on_panic() {
        let (layout, slot, partition) = setup();
        let before = slot.snapshot();
        let switch = ContextSwitch::new(true);
        let proxy = *partition.proxy();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _crossing = unsafe { switch.enter(&slot, &proxy, &layout).unwrap() };
            panic!("library blew up");
        }));
        assert!(result.is_err());
        assert_eq!(slot.snapshot(), before);
        assert!(!switch.in_proxy());
        assert_eq!(switch.probe().active(), 0);
    }

    #[test]
    fn test_nested_entry_rejected() {
        let (layout, slot, partition) = setup();
        let switch = ContextSwitch::new(true);
        let proxy = *partition.proxy();
        let outer = unsafe { switch.enter(&slot, &proxy, &layout).unwrap() };
        assert!(switch.in_proxy());
        let inner = unsafe { switch.enter(&slot, &proxy, &layout) };
        assert!(matches!(inner, Err(SplitError::Crossing(_))));
        outer.leave().unwrap();
        assert!(!switch.in_proxy());
    }

    #[test]
    fn test_emergency_leave_then_drop() {
        let (layout, slot, partition) = setup();
        slot.write(0, b"abcdefgh");
        let before = slot.snapshot();
        let switch = ContextSwitch::new(true);
        let proxy = *partition.proxy();

        let crossing = unsafe { switch.enter(&slot, &proxy, &layout).unwrap() };
        assert!(switch.emergency_leave());
        assert_eq!(slot.snapshot(), before);
        assert!(!switch.emergency_leave(), "second release is a no-op");
        drop(crossing);
        assert_eq!(slot.snapshot(), before);
        assert!(!switch.emergency_leave());
    }

    #[test]
    fn test_uninitialized_proxy_rejected() {
        let (layout, slot, partition) = setup();
        let switch = ContextSwitch::new(false);
        let mut proxy = *partition.proxy();
        proxy.initialized = false;
        assert!(unsafe { switch.enter(&slot, &proxy, &layout) }.is_err());
        assert_eq!(switch.probe().total(), 0);
    }

    #[test]
    fn test_validation_catches_corrupted_image() {
        let (layout, slot, partition) = setup();
        let before = slot.snapshot();
        let proxy = *partition.proxy();
        // Break the image's header.self.
        unsafe {
            ((proxy.thread_pointer() + 16) as *mut usize).write_unaligned(0x1234);
        }
        let switch = ContextSwitch::new(true);
        let result = unsafe { switch.enter(&slot, &proxy, &layout) };
        match result {
            Err(SplitError::Crossing(msg)) => assert!(msg.contains("header.self=0x1234"), "{}", msg),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("corrupted image accepted"),
        }
        assert_eq!(slot.snapshot(), before);
        assert_eq!(switch.probe().active(), 0);
        assert!(!switch.in_proxy());
    }

    /// Crosses on the test thread's live thread pointer. Nothing runs
    /// between enter and leave, so no TLS access happens with the proxy
    /// identity installed.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[test]
    fn test_hardware_crossing_round_trip() {
        use std::cell::Cell;

        thread_local! {
            static MARK: Cell<u64> = const { Cell::new(0) };
        }
        MARK.with(|m| m.set(0x5eed));

        let layout = TlsLayout::probe(None).unwrap();
        let slot = HardwareSlot;
        let partition = Partition::split(layout, &slot, 1 << 20).unwrap();
        let proxy = *partition.proxy();
        let tp = slot.thread_pointer();
        let switch = ContextSwitch::new(true);

        for _ in 0..3 {
            let crossing = unsafe { switch.enter(&slot, &proxy, &layout) };
            let left = match crossing {
                Ok(c) => c.leave(),
                Err(e) => Err(e),
            };
            left.unwrap();
        }

        assert_eq!(slot.thread_pointer(), tp);
        assert_eq!(MARK.with(|m| m.get()), 0x5eed);
        assert_eq!(switch.probe().total(), 3);
        assert_eq!(switch.probe().active(), 0);
        assert!(!switch.in_proxy());
    }

    #[test]
    fn test_crossing_lock_serializes() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(CrossingLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..500 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 2000);
        assert!(!lock.is_locked());
    }
}
