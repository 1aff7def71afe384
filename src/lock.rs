//! Futex-based primitives
//!
//! These stay usable around a crossing: they never allocate and never
//! poison, so a panic unwinding out of the proxy context cannot leave the
//! crossing path or the checkpoint gate permanently wedged.

use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug)]
#[repr(C)]
pub struct Futex {
    pub raw: AtomicI32,
}

impl Default for Futex {
    fn default() -> Self {
        Self::new()
    }
}

impl Futex {
    pub const fn new() -> Self {
        Self {
            raw: AtomicI32::new(0),
        }
    }

    pub fn get(&self) -> u32 {
        self.raw.load(Ordering::SeqCst) as u32
    }

    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        self.raw
            .compare_exchange(current as i32, new as i32, Ordering::SeqCst, Ordering::SeqCst)
            .map(|v| v as u32)
            .map_err(|v| v as u32)
    }

    /// Returns the previous value.
    pub fn fetch_add(&self, v: u32) -> u32 {
        self.raw.fetch_add(v as i32, Ordering::SeqCst) as u32
    }

    /// Returns the previous value.
    pub fn fetch_sub(&self, v: u32) -> u32 {
        self.raw.fetch_sub(v as i32, Ordering::SeqCst) as u32
    }

    /// Returns the previous value.
    pub fn fetch_and(&self, v: u32) -> u32 {
        self.raw.fetch_and(v as i32, Ordering::SeqCst) as u32
    }

    pub fn wake_all(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    /// Sleep while the word still holds `expected`. Spurious wakeups are
    /// possible; callers re-check their condition.
    pub fn wait(&self, expected: u32) {
        let timeout = libc::timespec {
            tv_sec: 120,
            tv_nsec: 0,
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAIT,
                expected as i32,
                &timeout as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EAGAIN && errno != libc::EINTR && errno != libc::ETIMEDOUT {
                panic!("futex_wait failed: {}", errno);
            }
        }
    }

    /// Block until `done(value)` holds.
    pub fn wait_until(&self, done: impl Fn(u32) -> bool) {
        loop {
            let v = self.get();
            if done(v) {
                break;
            }
            self.wait(v);
        }
    }
}

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Three-state futex mutex (unlocked / locked / locked with waiters).
#[repr(C)]
pub struct Mutex {
    pub raw: AtomicI32,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            raw: AtomicI32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) {
        if self
            .raw
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        while self.raw.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.raw as *const AtomicI32,
                    libc::FUTEX_WAIT,
                    CONTENDED,
                    std::ptr::null::<libc::timespec>(),
                    std::ptr::null::<u32>(),
                    0u32,
                )
            };
            if ret == -1 {
                let errno = unsafe { *libc::__errno_location() };
                if errno != libc::EWOULDBLOCK && errno != libc::EINTR {
                    panic!("mutex_lock futex failed: {}", errno);
                }
            }
        }
    }

    pub fn trylock(&self) -> bool {
        self.raw
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        if self.raw.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.raw as *const AtomicI32,
                    libc::FUTEX_WAKE,
                    1,
                    std::ptr::null::<libc::timespec>(),
                    std::ptr::null::<u32>(),
                    0u32,
                )
            };
            if ret == -1 {
                panic!("mutex_unlock futex wake failed");
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.load(Ordering::SeqCst) != UNLOCKED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_futex_arith() {
        let f = Futex::new();
        assert_eq!(f.fetch_add(3), 0);
        assert_eq!(f.fetch_sub(1), 3);
        assert_eq!(f.get(), 2);
        assert_eq!(f.compare_exchange(2, 0x8000_0002), Ok(2));
        assert_eq!(f.fetch_and(!0x8000_0000), 0x8000_0002);
        assert_eq!(f.get(), 2);
    }

    #[test]
    fn test_futex_wait_until_woken() {
        let f = Arc::new(Futex::new());
        let f2 = Arc::clone(&f);
        let h = thread::spawn(move || {
            f2.wait_until(|v| v == 5);
        });
        thread::sleep(std::time::Duration::from_millis(20));
        f.fetch_add(5);
        f.wake_all();
        h.join().unwrap();
    }

    #[test]
    fn test_mutex_trylock() {
        let m = Mutex::new();
        assert!(m.trylock());
        assert!(!m.trylock());
        m.unlock();
        assert!(m.trylock());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn test_mutex_excludes() {
        struct Shared {
            m: Mutex,
            counter: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            m: Mutex::new(),
            counter: std::cell::UnsafeCell::new(0),
        });
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        s.m.lock();
                        unsafe { *s.counter.get() += 1 };
                        s.m.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *shared.counter.get() }, 4000);
    }
}
