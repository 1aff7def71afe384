//! Checkpoint inhibition
//!
//! Application threads hold an inhibit guard for the duration of every
//! intercepted call. A checkpoint or restore holds the quiesce guard, which
//! waits for all inhibitors to drain and keeps new ones out until it drops.
//!
//! The gate is a single futex word: the low 31 bits count inhibitors, the
//! top bit marks a pending or active quiesce.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::{Result, SplitError};
use crate::lock::Futex;

const QUIESCE: u32 = 0x8000_0000;
const COUNT_MASK: u32 = !QUIESCE;

thread_local! {
    // (gate address, depth) for every gate this thread currently inhibits.
    static DEPTH: RefCell<Vec<(usize, u32)>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
pub struct CheckpointGate {
    word: Futex,
}

impl CheckpointGate {
    pub const fn new() -> Self {
        Self { word: Futex::new() }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn depth(&self) -> u32 {
        let key = self.key();
        DEPTH.with(|d| {
            d.borrow()
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        })
    }

    fn set_depth(&self, depth: u32) {
        let key = self.key();
        DEPTH.with(|d| {
            let mut d = d.borrow_mut();
            match d.iter().position(|(k, _)| *k == key) {
                Some(i) if depth == 0 => {
                    d.swap_remove(i);
                }
                Some(i) => d[i].1 = depth,
                None if depth > 0 => d.push((key, depth)),
                None => {}
            }
        });
    }

    /// Keep checkpoints out until the guard drops. Reentrant: a thread that
    /// already inhibits never waits on a pending quiesce.
    pub fn inhibit(&self) -> InhibitGuard<'_> {
        let depth = self.depth();
        if depth > 0 {
            self.word.fetch_add(1);
        } else {
            loop {
                let v = self.word.get();
                if v & QUIESCE != 0 {
                    self.word.wait(v);
                    continue;
                }
                if self.word.compare_exchange(v, v + 1).is_ok() {
                    break;
                }
            }
        }
        self.set_depth(depth + 1);
        InhibitGuard {
            gate: self,
            _not_send: PhantomData,
        }
    }

    /// Wait for every inhibitor to drain and keep new ones out until the
    /// returned guard drops.
    pub fn quiesce(&self) -> Result<QuiesceGuard<'_>> {
        if self.depth() > 0 {
            return Err(SplitError::Crossing(
                "quiesce requested by a thread inside an intercepted call".into(),
            ));
        }
        loop {
            let v = self.word.get();
            if v & QUIESCE != 0 {
                self.word.wait(v);
                continue;
            }
            if self.word.compare_exchange(v, v | QUIESCE).is_ok() {
                break;
            }
        }
        log::debug!("Quiesce pending, {} inhibitors to drain", self.inhibitors());
        self.word.wait_until(|v| v & COUNT_MASK == 0);
        log::debug!("Quiesced");
        Ok(QuiesceGuard { gate: self })
    }

    /// Inhibitors currently holding the gate.
    pub fn inhibitors(&self) -> u32 {
        self.word.get() & COUNT_MASK
    }

    pub fn is_quiesced(&self) -> bool {
        self.word.get() & QUIESCE != 0
    }
}

/// Holds one inhibition. Bound to the thread that took it.
pub struct InhibitGuard<'a> {
    gate: &'a CheckpointGate,
    _not_send: PhantomData<*const ()>,
}

impl Drop for InhibitGuard<'_> {
    fn drop(&mut self) {
        let depth = self.gate.depth();
        self.gate.set_depth(depth.saturating_sub(1));
        let prev = self.gate.word.fetch_sub(1);
        if prev & QUIESCE != 0 && prev & COUNT_MASK == 1 {
            self.gate.word.wake_all();
        }
    }
}

/// Proof that the gate is quiesced. Restore operations take it by
/// reference.
pub struct QuiesceGuard<'a> {
    gate: &'a CheckpointGate,
}

impl QuiesceGuard<'_> {
    /// Whether this guard quiesces `gate`.
    pub fn guards(&self, gate: &CheckpointGate) -> bool {
        std::ptr::eq(self.gate, gate)
    }
}

impl Drop for QuiesceGuard<'_> {
    fn drop(&mut self) {
        self.gate.word.fetch_and(COUNT_MASK);
        self.gate.word.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_inhibit_counts() {
        let gate = CheckpointGate::new();
        {
            let _a = gate.inhibit();
            let _b = gate.inhibit();
            assert_eq!(gate.inhibitors(), 2);
        }
        assert_eq!(gate.inhibitors(), 0);
        let q = gate.quiesce().unwrap();
        assert!(gate.is_quiesced());
        assert!(q.guards(&gate));
        drop(q);
        assert!(!gate.is_quiesced());
    }

    #[test]
    fn test_quiesce_inside_inhibit_rejected() {
        let gate = CheckpointGate::new();
        let _g = gate.inhibit();
        assert!(gate.quiesce().is_err());
    }

    #[test]
    fn test_quiesce_waits_for_inhibitors() {
        let gate = Arc::new(CheckpointGate::new());
        let quiesced = Arc::new(AtomicBool::new(false));
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let g = Arc::clone(&gate);
        let holder = thread::spawn(move || {
            let _outer = g.inhibit();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            // Reentrant inhibit must not block behind the pending quiesce.
            let _inner = g.inhibit();
            assert_eq!(g.inhibitors(), 2);
        });
        held_rx.recv().unwrap();

        let g = Arc::clone(&gate);
        let q = Arc::clone(&quiesced);
        let quiescer = thread::spawn(move || {
            let _guard = g.quiesce().unwrap();
            q.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!quiesced.load(Ordering::SeqCst));
        assert!(gate.is_quiesced());
        release_tx.send(()).unwrap();

        holder.join().unwrap();
        quiescer.join().unwrap();
        assert!(quiesced.load(Ordering::SeqCst));
        assert_eq!(gate.inhibitors(), 0);
        assert!(!gate.is_quiesced());
    }

    #[test]
    fn test_new_inhibitor_waits_for_quiesce_guard() {
        let gate = Arc::new(CheckpointGate::new());
        let entered = Arc::new(AtomicBool::new(false));
        let guard = gate.quiesce().unwrap();

        let g = Arc::clone(&gate);
        let e = Arc::clone(&entered);
        let worker = thread::spawn(move || {
            let _i = g.inhibit();
            e.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        worker.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_depth_is_per_gate() {
        let a = CheckpointGate::new();
        let b = CheckpointGate::new();
        let _ga = a.inhibit();
        // Inhibiting `a` does not make this thread an inhibitor of `b`.
        let q = b.quiesce().unwrap();
        drop(q);
    }
}
