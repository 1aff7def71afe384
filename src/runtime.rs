//! Process-wide split-process runtime
//!
//! Owns the checkpoint gate, the proxy context (partition, library and
//! thread slot, all behind the crossing lock), the handle table, the call
//! log and the replay registry.
//!
//! Interception layer: `inhibit`, `resolve`, `enter_proxy`, `adopt`,
//! `record`, `release`. Restore driver: `quiesce`, `reinitialize_proxy`,
//! `replay`, `checkpoint`, `restore`.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::error::{Result, SplitError};
use crate::handles::{Category, HandleTable, RealHandle, Released, VirtualHandle};
use crate::images::{self, ImageDir};
use crate::inhibit::{CheckpointGate, InhibitGuard, QuiesceGuard};
use crate::library::{CallResult, CommLibrary};
use crate::options::Options;
use crate::partition::{Partition, TlsLayout};
use crate::record::{self, Arg, CallLog, ReplayArgs, ReplayFn, ReplayRegistry, ReplayStats};
use crate::switch::{ContextSwitch, Crossing, CrossingLock, CrossingLockGuard, CrossingProbe};
use crate::switch::{MemorySlot, ThreadSlot};

/// Static TLS bytes for a memory-backed slot when none are configured.
pub const DEFAULT_MEMORY_TLS: usize = 256;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Make `rt` the process-wide runtime. Its options become the global
/// ones unless those were set first.
pub fn install(rt: Runtime) -> Result<&'static Runtime> {
    let opts = rt.opts.clone();
    RUNTIME
        .set(rt)
        .map_err(|_| SplitError::Partition("runtime already installed".into()))?;
    if crate::options::opts_init(opts).is_err() {
        log::debug!("Global options were initialized before the runtime");
    }
    get().ok_or_else(|| SplitError::Partition("runtime vanished after install".into()))
}

pub fn get() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// Everything only touched while holding the crossing lock.
pub struct ProxyState {
    partition: Partition,
    library: Box<dyn CommLibrary>,
    slot: Box<dyn ThreadSlot>,
}

pub struct Runtime {
    opts: Options,
    gate: CheckpointGate,
    proxy: CrossingLock<ProxyState>,
    switch: ContextSwitch,
    table: HandleTable,
    log: Mutex<CallLog>,
    registry: ReplayRegistry,
}

impl Runtime {
    /// Split the process around `slot` and bring up `library` in the
    /// proxy context.
    pub fn new(
        opts: Options,
        layout: TlsLayout,
        slot: Box<dyn ThreadSlot>,
        library: Box<dyn CommLibrary>,
    ) -> Result<Self> {
        let partition = Partition::split(layout, &*slot, opts.proxy_reserve)?;
        let rt = Self {
            switch: ContextSwitch::new(opts.validate_crossings),
            opts,
            gate: CheckpointGate::new(),
            proxy: CrossingLock::new(ProxyState {
                partition,
                library,
                slot,
            }),
            table: HandleTable::new(),
            log: Mutex::new(CallLog::new()),
            registry: ReplayRegistry::builtin(),
        };
        rt.start_library()?;
        log::info!("Split-process runtime up");
        Ok(rt)
    }

    /// Runtime whose identity window lives in ordinary memory instead of
    /// the hardware thread pointer.
    pub fn in_memory(opts: Options, library: Box<dyn CommLibrary>) -> Result<Self> {
        let layout = TlsLayout::x86_64(opts.tls_bytes.unwrap_or(DEFAULT_MEMORY_TLS));
        let slot = MemorySlot::new(layout);
        Self::new(opts, layout, Box::new(slot), library)
    }

    /// Runtime crossing on the calling threads' real thread pointer.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub fn on_hardware(opts: Options, library: Box<dyn CommLibrary>) -> Result<Self> {
        let layout = TlsLayout::probe(opts.tls_bytes)?;
        Self::new(opts, layout, Box::new(crate::switch::HardwareSlot), library)
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    pub fn log(&self) -> MutexGuard<'_, CallLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn probe(&self) -> &CrossingProbe {
        self.switch.probe()
    }

    /// Add or replace a replay function. Only possible before `install`.
    pub fn register_replay(&mut self, op: &str, f: ReplayFn) {
        self.registry.register(op, f);
    }

    /// Proxy generation: bumped on every reinitialization.
    pub fn generation(&self) -> u64 {
        self.proxy.lock().partition.proxy().generation
    }

    /// Init the library inside a crossing and bind the predefined handles.
    fn start_library(&self) -> Result<()> {
        let mut proxy = self.proxy.lock();
        let state = &mut *proxy;
        let status = {
            let mut target = CrossingTarget {
                switch: &self.switch,
                state,
            };
            target.with_library(|lib| lib.init())?
        };
        status.map_err(|s| {
            log::error!("Library initialization failed: {}", s);
            SplitError::Call(s)
        })?;
        let lib = &proxy.library;
        self.table.bind_predefined(|p| lib.predefined(p));
        log::debug!(
            "Library up in proxy generation {} (world rank {})",
            proxy.partition.proxy().generation,
            lib.world_rank()
        );
        Ok(())
    }

    // Interception layer

    pub fn inhibit(&self) -> InhibitGuard<'_> {
        self.gate.inhibit()
    }

    /// Calls currently holding off checkpoints, across all threads.
    pub fn inhibitors(&self) -> u32 {
        self.gate.inhibitors()
    }

    pub fn resolve(&self, handle: VirtualHandle) -> Result<RealHandle> {
        self.table.resolve(handle).map_err(|e| {
            log::warn!("Cannot resolve {}: {}", handle, e);
            e
        })
    }

    pub fn resolve_as(&self, handle: VirtualHandle, category: Category) -> Result<RealHandle> {
        self.table.resolve_as(handle, category).map_err(|e| {
            log::warn!("Cannot resolve {}: {}", handle, e);
            e
        })
    }

    /// Cross into the proxy context. The guard dereferences to the library
    /// and crosses back when dropped.
    pub fn enter_proxy(&self) -> Result<ProxyGuard<'_>> {
        if self.switch.in_proxy() {
            return Err(SplitError::Crossing(
                "nested entry into the proxy context".into(),
            ));
        }
        let state = self.proxy.lock();
        // SAFETY: crossings are serialized by the crossing lock held in
        // `state`, and the partition describes the slot's window.
        let crossing = unsafe {
            self.switch
                .enter(&*state.slot, state.partition.proxy(), state.partition.layout())?
        };
        Ok(ProxyGuard {
            crossing: Some(crossing),
            state,
        })
    }

    /// Give a real handle produced by a call its virtual handle. Real
    /// handles of predefined objects map to their fixed virtual handles.
    pub fn adopt(&self, category: Category, real: RealHandle) -> Result<VirtualHandle> {
        if let Some(p) = self.table.predefined_for_real(real) {
            if p.category() == category {
                return Ok(p.handle());
            }
        }
        let handle = self.table.allocate(category)?;
        self.table.bind(handle, real)?;
        log::debug!("Adopted {} as {}", real, handle);
        Ok(handle)
    }

    pub fn record(
        &self,
        category: Category,
        op: &str,
        args: Vec<Arg>,
        output: Option<VirtualHandle>,
    ) -> u64 {
        self.log().record(category, op, args, output)
    }

    /// Log a call every process of the job made together.
    pub fn record_collective(
        &self,
        category: Category,
        op: &str,
        args: Vec<Arg>,
        output: Option<VirtualHandle>,
    ) -> u64 {
        self.log().record_collective(category, op, args, output)
    }

    /// Release a handle after the library freed its object.
    pub fn release(&self, handle: VirtualHandle) -> Result<Released> {
        let released = self.table.release(handle)?;
        if released == Released::Removed {
            self.log().clear_handle(handle);
        }
        log::debug!("Released {} ({:?})", handle, released);
        Ok(released)
    }

    // Restore driver

    pub fn quiesce(&self) -> Result<QuiesceGuard<'_>> {
        self.gate.quiesce()
    }

    fn check_guard(&self, guard: &QuiesceGuard<'_>) -> Result<()> {
        if guard.guards(&self.gate) {
            Ok(())
        } else {
            Err(SplitError::Crossing(
                "quiesce guard belongs to another runtime".into(),
            ))
        }
    }

    /// Throw away the proxy context and bring up a fresh library instance
    /// in a rebuilt one. Every real handle becomes invalid until `replay`.
    pub fn reinitialize_proxy(&self, guard: &QuiesceGuard<'_>) -> Result<()> {
        self.check_guard(guard)?;
        let mut proxy = self.proxy.lock();
        let state = &mut *proxy;

        self.table.invalidate_reals();
        let finalized = CrossingTarget {
            switch: &self.switch,
            state: &mut *state,
        }
        .with_library(|lib| lib.finalize());
        match finalized {
            Ok(Ok(())) => {}
            Ok(Err(status)) => log::debug!("Previous library instance did not finalize: {}", status),
            Err(e) => log::warn!("Cannot reach the previous library instance: {}", e),
        }
        state.partition.rebuild_proxy(&*state.slot).map_err(|e| {
            log::error!("Cannot rebuild the proxy region: {}", e);
            e
        })?;
        drop(proxy);

        self.start_library()?;
        log::info!("Proxy reinitialized (generation {})", self.generation());
        Ok(())
    }

    /// Replay the call log against the current library instance.
    pub fn replay(&self, guard: &QuiesceGuard<'_>) -> Result<ReplayStats> {
        self.check_guard(guard)?;
        let mut proxy = self.proxy.lock();
        let log = self.log();
        let mut target = CrossingTarget {
            switch: &self.switch,
            state: &mut *proxy,
        };
        record::replay(&log, &self.table, &mut target, &self.registry)
    }

    /// Write the virtual handle table and the call log to `dir`.
    pub fn checkpoint(&self, dir: impl AsRef<Path>) -> Result<()> {
        let _quiesced = self.quiesce()?;
        let image = {
            let mut log = self.log();
            if self.opts.sweep_on_checkpoint {
                log.sweep(&self.table);
            }
            images::to_image(&self.table, &log)
        };
        ImageDir::create(dir.as_ref())?.write_state(&image)?;
        log::info!(
            "Checkpointed {} handles and {} records to {}",
            image.handles.len(),
            image.records.len(),
            dir.as_ref().display()
        );
        Ok(())
    }

    /// Load the state in `dir`, rebuild the proxy and replay. Application
    /// threads stay out until the replay has finished.
    pub fn restore(&self, dir: impl AsRef<Path>) -> Result<ReplayStats> {
        let quiesced = self.quiesce()?;
        let state = ImageDir::open(dir.as_ref())?.read_state()?;
        let (table, log) = images::from_image(&state)?;
        self.table.replace(table);
        *self.log() = log;

        self.reinitialize_proxy(&quiesced)?;
        let stats = self.replay(&quiesced).map_err(|e| {
            log::error!("Restore from {} failed: {}", dir.as_ref().display(), e);
            e
        })?;
        log::info!("Restored from {}", dir.as_ref().display());
        Ok(stats)
    }

    /// Put the managed identity back from a signal handler that
    /// interrupted a crossing on this thread. Async-signal-safe.
    pub fn emergency_leave(&self) -> bool {
        self.switch.emergency_leave()
    }
}

/// Active crossing plus the crossing lock. Fields drop in order, so the
/// crossing is left before the lock is released.
pub struct ProxyGuard<'a> {
    crossing: Option<Crossing<'a>>,
    state: CrossingLockGuard<'a, ProxyState>,
}

impl ProxyGuard<'_> {
    /// Leave the proxy context, reporting validation failures.
    pub fn leave(mut self) -> Result<()> {
        match self.crossing.take() {
            Some(c) => c.leave(),
            None => Ok(()),
        }
    }
}

impl Deref for ProxyGuard<'_> {
    type Target = dyn CommLibrary;

    fn deref(&self) -> &Self::Target {
        &*self.state.library
    }
}

impl DerefMut for ProxyGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.state.library
    }
}

/// Runs every call in its own crossing, so nothing between calls executes
/// with the proxy identity installed.
struct CrossingTarget<'a> {
    switch: &'a ContextSwitch,
    state: &'a mut ProxyState,
}

impl CrossingTarget<'_> {
    fn with_library<R>(&mut self, f: impl FnOnce(&mut dyn CommLibrary) -> R) -> Result<R> {
        let state = &mut *self.state;
        // SAFETY: the caller holds the crossing lock that owns `state`.
        let crossing = unsafe {
            self.switch
                .enter(&*state.slot, state.partition.proxy(), state.partition.layout())?
        };
        let result = f(&mut *state.library);
        crossing.leave()?;
        Ok(result)
    }
}

impl record::ReplayTarget for CrossingTarget<'_> {
    fn call(
        &mut self,
        f: ReplayFn,
        args: &ReplayArgs<'_>,
    ) -> Result<CallResult<Option<RealHandle>>> {
        self.with_library(|lib| f(lib, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::Predefined;
    use crate::loopback::Loopback;

    fn runtime(world: i32, rank: i32) -> Runtime {
        let opts = Options {
            proxy_reserve: 1 << 20,
            validate_crossings: true,
            ..Options::default()
        };
        Runtime::in_memory(opts, Box::new(Loopback::new(world, rank))).unwrap()
    }

    #[test]
    fn test_predefined_bound_at_startup() {
        let rt = runtime(4, 0);
        let world = rt.resolve(Predefined::CommWorld.handle()).unwrap();
        let mut lib = rt.enter_proxy().unwrap();
        assert_eq!(lib.comm_size(world), Ok(4));
        lib.leave().unwrap();
        assert_eq!(rt.probe().active(), 0);
    }

    #[test]
    fn test_nested_enter_proxy_rejected() {
        let rt = runtime(2, 0);
        let guard = rt.enter_proxy().unwrap();
        assert!(matches!(rt.enter_proxy(), Err(SplitError::Crossing(_))));
        drop(guard);
        assert!(rt.enter_proxy().is_ok());
    }

    #[test]
    fn test_adopt_maps_predefined_reals() {
        let rt = runtime(4, 3);
        let null_real = rt.resolve(Predefined::CommNull.handle()).unwrap();
        assert_eq!(
            rt.adopt(Category::Comm, null_real).unwrap(),
            Predefined::CommNull.handle()
        );
        let other = rt.adopt(Category::Comm, RealHandle(12345)).unwrap();
        assert!(!HandleTable::is_predefined(other));
        assert_eq!(rt.resolve(other).unwrap(), RealHandle(12345));
    }

    #[test]
    fn test_release_clears_records_of_removable_categories() {
        let rt = runtime(2, 0);
        let req = rt.adopt(Category::Request, RealHandle(7)).unwrap();
        rt.record(
            Category::Request,
            "ibarrier",
            vec![Arg::Handle(Predefined::CommWorld.handle())],
            Some(req),
        );
        assert_eq!(rt.release(req).unwrap(), Released::Removed);
        assert!(rt.log().is_empty());

        let g = rt.adopt(Category::Group, RealHandle(8)).unwrap();
        rt.record(
            Category::Group,
            "comm_group",
            vec![Arg::Handle(Predefined::CommWorld.handle())],
            Some(g),
        );
        assert_eq!(rt.release(g).unwrap(), Released::Tombstoned);
        assert_eq!(rt.log().len(), 1);
    }

    #[test]
    fn test_reinitialize_invalidates_reals() {
        let rt = runtime(2, 0);
        let before = rt.resolve(Predefined::CommWorld.handle()).unwrap();
        let g = rt.adopt(Category::Group, RealHandle(99)).unwrap();
        let generation = rt.generation();

        let q = rt.quiesce().unwrap();
        rt.reinitialize_proxy(&q).unwrap();
        drop(q);

        assert_eq!(rt.generation(), generation + 1);
        let after = rt.resolve(Predefined::CommWorld.handle()).unwrap();
        assert_ne!(before, after);
        assert!(matches!(rt.resolve(g), Err(SplitError::Unbound(_))));
    }

    /// An application-level call the builtin registry does not know.
    fn self_group(rt: &Runtime) -> VirtualHandle {
        let comm = rt.resolve(Predefined::CommSelf.handle()).unwrap();
        let mut lib = rt.enter_proxy().unwrap();
        let real = lib.comm_group(comm).unwrap();
        lib.leave().unwrap();
        let handle = rt.adopt(Category::Group, real).unwrap();
        rt.record(Category::Group, "self_group", vec![], Some(handle));
        handle
    }

    #[test]
    fn test_registered_replay_rebuilds_custom_op() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(3, 1);
        let g = self_group(&rt);
        rt.checkpoint(dir.path()).unwrap();

        let mut restored = runtime(3, 1);
        restored.register_replay("self_group", |lib, _| {
            let comm = lib.predefined(Predefined::CommSelf);
            lib.comm_group(comm).map(Some)
        });
        let stats = restored.restore(dir.path()).unwrap();
        assert_eq!(stats.records, 1);
        let real = restored.resolve(g).unwrap();
        let mut lib = restored.enter_proxy().unwrap();
        assert_eq!(lib.group_size(real), Ok(1));
        assert_eq!(lib.group_rank(real), Ok(0));
        lib.leave().unwrap();

        let unaware = runtime(3, 1);
        assert!(matches!(
            unaware.restore(dir.path()),
            Err(SplitError::Replay { seq: 1, .. })
        ));
    }

    #[test]
    fn test_foreign_quiesce_guard_rejected() {
        let a = runtime(2, 0);
        let b = runtime(2, 0);
        let q = b.quiesce().unwrap();
        assert!(matches!(a.replay(&q), Err(SplitError::Crossing(_))));
        assert!(a.reinitialize_proxy(&q).is_err());
    }
}
