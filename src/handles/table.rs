//! Virtual-to-real handle table
//!
//! One table per process. Mutations (`allocate`, `bind`, `release`,
//! rebinding after restore) take the write lock; `resolve` only takes the
//! read lock so concurrent translations never block each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Category, Predefined, RealHandle, VirtualHandle, CATEGORY_COUNT, SERIAL_MASK};
use crate::error::{Result, SplitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Live,
    /// Released by the application but kept because its creation record
    /// may still be needed to rebuild other objects.
    Tombstoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub category: Category,
    /// `None` between allocation and bind, and after a restore until the
    /// handle's creation record has been replayed.
    pub real: Option<RealHandle>,
    pub state: BindingState,
}

/// What `release` did with a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Removed,
    Tombstoned,
    /// Predefined objects are never released.
    Ignored,
}

struct TableInner {
    bindings: BTreeMap<VirtualHandle, Binding>,
    next_serial: [u32; CATEGORY_COUNT],
    /// Real handles of predefined objects in the current library instance.
    predefined_reals: HashMap<RealHandle, Predefined>,
}

pub struct HandleTable {
    inner: RwLock<TableInner>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Empty table with the predefined handles registered (unbound).
    pub fn new() -> Self {
        let mut next_serial = [1u32; CATEGORY_COUNT];
        for category in Category::REPLAY_ORDER {
            next_serial[category.index()] = Predefined::reserved_in(category) + 1;
        }
        let bindings = Predefined::ALL
            .iter()
            .map(|p| {
                (
                    p.handle(),
                    Binding {
                        category: p.category(),
                        real: None,
                        state: BindingState::Live,
                    },
                )
            })
            .collect();

        Self {
            inner: RwLock::new(TableInner {
                bindings,
                next_serial,
                predefined_reals: HashMap::new(),
            }),
        }
    }

    /// Rebuild a table from persisted state. Every binding comes back
    /// without a real handle.
    pub fn from_parts(
        entries: impl IntoIterator<Item = (VirtualHandle, BindingState)>,
        next_serial: [u32; CATEGORY_COUNT],
    ) -> Result<Self> {
        let table = Self::new();
        {
            let mut inner = table.write();
            for (handle, state) in entries {
                let category = handle.category().ok_or_else(|| SplitError::InvalidImage {
                    reason: format!("handle {} has no category", handle),
                })?;
                inner.bindings.insert(
                    handle,
                    Binding {
                        category,
                        real: None,
                        state,
                    },
                );
            }
            for category in Category::REPLAY_ORDER {
                let i = category.index();
                inner.next_serial[i] = inner.next_serial[i].max(next_serial[i]);
            }
        }
        Ok(table)
    }

    /// Take over the contents of `other`, e.g. a table loaded from an image.
    pub fn replace(&self, other: HandleTable) {
        let inner = other.inner.into_inner().unwrap_or_else(|e| e.into_inner());
        *self.write() = inner;
    }

    fn read(&self) -> RwLockReadGuard<'_, TableInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a fresh virtual handle. Serials are never reused.
    pub fn allocate(&self, category: Category) -> Result<VirtualHandle> {
        let mut inner = self.write();
        let serial = inner.next_serial[category.index()];
        if serial > SERIAL_MASK {
            log::error!("Virtual handle space for {} exhausted", category);
            return Err(SplitError::Exhausted(category));
        }
        inner.next_serial[category.index()] = serial + 1;

        let handle = VirtualHandle::new(category, serial);
        inner.bindings.insert(
            handle,
            Binding {
                category,
                real: None,
                state: BindingState::Live,
            },
        );
        Ok(handle)
    }

    /// Insert or overwrite the real side of a binding.
    pub fn bind(&self, handle: VirtualHandle, real: RealHandle) -> Result<()> {
        let category = handle
            .category()
            .ok_or(SplitError::UnknownHandle(handle))?;
        let mut inner = self.write();
        inner
            .bindings
            .entry(handle)
            .and_modify(|b| b.real = Some(real))
            .or_insert(Binding {
                category,
                real: Some(real),
                state: BindingState::Live,
            });
        Ok(())
    }

    pub fn resolve(&self, handle: VirtualHandle) -> Result<RealHandle> {
        let inner = self.read();
        let binding = inner
            .bindings
            .get(&handle)
            .ok_or(SplitError::UnknownHandle(handle))?;
        if binding.state == BindingState::Tombstoned {
            return Err(SplitError::ReleasedHandle(handle));
        }
        binding.real.ok_or(SplitError::Unbound(handle))
    }

    /// `resolve`, additionally checking the handle's category.
    pub fn resolve_as(&self, handle: VirtualHandle, expected: Category) -> Result<RealHandle> {
        if handle.category() != Some(expected) {
            return Err(SplitError::CategoryMismatch { handle, expected });
        }
        self.resolve(handle)
    }

    /// Drop or tombstone a binding according to its category's policy.
    pub fn release(&self, handle: VirtualHandle) -> Result<Released> {
        if Predefined::ALL.iter().any(|p| p.handle() == handle) {
            log::warn!("Ignoring release of predefined handle {}", handle);
            return Ok(Released::Ignored);
        }

        let mut inner = self.write();
        let binding = inner
            .bindings
            .get_mut(&handle)
            .ok_or(SplitError::UnknownHandle(handle))?;
        if binding.state == BindingState::Tombstoned {
            return Err(SplitError::ReleasedHandle(handle));
        }

        if binding.category.retains_after_release() {
            binding.state = BindingState::Tombstoned;
            Ok(Released::Tombstoned)
        } else {
            inner.bindings.remove(&handle);
            Ok(Released::Removed)
        }
    }

    /// Remove tombstoned bindings outright. Live bindings are left alone.
    pub fn purge<'a>(&self, handles: impl IntoIterator<Item = &'a VirtualHandle>) -> usize {
        let mut inner = self.write();
        let mut purged = 0;
        for handle in handles {
            if let Some(b) = inner.bindings.get(handle) {
                if b.state == BindingState::Tombstoned {
                    inner.bindings.remove(handle);
                    purged += 1;
                }
            }
        }
        purged
    }

    pub fn binding(&self, handle: VirtualHandle) -> Option<Binding> {
        self.read().bindings.get(&handle).copied()
    }

    pub fn is_predefined(handle: VirtualHandle) -> bool {
        Predefined::ALL.iter().any(|p| p.handle() == handle)
    }

    /// Virtual handle for a real handle that names a predefined object of
    /// the current library instance.
    pub fn predefined_for_real(&self, real: RealHandle) -> Option<Predefined> {
        self.read().predefined_reals.get(&real).copied()
    }

    /// Point every predefined handle at the given instance's objects.
    pub fn bind_predefined(&self, real_of: impl Fn(Predefined) -> RealHandle) {
        let mut inner = self.write();
        inner.predefined_reals.clear();
        for p in Predefined::ALL {
            let real = real_of(p);
            inner.predefined_reals.insert(real, p);
            if let Some(b) = inner.bindings.get_mut(&p.handle()) {
                b.real = Some(real);
            }
        }
    }

    /// Forget every real handle. Used when the proxy is torn down; the
    /// bindings become resolvable again once replay rebinds them.
    pub fn invalidate_reals(&self) {
        let mut inner = self.write();
        inner.predefined_reals.clear();
        for binding in inner.bindings.values_mut() {
            binding.real = None;
        }
    }

    /// Snapshot of all bindings, in handle order.
    pub fn entries(&self) -> Vec<(VirtualHandle, Binding)> {
        self.read()
            .bindings
            .iter()
            .map(|(h, b)| (*h, *b))
            .collect()
    }

    pub fn next_serials(&self) -> [u32; CATEGORY_COUNT] {
        self.read().next_serial
    }

    pub fn len(&self) -> usize {
        self.read().bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_unique_and_skips_predefined() {
        let table = HandleTable::new();
        let a = table.allocate(Category::Comm).unwrap();
        let b = table.allocate(Category::Comm).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.category(), Some(Category::Comm));
        assert!(a.serial() > Predefined::reserved_in(Category::Comm));
        assert!(!HandleTable::is_predefined(a));
    }

    #[test]
    fn test_bind_resolve_rebind() {
        let table = HandleTable::new();
        let g = table.allocate(Category::Group).unwrap();
        assert!(matches!(table.resolve(g), Err(SplitError::Unbound(_))));

        table.bind(g, RealHandle(10)).unwrap();
        assert_eq!(table.resolve(g).unwrap(), RealHandle(10));

        table.bind(g, RealHandle(20)).unwrap();
        assert_eq!(table.resolve(g).unwrap(), RealHandle(20));
    }

    #[test]
    fn test_resolve_unknown_and_mismatch() {
        let table = HandleTable::new();
        let bogus = VirtualHandle::new(Category::Group, 999);
        assert!(matches!(
            table.resolve(bogus),
            Err(SplitError::UnknownHandle(h)) if h == bogus
        ));

        let c = table.allocate(Category::Comm).unwrap();
        table.bind(c, RealHandle(1)).unwrap();
        assert!(matches!(
            table.resolve_as(c, Category::Group),
            Err(SplitError::CategoryMismatch { .. })
        ));
        assert_eq!(table.resolve_as(c, Category::Comm).unwrap(), RealHandle(1));
    }

    #[test]
    fn test_release_policy() {
        let table = HandleTable::new();
        let g = table.allocate(Category::Group).unwrap();
        let r = table.allocate(Category::Request).unwrap();
        table.bind(g, RealHandle(1)).unwrap();
        table.bind(r, RealHandle(2)).unwrap();

        assert_eq!(table.release(g).unwrap(), Released::Tombstoned);
        assert!(matches!(table.resolve(g), Err(SplitError::ReleasedHandle(_))));
        assert_eq!(table.binding(g).unwrap().state, BindingState::Tombstoned);
        assert!(matches!(table.release(g), Err(SplitError::ReleasedHandle(_))));

        assert_eq!(table.release(r).unwrap(), Released::Removed);
        assert!(table.binding(r).is_none());
        assert!(matches!(table.resolve(r), Err(SplitError::UnknownHandle(_))));
    }

    #[test]
    fn test_rebinding_keeps_tombstone() {
        let table = HandleTable::new();
        let g = table.allocate(Category::Group).unwrap();
        table.bind(g, RealHandle(1)).unwrap();
        table.release(g).unwrap();
        table.bind(g, RealHandle(2)).unwrap();
        assert_eq!(table.binding(g).unwrap().state, BindingState::Tombstoned);
        assert_eq!(table.binding(g).unwrap().real, Some(RealHandle(2)));
    }

    #[test]
    fn test_purge_only_tombstones() {
        let table = HandleTable::new();
        let g1 = table.allocate(Category::Group).unwrap();
        let g2 = table.allocate(Category::Group).unwrap();
        table.release(g1).unwrap();
        assert_eq!(table.purge(&[g1, g2]), 1);
        assert!(table.binding(g1).is_none());
        assert!(table.binding(g2).is_some());
    }

    #[test]
    fn test_predefined_binding_and_invalidation() {
        let table = HandleTable::new();
        let world = Predefined::CommWorld.handle();
        assert!(matches!(table.resolve(world), Err(SplitError::Unbound(_))));

        table.bind_predefined(|p| RealHandle(0x100 + p as u64));
        assert_eq!(table.resolve(world).unwrap(), RealHandle(0x100));
        assert_eq!(
            table.predefined_for_real(RealHandle(0x100)),
            Some(Predefined::CommWorld)
        );
        assert_eq!(table.release(world).unwrap(), Released::Ignored);

        table.invalidate_reals();
        assert!(matches!(table.resolve(world), Err(SplitError::Unbound(_))));
        assert_eq!(table.predefined_for_real(RealHandle(0x100)), None);
    }

    #[test]
    fn test_from_parts_keeps_serials_monotonic() {
        let table = HandleTable::new();
        let g = table.allocate(Category::Group).unwrap();
        table.release(g).unwrap();
        let entries: Vec<_> = table
            .entries()
            .into_iter()
            .map(|(h, b)| (h, b.state))
            .collect();

        let restored = HandleTable::from_parts(entries, table.next_serials()).unwrap();
        assert_eq!(restored.binding(g).unwrap().state, BindingState::Tombstoned);
        let fresh = restored.allocate(Category::Group).unwrap();
        assert!(fresh.serial() > g.serial());
    }

    #[test]
    fn test_exhaustion() {
        let mut serials = [1u32; CATEGORY_COUNT];
        serials[Category::Op.index()] = SERIAL_MASK + 1;
        let table = HandleTable::from_parts(Vec::new(), serials).unwrap();
        assert!(matches!(
            table.allocate(Category::Op),
            Err(SplitError::Exhausted(Category::Op))
        ));
    }
}
