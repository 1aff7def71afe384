//! Intercepted entry points
//!
//! Each wrapper holds off checkpoints for its whole duration, translates
//! virtual handles, calls the library inside the proxy context, gives new
//! real handles virtual ones and logs what must be replayed. Translation
//! failures come back as the category's invalid-handle status without
//! crossing; a failed library call is returned verbatim and leaves the
//! table and the log alone.

pub mod comm;
pub mod datatype;
pub mod group;
pub mod request;

use crate::handles::{Category, RealHandle, VirtualHandle};
use crate::library::{CallResult, CommLibrary};
use crate::record::Arg;
use crate::runtime::Runtime;

fn resolve(rt: &Runtime, handle: VirtualHandle, category: Category) -> CallResult<RealHandle> {
    rt.resolve_as(handle, category).map_err(|e| e.status())
}

/// Run `f` in the proxy context.
fn call<R>(rt: &Runtime, f: impl FnOnce(&mut dyn CommLibrary) -> CallResult<R>) -> CallResult<R> {
    let mut lib = rt.enter_proxy().map_err(|e| {
        log::error!("Cannot enter the proxy context: {}", e);
        e.status()
    })?;
    f(&mut *lib)
}

/// Run a creating call, adopt its result and log it.
fn create(
    rt: &Runtime,
    category: Category,
    op: &str,
    args: Vec<Arg>,
    f: impl FnOnce(&mut dyn CommLibrary) -> CallResult<RealHandle>,
) -> CallResult<VirtualHandle> {
    let handle = adopt(rt, category, op, call(rt, f)?)?;
    rt.record(category, op, args, Some(handle));
    Ok(handle)
}

/// `create` for calls all processes make together.
fn create_collective(
    rt: &Runtime,
    category: Category,
    op: &str,
    args: Vec<Arg>,
    f: impl FnOnce(&mut dyn CommLibrary) -> CallResult<RealHandle>,
) -> CallResult<VirtualHandle> {
    let handle = adopt(rt, category, op, call(rt, f)?)?;
    rt.record_collective(category, op, args, Some(handle));
    Ok(handle)
}

fn adopt(
    rt: &Runtime,
    category: Category,
    op: &str,
    real: RealHandle,
) -> CallResult<VirtualHandle> {
    rt.adopt(category, real).map_err(|e| {
        log::error!("Cannot adopt {} from {}: {}", real, op, e);
        e.status()
    })
}

/// Run a mutating call that produces nothing and log it.
fn mutate(
    rt: &Runtime,
    category: Category,
    op: &str,
    args: Vec<Arg>,
    f: impl FnOnce(&mut dyn CommLibrary) -> CallResult<()>,
) -> CallResult<()> {
    call(rt, f)?;
    rt.record(category, op, args, None);
    Ok(())
}

/// Run a freeing call, log it and release the handle.
fn destroy(
    rt: &Runtime,
    category: Category,
    op: &str,
    handle: VirtualHandle,
    f: impl FnOnce(&mut dyn CommLibrary, RealHandle) -> CallResult<()>,
) -> CallResult<()> {
    let real = resolve(rt, handle, category)?;
    mutate(rt, category, op, vec![Arg::Handle(handle)], |lib| f(lib, real))?;
    rt.release(handle).map_err(|e| {
        log::warn!("Releasing {} after {}: {}", handle, op, e);
        e.status()
    })?;
    Ok(())
}
