//! Group wrappers

use super::{call, create, destroy, resolve};
use crate::handles::{Category, VirtualHandle};
use crate::library::CallResult;
use crate::record::Arg;
use crate::runtime::Runtime;

pub fn comm_group(rt: &Runtime, comm: VirtualHandle) -> CallResult<VirtualHandle> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, comm, Category::Comm)?;
    create(
        rt,
        Category::Group,
        "comm_group",
        vec![Arg::Handle(comm)],
        |lib| lib.comm_group(real),
    )
}

pub fn group_size(rt: &Runtime, group: VirtualHandle) -> CallResult<i32> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, group, Category::Group)?;
    call(rt, |lib| lib.group_size(real))
}

pub fn group_rank(rt: &Runtime, group: VirtualHandle) -> CallResult<i32> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, group, Category::Group)?;
    call(rt, |lib| lib.group_rank(real))
}

pub fn group_compare(rt: &Runtime, group1: VirtualHandle, group2: VirtualHandle) -> CallResult<i32> {
    let _inhibit = rt.inhibit();
    let g1 = resolve(rt, group1, Category::Group)?;
    let g2 = resolve(rt, group2, Category::Group)?;
    call(rt, |lib| lib.group_compare(g1, g2))
}

pub fn group_translate_ranks(
    rt: &Runtime,
    group1: VirtualHandle,
    ranks1: &[i32],
    group2: VirtualHandle,
) -> CallResult<Vec<i32>> {
    let _inhibit = rt.inhibit();
    let g1 = resolve(rt, group1, Category::Group)?;
    let g2 = resolve(rt, group2, Category::Group)?;
    call(rt, |lib| lib.group_translate_ranks(g1, ranks1, g2))
}

pub fn group_incl(rt: &Runtime, group: VirtualHandle, ranks: &[i32]) -> CallResult<VirtualHandle> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, group, Category::Group)?;
    create(
        rt,
        Category::Group,
        "group_incl",
        vec![Arg::Handle(group), Arg::ranks(ranks)],
        |lib| lib.group_incl(real, ranks),
    )
}

pub fn group_free(rt: &Runtime, group: VirtualHandle) -> CallResult<()> {
    let _inhibit = rt.inhibit();
    destroy(rt, Category::Group, "group_free", group, |lib, g| {
        lib.group_free(g)
    })
}
