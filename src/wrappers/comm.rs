//! Communicator wrappers

use super::{call, create_collective, destroy, resolve};
use crate::handles::{Category, VirtualHandle};
use crate::library::CallResult;
use crate::record::Arg;
use crate::runtime::Runtime;

pub fn comm_rank(rt: &Runtime, comm: VirtualHandle) -> CallResult<i32> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, comm, Category::Comm)?;
    call(rt, |lib| lib.comm_rank(real))
}

pub fn comm_size(rt: &Runtime, comm: VirtualHandle) -> CallResult<i32> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, comm, Category::Comm)?;
    call(rt, |lib| lib.comm_size(real))
}

/// Logged even when this process gets COMM_NULL back, so the replay takes
/// part in the collective again.
pub fn comm_create(rt: &Runtime, comm: VirtualHandle, group: VirtualHandle) -> CallResult<VirtualHandle> {
    let _inhibit = rt.inhibit();
    let c = resolve(rt, comm, Category::Comm)?;
    let g = resolve(rt, group, Category::Group)?;
    create_collective(
        rt,
        Category::Comm,
        "comm_create",
        vec![Arg::Handle(comm), Arg::Handle(group)],
        |lib| lib.comm_create(c, g),
    )
}

pub fn comm_dup(rt: &Runtime, comm: VirtualHandle) -> CallResult<VirtualHandle> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, comm, Category::Comm)?;
    create_collective(
        rt,
        Category::Comm,
        "comm_dup",
        vec![Arg::Handle(comm)],
        |lib| lib.comm_dup(real),
    )
}

pub fn comm_free(rt: &Runtime, comm: VirtualHandle) -> CallResult<()> {
    let _inhibit = rt.inhibit();
    destroy(rt, Category::Comm, "comm_free", comm, |lib, c| lib.comm_free(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::Predefined;
    use crate::library::LibStatus;
    use crate::wrappers::group::{comm_group, group_incl};
    use crate::wrappers::test_util::runtime;

    #[test]
    fn test_create_for_non_member_yields_null_and_is_logged() {
        let rt = runtime(4, 3);
        let world = Predefined::CommWorld.handle();
        let g0 = comm_group(&rt, world).unwrap();
        let g1 = group_incl(&rt, g0, &[0, 1]).unwrap();
        let c = comm_create(&rt, world, g1).unwrap();
        assert_eq!(c, Predefined::CommNull.handle());
        let log = rt.log();
        let last = log.records(Category::Comm).last().unwrap();
        assert_eq!(last.op, "comm_create");
        assert_eq!(last.output, Some(Predefined::CommNull.handle()));
        assert!(last.collective);
        assert!(!log.records(Category::Group)[0].collective);
    }

    #[test]
    fn test_dup_rank_size_free() {
        let rt = runtime(3, 1);
        let world = Predefined::CommWorld.handle();
        let dup = comm_dup(&rt, world).unwrap();
        assert_eq!(comm_rank(&rt, dup), Ok(1));
        assert_eq!(comm_size(&rt, dup), Ok(3));
        comm_free(&rt, dup).unwrap();
        assert_eq!(comm_size(&rt, dup), Err(LibStatus::ERR_COMM));
    }

    #[test]
    fn test_free_of_world_fails_without_logging() {
        let rt = runtime(2, 0);
        assert_eq!(
            comm_free(&rt, Predefined::CommWorld.handle()),
            Err(LibStatus::ERR_COMM)
        );
        assert!(rt.log().is_empty());
    }
}
