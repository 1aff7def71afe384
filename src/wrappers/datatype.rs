//! Datatype wrappers

use super::{call, create, destroy, mutate, resolve};
use crate::handles::{Category, VirtualHandle};
use crate::library::CallResult;
use crate::record::Arg;
use crate::runtime::Runtime;

pub fn type_contiguous(rt: &Runtime, count: i32, oldtype: VirtualHandle) -> CallResult<VirtualHandle> {
    let _inhibit = rt.inhibit();
    let old = resolve(rt, oldtype, Category::Datatype)?;
    create(
        rt,
        Category::Datatype,
        "type_contiguous",
        vec![Arg::Int(i64::from(count)), Arg::Handle(oldtype)],
        |lib| lib.type_contiguous(count, old),
    )
}

pub fn type_commit(rt: &Runtime, datatype: VirtualHandle) -> CallResult<()> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, datatype, Category::Datatype)?;
    mutate(
        rt,
        Category::Datatype,
        "type_commit",
        vec![Arg::Handle(datatype)],
        |lib| lib.type_commit(real),
    )
}

pub fn type_size(rt: &Runtime, datatype: VirtualHandle) -> CallResult<i32> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, datatype, Category::Datatype)?;
    call(rt, |lib| lib.type_size(real))
}

pub fn type_free(rt: &Runtime, datatype: VirtualHandle) -> CallResult<()> {
    let _inhibit = rt.inhibit();
    destroy(rt, Category::Datatype, "type_free", datatype, |lib, t| {
        lib.type_free(t)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::Predefined;
    use crate::library::LibStatus;
    use crate::wrappers::test_util::runtime;

    #[test]
    fn test_contiguous_commit_size() {
        let rt = runtime(2, 0);
        let t = type_contiguous(&rt, 3, Predefined::Double.handle()).unwrap();
        type_commit(&rt, t).unwrap();
        assert_eq!(type_size(&rt, t), Ok(24));
        assert_eq!(rt.log().records(Category::Datatype).len(), 2);
        type_free(&rt, t).unwrap();
        assert_eq!(type_size(&rt, t), Err(LibStatus::ERR_TYPE));
    }

    #[test]
    fn test_negative_count_rejected() {
        let rt = runtime(2, 0);
        assert_eq!(
            type_contiguous(&rt, -2, Predefined::Int.handle()),
            Err(LibStatus::ERR_COUNT)
        );
        assert!(rt.log().is_empty());
    }
}
