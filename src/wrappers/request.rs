//! Request wrappers
//!
//! Requests complete before any checkpoint can start, so a logged
//! `ibarrier` only matters while its request is outstanding. `wait`
//! releases the handle, which drops its record.

use super::{call, create_collective, resolve};
use crate::handles::{Category, Predefined, VirtualHandle};
use crate::library::CallResult;
use crate::record::Arg;
use crate::runtime::Runtime;

pub fn ibarrier(rt: &Runtime, comm: VirtualHandle) -> CallResult<VirtualHandle> {
    let _inhibit = rt.inhibit();
    let real = resolve(rt, comm, Category::Comm)?;
    create_collective(
        rt,
        Category::Request,
        "ibarrier",
        vec![Arg::Handle(comm)],
        |lib| lib.ibarrier(real),
    )
}

pub fn wait(rt: &Runtime, request: VirtualHandle) -> CallResult<()> {
    let _inhibit = rt.inhibit();
    if request == Predefined::RequestNull.handle() {
        return Ok(());
    }
    let real = resolve(rt, request, Category::Request)?;
    call(rt, |lib| lib.wait(real))?;
    rt.release(request).map_err(|e| e.status())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::LibStatus;
    use crate::wrappers::test_util::runtime;

    #[test]
    fn test_wait_releases_request_and_its_record() {
        let rt = runtime(2, 0);
        let req = ibarrier(&rt, Predefined::CommWorld.handle()).unwrap();
        assert_eq!(rt.log().len(), 1);
        wait(&rt, req).unwrap();
        assert!(rt.table().binding(req).is_none());
        assert!(rt.log().is_empty());
        assert_eq!(wait(&rt, req), Err(LibStatus::ERR_REQUEST));
    }

    #[test]
    fn test_wait_on_null_request() {
        let rt = runtime(2, 0);
        assert_eq!(wait(&rt, Predefined::RequestNull.handle()), Ok(()));
    }
}
