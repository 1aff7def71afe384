//! The communication library as seen from inside the proxy context
//!
//! Every method here is only ever invoked while a crossing is active.
//! Handles going in and out are real handles of the current library
//! instance.

use std::fmt;

use crate::handles::{Predefined, RealHandle};

/// Library-level status code, propagated to the application verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibStatus(pub i32);

impl LibStatus {
    pub const SUCCESS: LibStatus = LibStatus(0);
    pub const ERR_COUNT: LibStatus = LibStatus(2);
    pub const ERR_TYPE: LibStatus = LibStatus(3);
    pub const ERR_COMM: LibStatus = LibStatus(5);
    pub const ERR_RANK: LibStatus = LibStatus(6);
    pub const ERR_GROUP: LibStatus = LibStatus(8);
    pub const ERR_OP: LibStatus = LibStatus(9);
    pub const ERR_ARG: LibStatus = LibStatus(12);
    pub const ERR_OTHER: LibStatus = LibStatus(15);
    pub const ERR_INTERN: LibStatus = LibStatus(16);
    pub const ERR_REQUEST: LibStatus = LibStatus(19);
    pub const ERR_WIN: LibStatus = LibStatus(45);

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "MPI_SUCCESS",
            2 => "MPI_ERR_COUNT",
            3 => "MPI_ERR_TYPE",
            5 => "MPI_ERR_COMM",
            6 => "MPI_ERR_RANK",
            8 => "MPI_ERR_GROUP",
            9 => "MPI_ERR_OP",
            12 => "MPI_ERR_ARG",
            15 => "MPI_ERR_OTHER",
            16 => "MPI_ERR_INTERN",
            19 => "MPI_ERR_REQUEST",
            45 => "MPI_ERR_WIN",
            _ => "MPI_ERR_UNKNOWN",
        }
    }
}

impl fmt::Display for LibStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Result of a real library call.
pub type CallResult<T> = std::result::Result<T, LibStatus>;

/// Rank value for "not a member".
pub const UNDEFINED: i32 = -32766;

/// Results of `group_compare`.
pub const IDENT: i32 = 0;
pub const SIMILAR: i32 = 2;
pub const UNEQUAL: i32 = 3;

/// Entry points of the library hosted in the proxy context.
pub trait CommLibrary: Send {
    /// Initialize a fresh library instance. Called once after every
    /// proxy (re)initialization, before any other entry point.
    fn init(&mut self) -> CallResult<()>;

    fn finalize(&mut self) -> CallResult<()>;

    /// Real handle of a predefined object in this instance.
    fn predefined(&self, which: Predefined) -> RealHandle;

    /// Rank of this process in the world communicator.
    fn world_rank(&self) -> i32;

    fn comm_group(&mut self, comm: RealHandle) -> CallResult<RealHandle>;
    fn comm_rank(&mut self, comm: RealHandle) -> CallResult<i32>;
    fn comm_size(&mut self, comm: RealHandle) -> CallResult<i32>;
    /// Collective over `comm`; yields the predefined null communicator
    /// on processes outside `group`.
    fn comm_create(&mut self, comm: RealHandle, group: RealHandle) -> CallResult<RealHandle>;
    fn comm_dup(&mut self, comm: RealHandle) -> CallResult<RealHandle>;
    fn comm_free(&mut self, comm: RealHandle) -> CallResult<()>;

    fn group_size(&mut self, group: RealHandle) -> CallResult<i32>;
    fn group_rank(&mut self, group: RealHandle) -> CallResult<i32>;
    fn group_compare(&mut self, group1: RealHandle, group2: RealHandle) -> CallResult<i32>;
    fn group_incl(&mut self, group: RealHandle, ranks: &[i32]) -> CallResult<RealHandle>;
    fn group_translate_ranks(
        &mut self,
        group1: RealHandle,
        ranks1: &[i32],
        group2: RealHandle,
    ) -> CallResult<Vec<i32>>;
    fn group_free(&mut self, group: RealHandle) -> CallResult<()>;

    fn type_contiguous(&mut self, count: i32, oldtype: RealHandle) -> CallResult<RealHandle>;
    fn type_commit(&mut self, datatype: RealHandle) -> CallResult<()>;
    fn type_size(&mut self, datatype: RealHandle) -> CallResult<i32>;
    fn type_free(&mut self, datatype: RealHandle) -> CallResult<()>;

    fn ibarrier(&mut self, comm: RealHandle) -> CallResult<RealHandle>;
    fn wait(&mut self, request: RealHandle) -> CallResult<()>;
}
