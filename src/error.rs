use std::io;
use thiserror::Error;

use crate::handles::{Category, VirtualHandle};
use crate::library::LibStatus;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Image file not found: {path}")]
    ImageNotFound { path: String },

    #[error("Invalid image format: {reason}")]
    InvalidImage { reason: String },

    #[error("Unknown virtual handle {0}")]
    UnknownHandle(VirtualHandle),

    #[error("Virtual handle {0} has been released")]
    ReleasedHandle(VirtualHandle),

    #[error("Virtual handle {0} has no real binding")]
    Unbound(VirtualHandle),

    #[error("Virtual handle {handle} is not a {expected} handle")]
    CategoryMismatch {
        handle: VirtualHandle,
        expected: Category,
    },

    #[error("Virtual handle space exhausted for category {0}")]
    Exhausted(Category),

    #[error("Process split failed: {0}")]
    Partition(String),

    #[error("Context crossing failed: {0}")]
    Crossing(String),

    #[error("Library call failed: {0}")]
    Call(LibStatus),

    #[error("Replay failed at record {seq} ({op}): {reason}")]
    Replay { seq: u64, op: String, reason: String },
}

/// Error taxonomy, independent of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A virtual handle did not resolve; always a caller defect.
    Translation,
    /// Thread-identity layout mismatch or misuse of a crossing.
    Crossing,
    /// Status returned by the real library call.
    Call,
    /// A log record did not reproduce its outcome during restore.
    Replay,
    /// Partition or handle-space resources unavailable.
    Resource,
    /// Reading or writing the persisted state.
    Image,
}

impl SplitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SplitError::UnknownHandle(_)
            | SplitError::ReleasedHandle(_)
            | SplitError::Unbound(_)
            | SplitError::CategoryMismatch { .. } => ErrorKind::Translation,
            SplitError::Crossing(_) => ErrorKind::Crossing,
            SplitError::Call(_) => ErrorKind::Call,
            SplitError::Replay { .. } => ErrorKind::Replay,
            SplitError::Partition(_) | SplitError::Exhausted(_) => ErrorKind::Resource,
            SplitError::Io(_)
            | SplitError::ImageNotFound { .. }
            | SplitError::InvalidImage { .. } => ErrorKind::Image,
        }
    }

    /// Errors after which the process (or the restore attempt) cannot
    /// continue safely.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Crossing | ErrorKind::Replay | ErrorKind::Resource
        )
    }

    /// Status to hand back to the application for this error.
    ///
    /// Translation failures become the library's invalid-handle status for
    /// the handle's category, as if the library itself had rejected it.
    pub fn status(&self) -> LibStatus {
        match self {
            SplitError::Call(status) => *status,
            SplitError::CategoryMismatch { expected, .. } => invalid_handle_status(*expected),
            SplitError::UnknownHandle(h) | SplitError::ReleasedHandle(h) | SplitError::Unbound(h) => {
                h.category()
                    .map(invalid_handle_status)
                    .unwrap_or(LibStatus::ERR_ARG)
            }
            _ => LibStatus::ERR_INTERN,
        }
    }
}

/// The library's "invalid handle" status for a category.
pub fn invalid_handle_status(category: Category) -> LibStatus {
    match category {
        Category::Group => LibStatus::ERR_GROUP,
        Category::Comm => LibStatus::ERR_COMM,
        Category::Datatype => LibStatus::ERR_TYPE,
        Category::Op => LibStatus::ERR_OP,
        Category::Window => LibStatus::ERR_WIN,
        Category::Request => LibStatus::ERR_REQUEST,
    }
}

pub type Result<T> = std::result::Result<T, SplitError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::Predefined;

    #[test]
    fn test_translation_maps_to_invalid_handle_status() {
        let err = SplitError::UnknownHandle(Predefined::GroupEmpty.handle());
        assert_eq!(err.kind(), ErrorKind::Translation);
        assert!(!err.is_fatal());
        assert_eq!(err.status(), LibStatus::ERR_GROUP);

        let err = SplitError::ReleasedHandle(Predefined::CommWorld.handle());
        assert_eq!(err.status(), LibStatus::ERR_COMM);

        let err = SplitError::UnknownHandle(VirtualHandle::from_raw(7));
        assert_eq!(err.status(), LibStatus::ERR_ARG);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SplitError::Crossing("x".into()).is_fatal());
        assert!(SplitError::Exhausted(Category::Group).is_fatal());
        assert!(SplitError::Replay {
            seq: 1,
            op: "group_incl".into(),
            reason: "x".into()
        }
        .is_fatal());
        assert!(!SplitError::Call(LibStatus::ERR_RANK).is_fatal());
        assert_eq!(
            SplitError::Call(LibStatus::ERR_RANK).status(),
            LibStatus::ERR_RANK
        );
    }
}
