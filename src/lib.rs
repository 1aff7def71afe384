// Core modules
pub mod error;
pub mod handles;
pub mod images;
pub mod inhibit;
pub mod library;
pub mod lock;
pub mod logging;
pub mod loopback;
pub mod options;
pub mod partition;
pub mod proto;
pub mod record;
pub mod runtime;
pub mod switch;
pub mod wrappers;

pub use error::{ErrorKind, Result, SplitError};
pub use handles::{Category, HandleTable, Predefined, RealHandle, VirtualHandle};
pub use library::{CallResult, CommLibrary, LibStatus};
pub use options::Options;
pub use runtime::Runtime;
