//! Virtual handles
//!
//! The application only ever sees `VirtualHandle`s. Real handles are
//! issued by the library instance inside the proxy context and are
//! rebound underneath the virtual ones after every restore.

pub mod table;

pub use table::{Binding, BindingState, HandleTable, Released};

use std::fmt;

/// Number of handle categories.
pub const CATEGORY_COUNT: usize = 6;

/// Bits of a virtual handle holding the per-category serial.
pub const SERIAL_BITS: u32 = 28;
pub const SERIAL_MASK: u32 = (1 << SERIAL_BITS) - 1;

/// Object category a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Category {
    Group = 1,
    Comm = 2,
    Datatype = 3,
    Op = 4,
    Window = 5,
    Request = 6,
}

impl Category {
    /// Replay order: every category only depends on categories before it.
    pub const REPLAY_ORDER: [Category; CATEGORY_COUNT] = [
        Category::Group,
        Category::Comm,
        Category::Datatype,
        Category::Op,
        Category::Window,
        Category::Request,
    ];

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Category::Group),
            2 => Some(Category::Comm),
            3 => Some(Category::Datatype),
            4 => Some(Category::Op),
            5 => Some(Category::Window),
            6 => Some(Category::Request),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Dense index, for per-category arrays.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// Whether a released handle must stay in the table as a tombstone.
    ///
    /// Groups, communicators and datatypes can be inputs to the creation
    /// of other objects, so their creation records have to survive the
    /// application freeing them.
    pub fn retains_after_release(self) -> bool {
        matches!(self, Category::Group | Category::Comm | Category::Datatype)
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Group => "group",
            Category::Comm => "comm",
            Category::Datatype => "datatype",
            Category::Op => "op",
            Category::Window => "window",
            Category::Request => "request",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable, application-visible identifier.
///
/// Layout: category tag in the top 4 bits, serial in the low 28 bits.
/// Serial 0 is never issued, so no valid handle encodes to a bare tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualHandle(u32);

impl VirtualHandle {
    pub(crate) fn new(category: Category, serial: u32) -> Self {
        debug_assert!(serial != 0 && serial <= SERIAL_MASK);
        VirtualHandle((category.tag() << SERIAL_BITS) | (serial & SERIAL_MASK))
    }

    /// Reinterpret a raw value handed back by the application.
    pub fn from_raw(raw: u32) -> Self {
        VirtualHandle(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// `None` for values that were never produced by a table.
    pub fn category(self) -> Option<Category> {
        Category::from_tag(self.0 >> SERIAL_BITS)
    }

    pub fn serial(self) -> u32 {
        self.0 & SERIAL_MASK
    }
}

impl fmt::Debug for VirtualHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualHandle({})", self)
    }
}

impl fmt::Display for VirtualHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category() {
            Some(c) => write!(f, "{}#{}", c, self.serial()),
            None => write!(f, "0x{:08x}", self.0),
        }
    }
}

/// Identifier issued by the proxy's library instance.
///
/// Only meaningful until the next restore; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RealHandle(pub u64);

impl fmt::Display for RealHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Objects that exist in every library instance without being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predefined {
    CommWorld,
    CommSelf,
    CommNull,
    GroupEmpty,
    GroupNull,
    DatatypeNull,
    Int,
    Double,
    Byte,
    RequestNull,
}

impl Predefined {
    /// Declaration order fixes the serials, so the same predefined object
    /// gets the same virtual handle in every process.
    pub const ALL: [Predefined; 10] = [
        Predefined::CommWorld,
        Predefined::CommSelf,
        Predefined::CommNull,
        Predefined::GroupEmpty,
        Predefined::GroupNull,
        Predefined::DatatypeNull,
        Predefined::Int,
        Predefined::Double,
        Predefined::Byte,
        Predefined::RequestNull,
    ];

    pub fn category(self) -> Category {
        match self {
            Predefined::CommWorld | Predefined::CommSelf | Predefined::CommNull => Category::Comm,
            Predefined::GroupEmpty | Predefined::GroupNull => Category::Group,
            Predefined::DatatypeNull | Predefined::Int | Predefined::Double | Predefined::Byte => {
                Category::Datatype
            }
            Predefined::RequestNull => Category::Request,
        }
    }

    /// Null objects stand for "no object" and are never bound to anything
    /// the application can operate on.
    pub fn is_null(self) -> bool {
        matches!(
            self,
            Predefined::CommNull
                | Predefined::GroupNull
                | Predefined::DatatypeNull
                | Predefined::RequestNull
        )
    }

    pub fn null_of(category: Category) -> Option<Predefined> {
        match category {
            Category::Comm => Some(Predefined::CommNull),
            Category::Group => Some(Predefined::GroupNull),
            Category::Datatype => Some(Predefined::DatatypeNull),
            Category::Request => Some(Predefined::RequestNull),
            Category::Op | Category::Window => None,
        }
    }

    /// Fixed virtual handle of this predefined object.
    pub fn handle(self) -> VirtualHandle {
        let serial = Predefined::ALL
            .iter()
            .filter(|p| p.category() == self.category())
            .position(|p| *p == self)
            .map(|i| i as u32 + 1)
            .unwrap_or(1);
        VirtualHandle::new(self.category(), serial)
    }

    /// Number of serials reserved for predefined objects in `category`.
    pub fn reserved_in(category: Category) -> u32 {
        Predefined::ALL
            .iter()
            .filter(|p| p.category() == category)
            .count() as u32
    }
}
