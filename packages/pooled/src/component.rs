//! Base definitions for components.
//!
//! Every column in the storage engine holds one component type. Each
//! component type is allocated a process-unique ID; the `component!` macro
//! assigns it lazily on first use.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

/// A component type ID which is unique for a specific component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeID(usize);

static NEXT_TYPE_ID: AtomicUsize = AtomicUsize::new(1);

impl ComponentTypeID {
    /// ID 0 is reserved for the entity ID column.
    pub(crate) const fn new(inner: usize) -> ComponentTypeID {
        ComponentTypeID(inner)
    }

    /// Allocate a new process-unique `ComponentTypeID`.
    pub fn unique() -> ComponentTypeID {
        ComponentTypeID(NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the inner unique ID.
    pub fn id(&self) -> usize {
        self.0
    }
}

/// A struct for lazily assigning unique `ComponentTypeID`s.
pub struct AutoComponentTypeID(OnceCell<ComponentTypeID>);

impl AutoComponentTypeID {
    /// Create a new `AutoComponentTypeID`.
    pub const fn new() -> AutoComponentTypeID {
        AutoComponentTypeID(OnceCell::new())
    }

    /// Get the `ComponentTypeID` this struct wraps.
    pub fn get(&self) -> ComponentTypeID {
        *self.0.get_or_init(ComponentTypeID::unique)
    }
}

/// The component trait is implemented on all component types.
///
/// Components must be at least one machine word wide (dense slots are
/// recycled through the ID machinery) and no wider than a block.
///
/// This trait is unsafe because the storage layer casts column pointers
/// based on `type_id`; returning a non-unique ID lets two different types
/// alias the same column.
pub unsafe trait Component: Debug + Default + Copy + Send + Sync + 'static {
    /// Get the unique type ID of this component.
    fn type_id() -> ComponentTypeID;
}

/// Implement the `Component` trait on a type.
///
/// Component types must implement `Debug`, `Default` and `Copy`.
#[macro_export]
macro_rules! component {
    ($i:ident) => {
        const _: () = {
            static INIT_TYPE: $crate::AutoComponentTypeID = $crate::AutoComponentTypeID::new();

            unsafe impl $crate::Component for $i {
                fn type_id() -> $crate::ComponentTypeID {
                    INIT_TYPE.get()
                }
            }
        };
    };
}
