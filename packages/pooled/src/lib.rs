//! A concurrent columnar entity storage engine.
//!
//! Entities live in per-archetype stores: parallel columns of components
//! over a shared, fixed-block memory pool. Mutation is RCU-style per
//! block, deletion is a bitset mark, and free slots are compacted whenever
//! a store is provably free of views.

pub use archetype::{Archetype, ColumnSet, ComponentSet};
pub use bitset::AtomicBitset;
pub use component::{AutoComponentTypeID, Component, ComponentTypeID};
pub use entity::EntityID;
pub use parallel::{ParallelStore, MAX_ENTITIES_PER_STORE};
pub use pool::{RawBlock, Slot, BLOCK_SIZE};
pub use query::{Containing, Fetch, Query, Read, Select, Selection, Without, Write};
pub use storage::{ArchetypeList, Storage, StoreSet};
pub use store::{Iter, IterMut, PooledStore, MAX_INDICES_PER_STORE};
pub use view::{ConcatRows, ConcatView, Rows, View};

pub mod archetype;
pub mod bitset;
pub mod component;
mod entity;
pub mod parallel;
pub mod pool;
pub mod query;
pub mod storage;
pub mod store;
pub mod view;
