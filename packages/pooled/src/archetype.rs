//! Archetypes are compile-time sets of component types.
//!
//! An archetype is written as a tuple of component types; it names a
//! storage lane and lowers to a sorted [`ComponentSet`] of unique type IDs.
//! All the set predicates queries need are plain operations over those
//! sorted sets, so store selection is a handful of binary searches.

use std::any::Any;

use crate::component::{Component, ComponentTypeID};
use crate::store::PooledStore;

/// A sorted, deduplicated set of component type IDs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentSet(Vec<ComponentTypeID>);

impl ComponentSet {
    /// Create a set from a list of component types, sorting and dropping
    /// duplicates.
    pub fn new(mut ids: Vec<ComponentTypeID>) -> ComponentSet {
        ids.sort();
        ids.dedup();
        ComponentSet(ids)
    }

    /// Return the sorted slice of component types in the set.
    pub fn as_slice(&self) -> &[ComponentTypeID] {
        &self.0
    }

    /// Return the number of entries in this set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set holds no component types.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert a component type into this set.
    pub fn insert(&mut self, id: ComponentTypeID) {
        if let Err(index) = self.0.binary_search(&id) {
            self.0.insert(index, id);
        }
    }

    /// Returns true if this set contains the given component type.
    pub fn includes(&self, id: ComponentTypeID) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// Returns true if this set contains every type in `other`.
    pub fn includes_all(&self, other: &ComponentSet) -> bool {
        other.0.iter().all(|id| self.includes(*id))
    }

    /// Returns true if every type in this set appears in `other`.
    pub fn is_subset_of(&self, other: &ComponentSet) -> bool {
        other.includes_all(self)
    }

    /// Returns true if any type in this set appears in `other`.
    pub fn any_in(&self, other: &ComponentSet) -> bool {
        self.0.iter().any(|id| other.includes(*id))
    }

    /// The set union of this set and `other`.
    pub fn union(&self, other: &ComponentSet) -> ComponentSet {
        let mut merged = self.0.clone();
        merged.extend_from_slice(&other.0);
        ComponentSet::new(merged)
    }

    /// Returns true if any of `criteria` is a subset of this set.
    pub fn meets_any_criterion<'a>(
        &self,
        criteria: impl IntoIterator<Item = &'a ComponentSet>,
    ) -> bool {
        criteria.into_iter().any(|criterion| criterion.is_subset_of(self))
    }
}

/// A compile-time set of component types which identifies a storage lane.
///
/// Implemented for tuples of [`Component`] types. Listing a component
/// twice collapses to a single set entry; column lookup resolves to the
/// first occurrence.
pub trait Archetype: Send + Sync + 'static {
    /// The tuple of column stores backing this archetype.
    type Columns: ColumnSet;

    /// The sorted set of component type IDs in this archetype.
    fn component_set() -> ComponentSet;

    /// Returns true if this archetype contains the component `T`.
    fn contains<T: Component>() -> bool {
        Self::component_set().includes(T::type_id())
    }

    /// Returns true if every component of this archetype appears in `U`.
    fn is_subset_of<U: Archetype>() -> bool {
        Self::component_set().is_subset_of(&U::component_set())
    }

    /// Returns true if any component of this archetype appears in `U`.
    fn any_in<U: Archetype>() -> bool {
        Self::component_set().any_in(&U::component_set())
    }
}

/// Operations over an archetype's tuple of column stores.
pub trait ColumnSet: Send + Sync + 'static {
    fn new() -> Self;

    /// Ensure blocks exist for `[first_index, first_index + count)` in
    /// every column.
    fn reserve(&self, first_index: usize, count: usize);

    /// Return retired blocks in every column to the pool.
    fn reclaim(&self);

    /// Copy one dense slot over another in every column.
    ///
    /// # Safety
    /// No concurrent access to either slot.
    unsafe fn copy_slot(&self, from: usize, to: usize);

    /// Look up a column store by component type.
    fn column(&self, type_id: ComponentTypeID) -> Option<&dyn Any>;
}

/// The empty archetype: a storage lane with only the entity ID column.
impl Archetype for () {
    type Columns = ();

    fn component_set() -> ComponentSet {
        ComponentSet::new(Vec::new())
    }
}

impl ColumnSet for () {
    fn new() -> Self {}

    fn reserve(&self, _first_index: usize, _count: usize) {}

    fn reclaim(&self) {}

    unsafe fn copy_slot(&self, _from: usize, _to: usize) {}

    fn column(&self, _type_id: ComponentTypeID) -> Option<&dyn Any> {
        None
    }
}

macro_rules! archetype_tuple {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: Component),+> Archetype for ($($name,)+) {
            type Columns = ($(PooledStore<$name>,)+);

            fn component_set() -> ComponentSet {
                ComponentSet::new(vec![$($name::type_id()),+])
            }
        }

        impl<$($name: Component),+> ColumnSet for ($(PooledStore<$name>,)+) {
            fn new() -> Self {
                ($(PooledStore::<$name>::new(),)+)
            }

            fn reserve(&self, first_index: usize, count: usize) {
                $(self.$index.reserve(first_index, count);)+
            }

            fn reclaim(&self) {
                $(self.$index.reclaim_blocks();)+
            }

            unsafe fn copy_slot(&self, from: usize, to: usize) {
                $(self.$index.copy_slot(from, to);)+
            }

            fn column(&self, type_id: ComponentTypeID) -> Option<&dyn Any> {
                $(
                    if type_id == $name::type_id() {
                        return Some(&self.$index);
                    }
                )+
                None
            }
        }
    };
}

archetype_tuple!(A: 0);
archetype_tuple!(A: 0, B: 1);
archetype_tuple!(A: 0, B: 1, C: 2);
archetype_tuple!(A: 0, B: 1, C: 2, D: 3);
archetype_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
archetype_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
archetype_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
archetype_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
