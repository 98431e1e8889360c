//! Typed column selections and store-selection predicates.
//!
//! A [`Selection`] is a tuple of [`Read`]/[`Write`] fetches naming the
//! columns an iterator dereferences. A [`Query`] wraps a selection with
//! store-selection predicates; stores whose archetype fails the predicates
//! contribute nothing to the query's concatenated view.

use std::any::Any;
use std::marker::PhantomData;

use crate::archetype::{Archetype, ComponentSet};
use crate::component::{Component, ComponentTypeID};
use crate::store::{Iter, IterMut, PooledStore};

/// A single column selection: shared ([`Read`]) or exclusive ([`Write`]).
pub trait Fetch: 'static {
    type Component: Component;
    type Iter<'a>;
    type Item<'b>;

    /// True if this fetch goes through the RCU write path.
    const WRITES: bool;

    fn make<'a>(store: &'a PooledStore<Self::Component>, index: usize) -> Self::Iter<'a>;
    fn advance(iter: &mut Self::Iter<'_>, offset: usize);
    fn item<'a, 'b>(iter: &'b mut Self::Iter<'a>) -> Self::Item<'b>;
}

/// Select a column for shared access.
pub struct Read<T>(PhantomData<T>);

/// Select a column for exclusive access through the RCU write path.
pub struct Write<T>(PhantomData<T>);

impl<T: Component> Fetch for Read<T> {
    type Component = T;
    type Iter<'a> = Iter<'a, T>;
    type Item<'b> = &'b T;

    const WRITES: bool = false;

    fn make<'a>(store: &'a PooledStore<T>, index: usize) -> Iter<'a, T> {
        store.get_const(index)
    }

    fn advance(iter: &mut Iter<'_, T>, offset: usize) {
        iter.advance(offset);
    }

    fn item<'a, 'b>(iter: &'b mut Iter<'a, T>) -> &'b T {
        iter.get()
    }
}

impl<T: Component> Fetch for Write<T> {
    type Component = T;
    type Iter<'a> = IterMut<'a, T>;
    type Item<'b> = &'b mut T;

    const WRITES: bool = true;

    fn make<'a>(store: &'a PooledStore<T>, index: usize) -> IterMut<'a, T> {
        store.get(index)
    }

    fn advance(iter: &mut IterMut<'_, T>, offset: usize) {
        iter.advance(offset);
    }

    fn item<'a, 'b>(iter: &'b mut IterMut<'a, T>) -> &'b mut T {
        iter.get_mut()
    }
}

/// A tuple of fetches dereferenced together by a row iterator.
pub trait Selection: 'static {
    type Iters<'a>;
    type Item<'b>;

    /// The number of fetches in the tuple. A selection naming the same
    /// component twice would take the same block writer lock twice.
    const FETCHES: usize;

    /// The set of component types this selection touches.
    fn component_set() -> ComponentSet;

    /// Build per-column iterators positioned at `index`; `None` if any
    /// column is missing from the source.
    fn make<'a>(
        columns: &dyn Fn(ComponentTypeID) -> Option<&'a dyn Any>,
        index: usize,
    ) -> Option<Self::Iters<'a>>;

    /// Advance every column iterator by `offset`.
    fn advance(iters: &mut Self::Iters<'_>, offset: usize);

    /// Dereference every column iterator.
    fn item<'a, 'b>(iters: &'b mut Self::Iters<'a>) -> Self::Item<'b>;
}

macro_rules! selection_tuple {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: Fetch),+> Selection for ($($name,)+) {
            type Iters<'a> = ($(<$name as Fetch>::Iter<'a>,)+);
            type Item<'b> = ($(<$name as Fetch>::Item<'b>,)+);

            const FETCHES: usize = [$(stringify!($name)),+].len();

            fn component_set() -> ComponentSet {
                ComponentSet::new(vec![$(<<$name as Fetch>::Component as Component>::type_id()),+])
            }

            fn make<'a>(
                columns: &dyn Fn(ComponentTypeID) -> Option<&'a dyn Any>,
                index: usize,
            ) -> Option<Self::Iters<'a>> {
                Some(($(
                    <$name as Fetch>::make(
                        columns(<<$name as Fetch>::Component as Component>::type_id())?
                            .downcast_ref::<PooledStore<<$name as Fetch>::Component>>()?,
                        index,
                    ),
                )+))
            }

            fn advance(iters: &mut Self::Iters<'_>, offset: usize) {
                $(<$name as Fetch>::advance(&mut iters.$index, offset);)+
            }

            fn item<'a, 'b>(iters: &'b mut Self::Iters<'a>) -> Self::Item<'b> {
                ($(<$name as Fetch>::item(&mut iters.$index),)+)
            }
        }
    };
}

selection_tuple!(A: 0);
selection_tuple!(A: 0, B: 1);
selection_tuple!(A: 0, B: 1, C: 2);
selection_tuple!(A: 0, B: 1, C: 2, D: 3);

/// A store-selection predicate plus a column selection.
///
/// A store matches when the selection's components are a subset of its
/// archetype, none of the excluded components are present, and (if any
/// criteria were added) at least one criterion archetype is a subset.
pub trait Query: 'static {
    type Select: Selection;

    /// Collect component types which must be absent from a matching
    /// archetype.
    fn excluded(out: &mut Vec<ComponentTypeID>) {
        let _ = out;
    }

    /// Collect contains-all criteria; a store matches if any criterion is
    /// a subset of its archetype. No criteria means no constraint.
    fn criteria(out: &mut Vec<ComponentSet>) {
        let _ = out;
    }

    /// Check a store's component set against this query.
    fn matches(archetype: &ComponentSet) -> bool {
        if !Self::Select::component_set().is_subset_of(archetype) {
            return false;
        }

        let mut excluded = Vec::new();
        Self::excluded(&mut excluded);
        if excluded.iter().any(|id| archetype.includes(*id)) {
            return false;
        }

        let mut criteria = Vec::new();
        Self::criteria(&mut criteria);
        criteria.is_empty() || archetype.meets_any_criterion(criteria.iter())
    }
}

/// A query which selects every store containing the fetched columns.
pub struct Select<S>(PhantomData<S>);

impl<S: Selection> Query for Select<S> {
    type Select = S;
}

/// Exclude stores whose archetype contains `T`.
pub struct Without<Q, T>(PhantomData<(Q, T)>);

impl<Q: Query, T: Component> Query for Without<Q, T> {
    type Select = Q::Select;

    fn excluded(out: &mut Vec<ComponentTypeID>) {
        Q::excluded(out);
        out.push(T::type_id());
    }

    fn criteria(out: &mut Vec<ComponentSet>) {
        Q::criteria(out);
    }
}

/// Restrict to stores whose archetype contains all of `A`'s components.
///
/// Stacking several `Containing` clauses matches stores satisfying any one
/// of them.
pub struct Containing<Q, A>(PhantomData<(Q, A)>);

impl<Q: Query, A: Archetype> Query for Containing<Q, A> {
    type Select = Q::Select;

    fn excluded(out: &mut Vec<ComponentTypeID>) {
        Q::excluded(out);
    }

    fn criteria(out: &mut Vec<ComponentSet>) {
        Q::criteria(out);
        out.push(A::component_set());
    }
}
