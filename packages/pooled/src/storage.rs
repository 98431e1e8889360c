//! Heterogeneous archetype-set storage.
//!
//! A `Storage` owns one parallel store per archetype and assigns each a
//! unique ID prefix at construction, so any external ID names its owning
//! store. Queries select the subset of stores whose component sets satisfy
//! the query predicates and concatenate their views.

use std::fmt::{self, Debug};

use crate::archetype::Archetype;
use crate::component::Component;
use crate::entity::EntityID;
use crate::parallel::{AnyStore, ParallelStore};
use crate::query::Query;
use crate::view::{ConcatView, View};

/// The built set of stores backing a [`Storage`].
///
/// Each added archetype gets the next free prefix, so a set built in list
/// order routes IDs by store position.
#[derive(Default)]
pub struct StoreSet {
    stores: Vec<Box<dyn AnyStore>>,
}

impl StoreSet {
    /// Create an empty store set.
    pub fn new() -> StoreSet {
        StoreSet::default()
    }

    /// Add a store for archetype `A` with the next prefix.
    pub fn add<A: Archetype>(&mut self) {
        let prefix = self.stores.len() as u64;
        self.stores.push(Box::new(ParallelStore::<A>::new(prefix)));
    }
}

/// A compile-time list of archetypes, written as a tuple.
pub trait ArchetypeList: 'static {
    fn build() -> StoreSet;
}

macro_rules! archetype_list {
    ($($name:ident),+) => {
        impl<$($name: Archetype),+> ArchetypeList for ($($name,)+) {
            fn build() -> StoreSet {
                let mut set = StoreSet::new();
                $(set.add::<$name>();)+
                set
            }
        }
    };
}

archetype_list!(A);
archetype_list!(A, B);
archetype_list!(A, B, C);
archetype_list!(A, B, C, D);
archetype_list!(A, B, C, D, E);
archetype_list!(A, B, C, D, E, F);
archetype_list!(A, B, C, D, E, F, G);
archetype_list!(A, B, C, D, E, F, G, H);

/// A set of parallel stores, one per archetype.
pub struct Storage {
    stores: Vec<Box<dyn AnyStore>>,
}

impl Storage {
    /// Create storage for the archetypes in `L`, assigning each store the
    /// prefix of its position in the list.
    pub fn new<L: ArchetypeList>() -> Storage {
        Storage::with_stores(L::build())
    }

    /// Create storage from an explicitly built store set.
    pub fn with_stores(set: StoreSet) -> Storage {
        Storage { stores: set.stores }
    }

    /// The number of archetype stores.
    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// Create `count` entities of archetype `A` and return a view over
    /// them.
    ///
    /// # Panics
    /// If `A` is not one of this storage's archetypes.
    pub fn create<A: Archetype>(&self, count: usize) -> View<'_> {
        let mut wanted = A::component_set();
        wanted.insert(EntityID::type_id());

        let store = self
            .stores
            .iter()
            .find(|store| *store.match_set() == wanted)
            .unwrap_or_else(|| panic!("no store for archetype {:?}", wanted));
        store.create(count)
    }

    /// Mark the entity deleted. Unknown and stale IDs are ignored.
    pub fn delete(&self, id: EntityID) {
        if !id.is_valid() {
            return;
        }
        // Prefixes are store positions, so the ID routes itself.
        if let Some(store) = self.stores.get(id.prefix() as usize) {
            store.mark_deleted(id);
        }
    }

    /// Run a query: concatenate views over every store whose archetype
    /// matches.
    pub fn run_query<Q: Query>(&self) -> ConcatView<'_, Q::Select> {
        let views: Vec<View<'_>> = self
            .stores
            .iter()
            .filter(|store| Q::matches(store.match_set()))
            .map(|store| store.view_all())
            .collect();
        ConcatView::new(views)
    }

    /// Run a query scoped to one entity: at most one single-slot view, and
    /// none if the ID is unknown, deleted, or its store does not match.
    pub fn run_query_at<Q: Query>(&self, id: EntityID) -> ConcatView<'_, Q::Select> {
        let mut views = Vec::new();
        if id.is_valid() {
            if let Some(store) = self.stores.get(id.prefix() as usize) {
                if Q::matches(store.match_set()) {
                    views.push(store.view_at(id));
                }
            }
        }
        ConcatView::new(views)
    }
}

impl Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Storage {{")?;
        for (prefix, store) in self.stores.iter().enumerate() {
            writeln!(f, "  #{} - {:?}", prefix, store.match_set().as_slice())?;
        }
        write!(f, "}}")
    }
}
