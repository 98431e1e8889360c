//! The multi-column parallel store binding one column per component.
//!
//! A `ParallelStore` aggregates an entity ID column, one component column
//! per archetype member, the deletion bitset, and the map from external
//! IDs back to dense indices. Dense slots are handed out by a monotonic
//! cursor; deleted slots are only reclaimed by compaction, which runs when
//! the store is provably free of views.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::archetype::{Archetype, ColumnSet, ComponentSet};
use crate::bitset::AtomicBitset;
use crate::component::{Component, ComponentTypeID};
use crate::entity::{self, EntityID};
use crate::store::{self, PooledStore};
use crate::view::View;

/// The most entities one store can hold: bounded by the ID column's
/// capacity and by the 24-bit slot field of the external ID.
pub const MAX_ENTITIES_PER_STORE: usize = {
    let by_blocks = store::max_len::<EntityID>();
    let by_slots = 1 << entity::SLOT_BITS;
    if by_blocks < by_slots {
        by_blocks
    } else {
        by_slots
    }
};

/// The object interface views and the umbrella storage hold onto a store.
///
/// Erasing the archetype here is what lets views, queries and the storage
/// treat a heterogeneous set of stores uniformly; matching is done over
/// sorted component sets.
pub(crate) trait AnyStore: Send + Sync {
    /// Increment the view refcount under a shared gate acquire.
    fn retain_view(&self);

    /// Decrement the view refcount; the last release runs exclusive
    /// cleanup.
    fn release_view(&self);

    /// Look up a column store by component type. Type ID 0 resolves to the
    /// entity ID column.
    fn column(&self, type_id: ComponentTypeID) -> Option<&dyn Any>;

    /// The entity ID column.
    fn id_column(&self) -> &PooledStore<EntityID>;

    /// The deletion set, indexed by dense slot.
    fn deleted(&self) -> &AtomicBitset;

    /// The component set used for query matching (archetype members plus
    /// the entity ID).
    fn match_set(&self) -> &ComponentSet;

    /// Construct a view over the current dense range.
    fn view_all(&self) -> View<'_>;

    /// Construct a view over a single live entity, empty if the ID does
    /// not resolve.
    fn view_at(&self, id: EntityID) -> View<'_>;

    /// Allocate `count` fresh dense slots and return a view over them.
    fn create(&self, count: usize) -> View<'_>;

    /// Mark an entity deleted; no-op for stale or foreign IDs.
    fn mark_deleted(&self, id: EntityID);
}

/// A parallel set of columns for one archetype.
pub struct ParallelStore<A: Archetype> {
    ids: PooledStore<EntityID>,
    columns: A::Columns,
    deleted: AtomicBitset,
    id_map: PooledStore<AtomicUsize>,
    id_map_len: AtomicUsize,
    count: AtomicUsize,
    prefix: u64,
    match_set: ComponentSet,
    view_refs: AtomicUsize,
    view_gate: RwLock<()>,
}

impl<A: Archetype> ParallelStore<A> {
    /// Create a store whose entities carry the given ID prefix.
    ///
    /// The prefix is baked into every external ID this store stamps, so it
    /// must be unique among the stores of one storage.
    pub fn new(prefix: u64) -> ParallelStore<A> {
        assert!(prefix < (1 << entity::PREFIX_BITS), "prefix out of range");

        let mut match_set = A::component_set();
        match_set.insert(<EntityID as Component>::type_id());

        ParallelStore {
            ids: PooledStore::with_init(move |slot| EntityID::new(prefix, slot)),
            columns: A::Columns::new(),
            deleted: AtomicBitset::with_max_bits(MAX_ENTITIES_PER_STORE),
            // Unmapped entries resolve out of range, so an ID observed
            // before its mapping is stamped is treated as stale.
            id_map: PooledStore::with_init(|_| AtomicUsize::new(usize::MAX)),
            id_map_len: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            prefix,
            match_set,
            view_refs: AtomicUsize::new(0),
            view_gate: RwLock::new(()),
        }
    }

    /// The ID prefix assigned at construction.
    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    /// A snapshot of the number of live entities.
    pub fn len(&self) -> usize {
        self.count
            .load(Ordering::Acquire)
            .saturating_sub(self.deleted.one_count())
    }

    /// Returns true if no live entities remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate `count` fresh dense slots, stamp their IDs, and return a
    /// view over the new range. `emplace(0)` returns an empty view and
    /// grows nothing.
    pub fn emplace(&self, count: usize) -> View<'_> {
        let gate = self.view_gate.read();
        self.view_refs.fetch_add(1, Ordering::AcqRel);

        if count == 0 {
            drop(gate);
            return View::over(self, 0, 0);
        }

        let base = self.count.fetch_add(count, Ordering::AcqRel);
        assert!(
            base + count <= MAX_ENTITIES_PER_STORE,
            "store is out of dense slots"
        );

        self.deleted.grow_bits_to(base + count);
        self.id_map.reserve(base, count);
        self.id_map_len.fetch_max(base + count, Ordering::AcqRel);
        self.ids.reserve(base, count);

        // Map every stamped ID back to its dense slot. Fresh blocks carry
        // identity IDs; after a compaction this range may hold arbitrary
        // recycled IDs, and the map is the single source of truth.
        let mut ids = self.ids.get_const(base);
        for offset in 0..count {
            let id = *ids.get();
            self.id_map
                .entry(id.slot())
                .store(base + offset, Ordering::Release);
            ids.advance(1);
        }

        self.columns.reserve(base, count);

        drop(gate);
        View::over(self, base, base + count)
    }

    /// Mark the entity deleted. Idempotent; unknown, foreign and stale IDs
    /// are ignored.
    pub fn delete(&self, id: EntityID) {
        let _gate = self.view_gate.read();
        if let Some(dense) = self.lookup(id) {
            self.deleted.set(dense, true);
        }
    }

    /// A view over every dense slot currently allocated.
    pub fn get_view(&self) -> View<'_> {
        let gate = self.view_gate.read();
        self.view_refs.fetch_add(1, Ordering::AcqRel);
        let end = self.count.load(Ordering::Acquire);
        drop(gate);
        View::over(self, 0, end)
    }

    /// A view over the single entity `id`, or an empty view if the ID is
    /// unknown or deleted.
    pub fn get_view_at(&self, id: EntityID) -> View<'_> {
        let gate = self.view_gate.read();
        self.view_refs.fetch_add(1, Ordering::AcqRel);
        let range = match self.lookup(id) {
            Some(dense) if !self.deleted.get(dense) => (dense, dense + 1),
            _ => (0, 0),
        };
        drop(gate);
        View::over(self, range.0, range.1)
    }

    /// Resolve an external ID to a live dense index.
    fn lookup(&self, id: EntityID) -> Option<usize> {
        if !id.is_valid() || id.prefix() != self.prefix {
            return None;
        }

        let slot = id.slot();
        if slot >= self.id_map_len.load(Ordering::Acquire) {
            return None;
        }

        let dense = self.id_map.entry(slot).load(Ordering::Acquire);
        if dense < self.count.load(Ordering::Acquire) {
            Some(dense)
        } else {
            None
        }
    }

    /// Compact the dense range, dropping deleted slots and recycling their
    /// IDs.
    ///
    /// Precondition: the caller holds the view gate exclusively and no
    /// views exist, so nothing is iterating or holding block snapshots.
    fn exclusive_cleanup(&self) {
        self.ids.reclaim_blocks();
        self.id_map.reclaim_blocks();
        self.columns.reclaim();

        let count = self.count.load(Ordering::Acquire);
        if count == 0 || self.deleted.one_count() == 0 {
            return;
        }

        let mut right = count - 1;
        let mut removed = 0;

        let mut dead_slots = self.deleted.drain_ones();
        while let Some(dead) = dead_slots.next() {
            if dead >= count {
                break;
            }

            // Skip the dead tail on the right, clearing its bits.
            while right > dead && self.deleted.get(right) {
                self.deleted.set(right, false);
                right -= 1;
                removed += 1;
            }

            if dead >= right {
                // The cursors met on a dead slot; nothing left to move.
                removed += 1;
                break;
            }

            // Move the entity at `right` down into the vacated slot and
            // stamp the dead slot's ID into the slot it vacates. Unused
            // dense slots and unused IDs stay in bijection.
            let dead_id = *self.ids.entry(dead);
            let moved_id = *self.ids.entry(right);
            unsafe {
                self.columns.copy_slot(right, dead);
                self.ids.copy_slot(right, dead);
                self.ids.write_slot(right, dead_id);
            }
            self.id_map
                .entry(moved_id.slot())
                .store(dead, Ordering::Release);
            self.id_map
                .entry(dead_id.slot())
                .store(right, Ordering::Release);

            removed += 1;
            right -= 1;
        }
        drop(dead_slots);

        self.count.store(count - removed, Ordering::Release);
        log::trace!(
            "compacted store {:#x}: {} -> {} dense slots",
            self.prefix,
            count,
            count - removed
        );
    }
}

impl<A: Archetype> AnyStore for ParallelStore<A> {
    fn retain_view(&self) {
        let _gate = self.view_gate.read();
        self.view_refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release_view(&self) {
        if self.view_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _gate = self.view_gate.write();
            // A racing acquirer may have started before the gate closed;
            // only compact if the count is still zero under the exclusive
            // section.
            if self.view_refs.load(Ordering::Acquire) == 0 {
                self.exclusive_cleanup();
            }
        }
    }

    fn column(&self, type_id: ComponentTypeID) -> Option<&dyn Any> {
        if type_id == <EntityID as Component>::type_id() {
            return Some(&self.ids);
        }
        self.columns.column(type_id)
    }

    fn id_column(&self) -> &PooledStore<EntityID> {
        &self.ids
    }

    fn deleted(&self) -> &AtomicBitset {
        &self.deleted
    }

    fn match_set(&self) -> &ComponentSet {
        &self.match_set
    }

    fn view_all(&self) -> View<'_> {
        self.get_view()
    }

    fn view_at(&self, id: EntityID) -> View<'_> {
        self.get_view_at(id)
    }

    fn create(&self, count: usize) -> View<'_> {
        self.emplace(count)
    }

    fn mark_deleted(&self, id: EntityID) {
        self.delete(id);
    }
}

impl<A: Archetype> Debug for ParallelStore<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ParallelStore {{ prefix: {:#x}, dense: {}, deleted: {} }}",
            self.prefix,
            self.count.load(Ordering::Relaxed),
            self.deleted.one_count()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component;
    use crate::query::{Read, Write};

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Mass(u64);
    component!(Mass);

    fn store() -> ParallelStore<(Mass,)> {
        crate::pool::init_for_tests();
        ParallelStore::new(3)
    }

    fn live_ids(store: &ParallelStore<(Mass,)>) -> Vec<EntityID> {
        let view = store.get_view();
        let mut rows = view.rows::<(Read<Mass>,)>();
        let mut ids = Vec::new();
        while let Some((id, _)) = rows.next() {
            ids.push(id);
        }
        ids
    }

    #[test]
    fn test_emplace_stamps_ids() {
        let store = store();

        let view = store.emplace(3);
        assert_eq!(view.range(), (0, 3));

        let mut rows = view.rows::<(Write<Mass>,)>();
        let mut seen = Vec::new();
        while let Some((id, (mass,))) = rows.next() {
            *mass = Mass(51);
            seen.push(id);
        }
        drop(rows);
        drop(view);

        assert_eq!(seen.len(), 3);
        for (slot, id) in seen.iter().enumerate() {
            assert!(id.is_valid());
            assert_eq!(id.prefix(), 3);
            assert_eq!(id.slot(), slot);
        }
    }

    #[test]
    fn test_emplace_zero_is_empty() {
        let store = store();
        let view = store.emplace(0);
        assert!(view.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = store();
        let ids = {
            let view = store.emplace(4);
            drop(view);
            live_ids(&store)
        };

        store.delete(ids[1]);
        store.delete(ids[1]);
        assert_eq!(store.len(), 3);

        // A well-formed but foreign ID is ignored.
        store.delete(EntityID::new(9, 0));
        // A slot beyond the dense range is ignored.
        store.delete(EntityID::new(3, 100));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_view_at_deleted_is_empty() {
        let store = store();
        drop(store.emplace(2));
        let ids = live_ids(&store);

        assert_eq!(store.get_view_at(ids[0]).len(), 1);
        store.delete(ids[0]);
        assert!(store.get_view_at(ids[0]).is_empty());
        assert_eq!(store.get_view_at(ids[1]).len(), 1);
    }

    #[test]
    fn test_compaction_preserves_live_entities() {
        let store = store();

        {
            let view = store.emplace(6);
            let mut rows = view.rows::<(Write<Mass>,)>();
            let mut value = 0;
            while let Some((_, (mass,))) = rows.next() {
                *mass = Mass(value);
                value += 1;
            }
        }

        let ids = live_ids(&store);
        store.delete(ids[1]);
        store.delete(ids[4]);

        // The next view cycle ends at refcount zero and compacts.
        drop(store.get_view());
        let view = store.get_view();
        assert_eq!(view.range(), (0, 4));
        drop(view);

        let mut survivors: Vec<(EntityID, Mass)> = Vec::new();
        let view = store.get_view();
        let mut rows = view.rows::<(Read<Mass>,)>();
        while let Some((id, (mass,))) = rows.next() {
            survivors.push((id, *mass));
        }
        drop(rows);
        drop(view);

        let mut values: Vec<u64> = survivors.iter().map(|(_, mass)| mass.0).collect();
        values.sort();
        assert_eq!(values, vec![0, 2, 3, 5]);

        // Every surviving ID still resolves to its row.
        for (id, mass) in survivors {
            let view = store.get_view_at(id);
            let mut rows = view.rows::<(Read<Mass>,)>();
            let (found, (value,)) = rows.next().unwrap();
            assert_eq!(found, id);
            assert_eq!(*value, mass);
        }
    }

    #[test]
    fn test_compaction_recycles_ids() {
        let store = store();
        drop(store.emplace(4));
        let ids = live_ids(&store);

        store.delete(ids[0]);
        store.delete(ids[2]);
        drop(store.get_view());

        // Deleted IDs no longer resolve.
        assert!(store.get_view_at(ids[0]).is_empty());
        assert!(store.get_view_at(ids[2]).is_empty());
        assert_eq!(store.len(), 2);

        // New entities reuse the freed slots and the freed IDs.
        drop(store.emplace(2));
        let mut all = live_ids(&store);
        all.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(all, expected);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_delete_all_then_compact() {
        let store = store();
        drop(store.emplace(100));
        for id in live_ids(&store) {
            store.delete(id);
        }
        assert_eq!(store.len(), 0);

        drop(store.get_view());
        let view = store.get_view();
        assert!(view.is_empty());
    }
}
