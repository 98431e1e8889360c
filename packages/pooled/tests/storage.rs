//! End-to-end scenarios over the archetype-set storage.

use std::collections::HashSet;
use std::sync::Once;

use pooled::{component, pool, EntityID, Read, Select, Storage, Without, Write};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Health {
    x: u64,
}
component!(Health);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Armor {
    x: u64,
}
component!(Armor);

type Plain = (Health,);
type Armored = (Health, Armor);

type ReadHealth = Select<(Read<Health>,)>;
type WriteHealth = Select<(Write<Health>,)>;

fn setup() -> Storage {
    static INIT: Once = Once::new();
    INIT.call_once(|| pool::init(32768));
    Storage::new::<(Plain, Armored)>()
}

fn collect_ids(storage: &Storage) -> Vec<EntityID> {
    let result = storage.run_query::<ReadHealth>();
    let mut rows = result.rows();
    let mut ids = Vec::new();
    while let Some((id, _)) = rows.next() {
        ids.push(id);
    }
    ids
}

#[test]
fn create_write_and_query() {
    let storage = setup();

    {
        let view = storage.create::<Plain>(2);
        let mut rows = view.rows::<(Write<Health>,)>();
        while let Some((_, (health,))) = rows.next() {
            health.x = 51;
        }
    }

    let result = storage.run_query::<ReadHealth>();
    let mut rows = result.rows();
    let mut ids = Vec::new();
    while let Some((id, (health,))) = rows.next() {
        assert_eq!(health.x, 51);
        ids.push(id);
    }

    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    for id in ids {
        assert!(id.bits() >= 0x8000_0000_0000_0000);
        assert!(id.bits() < 0x8000_0000_0000_0002);
    }
}

#[test]
fn delete_then_compact_on_quiescence() {
    let storage = setup();

    {
        let view = storage.create::<Plain>(2);
        let mut rows = view.rows::<(Write<Health>,)>();
        while let Some((_, (health,))) = rows.next() {
            health.x = 51;
        }
    }

    let mut ids = collect_ids(&storage);
    ids.sort();
    let id0 = ids[0];

    storage.delete(id0);

    // The mark is immediately visible to new views.
    let result = storage.run_query::<ReadHealth>();
    assert_eq!(result.count(), 1);
    // The dense range still contains the deleted slot.
    assert_eq!(result.len(), 2);
    drop(result);

    // Dropping the last view compacted the store.
    let result = storage.run_query::<ReadHealth>();
    assert_eq!(result.count(), 1);
    assert_eq!(result.len(), 1);

    // The deleted ID no longer resolves; the survivor still does.
    assert!(storage.run_query_at::<ReadHealth>(id0).is_empty());
    assert_eq!(storage.run_query_at::<ReadHealth>(ids[1]).count(), 1);
}

#[test]
fn bulk_create_write_delete() {
    let storage = setup();
    let count = 100_000;

    let view = storage.create::<Plain>(count);

    {
        let mut rows = view.rows::<(Write<Health>,)>();
        while let Some((_, (health,))) = rows.next() {
            health.x = 51;
        }
    }

    // Rewrite every element with its visit order.
    {
        let mut rows = view.rows::<(Write<Health>,)>();
        let mut counter = 0u64;
        while let Some((_, (health,))) = rows.next() {
            assert_eq!(health.x, 51);
            health.x = counter;
            counter += 1;
        }
        assert_eq!(counter, count as u64);
    }

    let mut ids = Vec::with_capacity(count);
    {
        let mut rows = view.rows::<(Read<Health>,)>();
        while let Some((id, _)) = rows.next() {
            ids.push(id);
        }
    }
    for id in ids {
        storage.delete(id);
    }
    drop(view);

    // Quiescence compacted the store down to nothing.
    let result = storage.run_query::<ReadHealth>();
    assert_eq!(result.len(), 0);
    assert_eq!(result.count(), 0);
}

#[test]
fn queries_select_matching_archetypes() {
    let storage = setup();

    drop(storage.create::<Plain>(10));
    drop(storage.create::<Armored>(10));

    assert_eq!(storage.run_query::<ReadHealth>().count(), 20);
    assert_eq!(
        storage.run_query::<Without<ReadHealth, Armor>>().count(),
        10
    );
    assert_eq!(
        storage
            .run_query::<Select<(Read<Health>, Read<Armor>)>>()
            .count(),
        10
    );

    // Armored entities come from the second store.
    let armored = storage.run_query::<Select<(Read<Armor>,)>>();
    let mut rows = armored.rows();
    while let Some((id, _)) = rows.next() {
        assert_eq!(id.prefix(), 1);
    }
}

#[test]
fn readers_keep_their_snapshot() {
    let storage = setup();

    {
        let view = storage.create::<Plain>(600);
        let mut rows = view.rows::<(Write<Health>,)>();
        while let Some((_, (health,))) = rows.next() {
            health.x = 51;
        }
    }

    // Open a writer on the first element; the write lands in a shadow
    // block which is not yet published.
    let writer_view = storage.run_query::<WriteHealth>();
    let mut writer_rows = writer_view.rows();
    let (_, (first,)) = writer_rows.next().unwrap();
    first.x = 99;

    // A reader sees the pre-write values everywhere.
    let result = storage.run_query::<ReadHealth>();
    let mut rows = result.rows();
    while let Some((_, (health,))) = rows.next() {
        assert_eq!(health.x, 51);
    }
    drop(rows);
    drop(result);

    // Dropping the writer publishes the shadow block.
    drop(writer_rows);
    drop(writer_view);

    let result = storage.run_query::<ReadHealth>();
    let mut rows = result.rows();
    let (_, (health,)) = rows.next().unwrap();
    assert_eq!(health.x, 99);
    let mut rest = 0;
    while let Some((_, (health,))) = rows.next() {
        assert_eq!(health.x, 51);
        rest += 1;
    }
    assert_eq!(rest, 599);
}

#[test]
fn concurrent_create_delete_stress() {
    let storage = setup();
    let threads = 4;
    let iterations = 50;

    let (created, deleted): (usize, usize) = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|worker| {
                let storage = &storage;
                scope.spawn(move || {
                    let mut created = 0;
                    let mut deleted = 0;
                    let mut state = 0x9e37_79b9_u64.wrapping_add(worker as u64);

                    for _ in 0..iterations {
                        // Cheap deterministic PRNG keeps runs reproducible
                        // per thread.
                        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                        let count = (state >> 33) as usize % 64 + 1;

                        let view = storage.create::<Plain>(count);
                        created += count;

                        let mut ids = Vec::with_capacity(count);
                        {
                            let mut rows = view.rows::<(Write<Health>,)>();
                            while let Some((id, (health,))) = rows.next() {
                                health.x = id.bits();
                                ids.push(id);
                            }
                        }

                        // Delete every other entity while the view still
                        // pins the store.
                        for id in ids.iter().step_by(2) {
                            storage.delete(*id);
                            deleted += 1;
                        }
                        drop(view);
                    }

                    (created, deleted)
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .fold((0, 0), |acc, (c, d)| (acc.0 + c, acc.1 + d))
    });

    // Quiesce: one view cycle with no concurrent holders compacts.
    drop(storage.run_query::<ReadHealth>());

    let live = created - deleted;
    let result = storage.run_query::<ReadHealth>();
    assert_eq!(result.len(), live);
    assert_eq!(result.count(), live);
    drop(result);

    // Live IDs are distinct and every one resolves to a live row with the
    // value its creator wrote.
    let ids = collect_ids(&storage);
    assert_eq!(ids.len(), live);
    let distinct: HashSet<EntityID> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), live);

    for id in ids {
        let found = storage.run_query_at::<ReadHealth>(id);
        let mut rows = found.rows();
        let (resolved, (health,)) = rows.next().unwrap();
        assert_eq!(resolved, id);
        assert_eq!(health.x, id.bits());
    }
}

#[test]
fn empty_and_invalid_operations() {
    let storage = setup();

    let view = storage.create::<Plain>(0);
    assert!(view.is_empty());
    assert!(view.rows::<(Read<Health>,)>().next().is_none());
    drop(view);

    // Deleting garbage IDs is a no-op.
    storage.delete(EntityID::default());
    storage.delete(EntityID::from_bits(0x8000_0123_4567_89ab));

    assert!(storage
        .run_query_at::<ReadHealth>(EntityID::default())
        .is_empty());
}
