use std::time::Instant;

use rand::Rng;

use pooled::{component, pool, Read, Select, Storage, Write, BLOCK_SIZE};

#[derive(Debug, Clone, Copy, Default)]
pub struct Position {
    x: f64,
    y: f64,
}
component!(Position);

#[derive(Debug, Clone, Copy, Default)]
pub struct Velocity {
    dx: f64,
    dy: f64,
}
component!(Velocity);

type Moving = (Position, Velocity);
type Fixed = (Position,);

type ReadPositions = Select<(Read<Position>,)>;

fn main() {
    env_logger::init();

    let blocks = 262_144;
    pool::init(blocks);
    println!(
        "pool: {} blocks, {} MiB",
        blocks,
        blocks * BLOCK_SIZE / (1024 * 1024)
    );

    let storage = Storage::new::<(Moving, Fixed)>();
    let total = 2_000_000;
    let workers = 8;

    let start = Instant::now();
    rayon::scope(|scope| {
        for worker in 0..workers {
            let storage = &storage;
            scope.spawn(move |_| {
                let view = storage.create::<Moving>(total / workers);
                let mut rows = view.rows::<(Write<Position>, Write<Velocity>)>();
                while let Some((_, (position, velocity))) = rows.next() {
                    position.x = worker as f64;
                    position.y = 0.0;
                    velocity.dx = 1.0;
                    velocity.dy = -1.0;
                }
            });
        }
    });
    println!("created {} entities in {:?}", total, start.elapsed());

    drop(storage.create::<Fixed>(total / 10));
    println!("created {} fixtures", total / 10);

    let start = Instant::now();
    let result = storage.run_query::<ReadPositions>();
    let count = result.count();
    drop(result);
    println!("queried {} positions in {:?}", count, start.elapsed());

    let start = Instant::now();
    let mut rng = rand::thread_rng();
    let result = storage.run_query::<ReadPositions>();
    let mut doomed = Vec::new();
    {
        let mut rows = result.rows();
        while let Some((id, _)) = rows.next() {
            if rng.gen_bool(0.5) {
                doomed.push(id);
            }
        }
    }
    for id in &doomed {
        storage.delete(*id);
    }
    drop(result);
    println!("deleted {} entities in {:?}", doomed.len(), start.elapsed());

    // One empty view cycle quiesces the storage and compacts.
    let start = Instant::now();
    drop(storage.run_query::<ReadPositions>());
    println!("compacted in {:?}", start.elapsed());

    let result = storage.run_query::<ReadPositions>();
    assert_eq!(result.len(), count - doomed.len());
    assert_eq!(result.count(), count - doomed.len());
    drop(result);
    println!("{} entities survive", count - doomed.len());

    drop(storage);
    println!("free blocks after teardown: {} / {}", pool::free_blocks(), blocks);
}
