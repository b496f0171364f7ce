//! Query iteration throughput over dense and changed-only rows.

use archetype_ecs::{World, WorldConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

#[derive(Debug, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
}

fn populated_world(count: usize) -> World {
    let world = World::new(WorldConfig::default().with_thread_pool_workers(1));
    world.mark_tracked::<Position>();
    for i in 0..count {
        world.create_entity((Position { x: i as f32, y: 0.0 }, Velocity { x: 1.0, y: 1.0 }));
    }
    world.end_frame().unwrap();
    world
}

fn bench_for_each(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_for_each");
    for count in [1_000usize, 10_000, 100_000] {
        let world = populated_world(count);
        group.bench_with_input(BenchmarkId::new("read_write", count), &count, |b, _| {
            b.iter(|| {
                world.query::<(&Velocity, &mut Position)>().for_each(|_, (velocity, position)| {
                    position.x += velocity.x;
                    black_box(position.y);
                });
            });
        });
    }
    group.finish();
}

fn bench_for_each_changed(c: &mut Criterion) {
    let world = populated_world(10_000);
    // Touch a tenth of the rows so for_each_changed has real filtering to do.
    let mut touched = 0;
    world.query::<(&mut Position,)>().for_each(|entity, (position,)| {
        if entity.index() % 10 == 0 {
            position.x += 1.0;
            touched += 1;
        }
    });
    black_box(touched);

    c.bench_function("for_each_changed_tenth", |b| {
        b.iter(|| {
            world.query::<(&Position,)>().for_each_changed::<Position>(|_, (position,)| {
                black_box(position.x);
            });
        });
    });
}

criterion_group!(benches, bench_for_each, bench_for_each_changed);
criterion_main!(benches);
