//! Entity creation and synchronization throughput.

use archetype_ecs::{World, WorldConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

#[derive(Debug, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Clone, Copy)]
struct Health(u32);

fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");
    for count in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("create_and_sync", count), &count, |b, &count| {
            b.iter(|| {
                let world = World::new(WorldConfig::default().with_thread_pool_workers(1));
                for i in 0..count {
                    black_box(world.create_entity((
                        Position { x: i as f32, y: 0.0, z: 0.0 },
                        Velocity { x: 1.0, y: 0.0, z: 0.0 },
                    )));
                }
                world.end_frame().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_spawn_with_tag(c: &mut Criterion) {
    c.bench_function("spawn_three_components", |b| {
        let world = World::new(WorldConfig::default().with_thread_pool_workers(1));
        b.iter(|| {
            black_box(world.create_entity((
                Position { x: 0.0, y: 0.0, z: 0.0 },
                Velocity { x: 0.0, y: 0.0, z: 0.0 },
                Health(100),
            )));
        });
    });
}

criterion_group!(benches, bench_spawn, bench_spawn_with_tag);
criterion_main!(benches);
