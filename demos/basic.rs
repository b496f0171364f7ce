//! Spawns entities, queries them, and walks a manual synchronization cycle.

use archetype_ecs::{Entity, Query, World, WorldConfig};

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

fn main() {
    let world = World::new(WorldConfig::default());

    for i in 0..10 {
        world.create_entity((Position { x: i as f32, y: 0.0 }, Velocity { x: 1.0, y: 0.5 }));
    }
    world.end_frame().expect("synchronization never fails outside staging misuse");

    let query: Query<(&Velocity, &mut Position)> = world.query();
    query.for_each(|_entity: Entity, (velocity, position)| {
        position.x += velocity.x;
        position.y += velocity.y;
    });

    let mut total_x = 0.0;
    world.query::<(&Position,)>().for_each(|_, (position,)| {
        total_x += position.x;
    });
    println!("matched {} archetypes, total x = {total_x}", query.matched_archetype_count());
}
