//! Registers two systems onto a deterministic per-frame stage and runs
//! several frames through the scheduler.

use archetype_ecs::dependency::ExecutionModel;
use archetype_ecs::schedule::ScheduleModel;
use archetype_ecs::{EcsError, Stage, System, SystemAccess, World, WorldConfig};

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

struct MovementSystem;

impl System for MovementSystem {
    fn name(&self) -> &'static str {
        "movement"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::empty().reads::<Velocity>().writes::<Position>()
    }

    fn run(&mut self, world: &World) -> Result<(), EcsError> {
        world.query::<(&Velocity, &mut Position)>().for_each(|_, (velocity, position)| {
            position.x += velocity.x;
            position.y += velocity.y;
        });
        Ok(())
    }
}

struct LoggingSystem;

impl System for LoggingSystem {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::empty().reads::<Position>().depends_on("movement")
    }

    fn run(&mut self, world: &World) -> Result<(), EcsError> {
        let mut count = 0;
        world.query::<(&Position,)>().for_each(|_, _| count += 1);
        tracing::info!(count, "positions visible after movement");
        Ok(())
    }
}

fn main() -> Result<(), EcsError> {
    let world = World::new(WorldConfig::default().with_thread_pool_workers(2));

    for i in 0..100 {
        world.create_entity((Position { x: i as f32, y: 0.0 }, Velocity { x: 1.0, y: 0.0 }));
    }
    world.end_frame()?;

    world.register_stage(Stage::new("update", ScheduleModel::PerFrame, ExecutionModel::Deterministic))?;
    world.register_system("update", Box::new(MovementSystem))?;
    world.register_system("update", Box::new(LoggingSystem))?;

    for _ in 0..5 {
        world.run()?;
    }
    Ok(())
}
