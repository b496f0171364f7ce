//! Stage registry: named dispatch points with a schedule model and an
//! execution model (SPEC_FULL §4.9.1, §4.9.5, §4.9.7).
//!
//! Replaces the teacher's single flat `Schedule` (one dependency graph for
//! every registered system, topological-sort-only, no notion of named
//! stages or of running on anything but "once") with the distilled spec's
//! `Stage`/`StageRegistry`: many independently-built execution graphs, each
//! with its own schedule model governing *when* it runs (`per_frame`,
//! `fixed_hz`, `manual`, `passive`) and execution model governing *how*
//! (`serial`, `parallel`, `deterministic`, `passive`, via `dependency.rs`).

use rustc_hash::FxHashMap;
use std::time::Instant;

use crate::dependency::{DependencyGraph, ExecutionModel};
use crate::error::{EcsError, Result};
use crate::executor::{ExecutionGraph, StageMetrics};
use crate::parallel::JobPool;
use crate::system::{BoxedSystem, SystemAccess};
use crate::world::World;

/// §4.9.1: governs *when* a stage runs relative to the frame loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleModel {
    /// Runs once per synchronization tick, in registration order (§4.9.5).
    PerFrame,
    /// Accumulates elapsed time; drains one step per configured period,
    /// with no interpolation defined at this layer (§4.9.5).
    FixedHz(f64),
    /// Runs only on explicit invocation.
    Manual,
    /// Never driven by `StageRegistry::run_per_frame`/`tick_fixed_hz`; the
    /// application calls into it directly and it has no execution graph.
    Passive,
}

type StageCallback = Box<dyn Fn() + Send + Sync>;

/// A named dispatch point: a schedule model, an execution model, and the
/// systems registered into it (§4.9.1).
pub struct Stage {
    name: &'static str,
    schedule_model: ScheduleModel,
    execution_model: ExecutionModel,
    systems: Vec<BoxedSystem>,
    names: Vec<&'static str>,
    graph: Option<ExecutionGraph>,
    on_begin: Option<StageCallback>,
    on_end: Option<StageCallback>,
    fixed_hz_accumulator: f64,
    metrics: StageMetrics,
}

impl Stage {
    pub fn new(name: &'static str, schedule_model: ScheduleModel, execution_model: ExecutionModel) -> Self {
        Stage {
            name,
            schedule_model,
            execution_model,
            systems: Vec::new(),
            names: Vec::new(),
            graph: None,
            on_begin: None,
            on_end: None,
            fixed_hz_accumulator: 0.0,
            metrics: StageMetrics::default(),
        }
    }

    pub fn with_on_begin(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_begin = Some(Box::new(f));
        self
    }

    pub fn with_on_end(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    pub fn add_system(&mut self, system: BoxedSystem) {
        self.names.push(system.name());
        self.systems.push(system);
        self.graph = None;
    }

    /// §4.9.7: a `hard_deps` entry naming a system not registered in *this*
    /// stage is dropped with a warning rather than failing the build — it
    /// is recoverable, unlike a cycle among systems that are all present.
    fn drop_missing_hard_deps(&self) -> Vec<SystemAccess> {
        self.systems
            .iter()
            .map(|system| {
                let mut access = system.access();
                let stage = self.name;
                let owner = system.name();
                access.hard_deps.retain(|dep| {
                    let present = self.names.contains(dep);
                    if !present {
                        warn_missing_hard_dep(stage, owner, dep);
                    }
                    present
                });
                access
            })
            .collect()
    }

    pub fn build(&mut self) -> Result<()> {
        if self.graph.is_some() {
            return Ok(());
        }
        if matches!(self.execution_model, ExecutionModel::Passive | ExecutionModel::Parallel) {
            // §4.9.3: a parallel stage's nodes are all roots with zero
            // dependencies, conflicts included — building through
            // `DependencyGraph`/`ExecutionGraph::build` would serialize
            // conflicting systems via the conflict matrix `edges()` feeds
            // the executor from, which is exactly what this model forbids.
            self.graph = Some(ExecutionGraph::trivial(self.systems.len()));
            return Ok(());
        }
        let accesses = self.drop_missing_hard_deps();
        let dep_graph = DependencyGraph::new(accesses, &self.names, self.execution_model)?;
        self.graph = Some(ExecutionGraph::build(&dep_graph, self.systems.len()));
        Ok(())
    }

    fn run_once(&mut self, world: &World, pool: &dyn JobPool) -> Result<()> {
        self.build()?;
        if let Some(begin) = &self.on_begin {
            begin();
        }
        self.metrics.record_begin();

        let start = Instant::now();
        let inline = self.execution_model == ExecutionModel::Serial;
        if let Some(graph) = &self.graph {
            graph.run(&mut self.systems, world, pool, inline)?;
        }
        self.metrics.record_run(start.elapsed().as_nanos() as u64);

        if let Some(end) = &self.on_end {
            end();
        }
        self.metrics.record_end();
        Ok(())
    }

    /// §4.9.5: drains one step per configured period out of the
    /// accumulator; if `dt` covers several periods, runs several times.
    fn tick_fixed_hz(&mut self, dt: f64, world: &World, pool: &dyn JobPool) -> Result<()> {
        let ScheduleModel::FixedHz(hz) = self.schedule_model else { return Ok(()) };
        if hz <= 0.0 {
            return Ok(());
        }
        let period = 1.0 / hz;
        self.fixed_hz_accumulator += dt;
        while self.fixed_hz_accumulator >= period {
            self.fixed_hz_accumulator -= period;
            self.run_once(world, pool)?;
        }
        Ok(())
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn node_metrics(&self, system_index: usize) -> Option<crate::executor::NodeMetricsData> {
        self.graph.as_ref().map(|g| g.node_metrics(system_index))
    }
}

#[cfg(feature = "profiling")]
fn warn_missing_hard_dep(stage: &str, system: &str, dep: &str) {
    tracing::warn!(stage, system, dep, "hard_dep not registered in this stage; dropping it");
}

#[cfg(not(feature = "profiling"))]
fn warn_missing_hard_dep(_stage: &str, _system: &str, _dep: &str) {}

/// Registry of every stage the world knows about, keyed by name (§4.9.1).
#[derive(Default)]
pub struct StageRegistry {
    stages: Vec<Stage>,
    by_name: FxHashMap<&'static str, usize>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_stage(&mut self, stage: Stage) -> Result<()> {
        if self.by_name.contains_key(stage.name) {
            return Err(EcsError::StageConflict { stage: stage.name });
        }
        self.by_name.insert(stage.name, self.stages.len());
        self.stages.push(stage);
        Ok(())
    }

    pub fn register_system(&mut self, stage_name: &str, system: BoxedSystem) -> Result<()> {
        let &idx = self.by_name.get(stage_name).ok_or(EcsError::SystemNotFound)?;
        self.stages[idx].add_system(system);
        Ok(())
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.by_name.get(name).map(|&idx| &self.stages[idx])
    }

    /// §4.9.5: every `per_frame` stage, in registration order.
    pub fn run_per_frame(&mut self, world: &World, pool: &dyn JobPool) -> Result<()> {
        for stage in self.stages.iter_mut().filter(|s| s.schedule_model == ScheduleModel::PerFrame) {
            stage.run_once(world, pool)?;
        }
        Ok(())
    }

    /// §4.9.5: every `fixed_hz` stage, draining as many steps as `dt` covers.
    pub fn tick_fixed_hz(&mut self, dt: f64, world: &World, pool: &dyn JobPool) -> Result<()> {
        for stage in self.stages.iter_mut().filter(|s| matches!(s.schedule_model, ScheduleModel::FixedHz(_))) {
            stage.tick_fixed_hz(dt, world, pool)?;
        }
        Ok(())
    }

    /// §4.9.5: runs a `manual` (or any) stage once, by name, on demand.
    pub fn run_stage(&mut self, name: &str, world: &World, pool: &dyn JobPool) -> Result<()> {
        let &idx = self.by_name.get(name).ok_or(EcsError::SystemNotFound)?;
        self.stages[idx].run_once(world, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as EcsResult;
    use crate::parallel::InlinePool;
    use crate::system::System;

    struct NoopSystem(&'static str, SystemAccess);
    impl System for NoopSystem {
        fn name(&self) -> &'static str {
            self.0
        }
        fn access(&self) -> SystemAccess {
            self.1.clone()
        }
        fn run(&mut self, _world: &World) -> EcsResult<()> {
            Ok(())
        }
    }

    fn world() -> World {
        World::new(crate::config::WorldConfig::default())
    }

    #[test]
    fn register_stage_rejects_duplicate_name() {
        let mut registry = StageRegistry::new();
        registry.register_stage(Stage::new("update", ScheduleModel::PerFrame, ExecutionModel::Deterministic)).unwrap();
        let err = registry.register_stage(Stage::new("update", ScheduleModel::Manual, ExecutionModel::Serial)).unwrap_err();
        assert!(matches!(err, EcsError::StageConflict { .. }));
    }

    #[test]
    fn per_frame_stage_runs_on_run_per_frame() {
        let mut registry = StageRegistry::new();
        registry.register_stage(Stage::new("update", ScheduleModel::PerFrame, ExecutionModel::Deterministic)).unwrap();
        registry.register_system("update", Box::new(NoopSystem("s", SystemAccess::empty()))).unwrap();
        let w = world();
        let pool = InlinePool;
        registry.run_per_frame(&w, &pool).unwrap();
    }

    #[test]
    fn missing_hard_dep_is_dropped_not_fatal() {
        let mut stage = Stage::new("update", ScheduleModel::Manual, ExecutionModel::Deterministic);
        stage.add_system(Box::new(NoopSystem("a", SystemAccess::empty().depends_on("ghost"))));
        assert!(stage.build().is_ok());
    }

    #[test]
    fn fixed_hz_drains_multiple_steps() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingSystem(Arc<AtomicUsize>);
        impl System for CountingSystem {
            fn name(&self) -> &'static str {
                "counter"
            }
            fn access(&self) -> SystemAccess {
                SystemAccess::empty()
            }
            fn run(&mut self, _world: &World) -> EcsResult<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mut registry = StageRegistry::new();
        registry.register_stage(Stage::new("physics", ScheduleModel::FixedHz(10.0), ExecutionModel::Deterministic)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        registry.register_system("physics", Box::new(CountingSystem(count.clone()))).unwrap();
        let w = world();
        let pool = InlinePool;
        registry.tick_fixed_hz(0.25, &w, &pool).unwrap(); // 0.25s at 10hz (0.1s period) -> 2 steps
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    /// §4.9.3: a parallel stage must dispatch every system as a root, even
    /// when two systems conflict on the same component. Runs the two
    /// systems on real OS threads and has them rendezvous over a pair of
    /// channels; if the scheduler had instead serialized them through the
    /// conflict matrix (the regression this guards against), the first
    /// system would block forever waiting on a peer that cannot start
    /// until the first one returns, and the `recv_timeout` below fires.
    #[test]
    fn parallel_stage_dispatches_conflicting_systems_as_roots() {
        use crate::parallel::JobPool;
        use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
        use std::sync::{Arc, Mutex};
        use std::time::Duration;

        struct ThreadPool;
        impl JobPool for ThreadPool {
            fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
                std::thread::spawn(job);
            }
        }

        struct RendezvousSystem {
            name: &'static str,
            tx: SyncSender<()>,
            rx: Arc<Mutex<Receiver<()>>>,
        }
        impl System for RendezvousSystem {
            fn name(&self) -> &'static str {
                self.name
            }
            fn access(&self) -> SystemAccess {
                SystemAccess::empty().writes::<u32>()
            }
            fn run(&mut self, _world: &World) -> EcsResult<()> {
                self.tx.send(()).unwrap();
                self.rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_millis(500))
                    .expect("peer never ran concurrently - conflicting systems were serialized");
                Ok(())
            }
        }

        let (a_tx, b_rx) = sync_channel::<()>(1);
        let (b_tx, a_rx) = sync_channel::<()>(1);

        let mut stage = Stage::new("update", ScheduleModel::Manual, ExecutionModel::Parallel);
        stage.add_system(Box::new(RendezvousSystem {
            name: "a",
            tx: a_tx,
            rx: Arc::new(Mutex::new(a_rx)),
        }));
        stage.add_system(Box::new(RendezvousSystem {
            name: "b",
            tx: b_tx,
            rx: Arc::new(Mutex::new(b_rx)),
        }));

        let w = world();
        let pool = ThreadPool;
        stage.run_once(&w, &pool).unwrap();
    }
}
