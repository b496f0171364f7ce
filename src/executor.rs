//! Per-stage execution graph runner and metrics (SPEC_FULL §4.9.4, §4.9.6).
//!
//! Replaces the teacher's stub `execute_frame` (an empty loop body) with the
//! atomic `deps_remaining`-counter runner the spec describes, and the
//! teacher's `SystemProfiler` (a `Vec<Duration>` per system, unbounded
//! growth) with the bounded fastest/slowest/average/total-executions
//! counters of §4.9.6, coordinated by a reader-count + writer-flag spinlock
//! so a sampler thread never blocks execution for long. Grounded on the
//! teacher's `parallel.rs` raw-pointer Send/Sync bypass for cross-thread
//! system dispatch, generalized from "one rayon `par_iter` per stage" into
//! "one node dispatched per `deps_remaining` reaching zero".

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::dependency::DependencyGraph;
use crate::error::Result;
use crate::parallel::JobPool;
use crate::system::BoxedSystem;
use crate::world::World;

/// A snapshot of one node's accumulated timing data (§4.9.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeMetricsData {
    pub fastest_nanos: u64,
    pub slowest_nanos: u64,
    pub total_nanos: u64,
    pub total_executions: u64,
}

impl NodeMetricsData {
    pub fn average_nanos(&self) -> u64 {
        if self.total_executions == 0 {
            0
        } else {
            self.total_nanos / self.total_executions
        }
    }

    fn record(&mut self, elapsed_nanos: u64) {
        if self.total_executions == 0 || elapsed_nanos < self.fastest_nanos {
            self.fastest_nanos = elapsed_nanos;
        }
        if elapsed_nanos > self.slowest_nanos {
            self.slowest_nanos = elapsed_nanos;
        }
        self.total_nanos += elapsed_nanos;
        self.total_executions += 1;
    }
}

/// A reader-count + writer-flag spinlock around a `Copy` value (§4.9.6:
/// "readers and writers of metrics coordinate through a reader-count +
/// writer-flag spinlock so the sampler thread can read without blocking
/// execution for long"). Not a general-purpose lock: writers themselves
/// spin rather than queue, which is fine for the single-writer-per-node
/// access pattern the executor uses.
pub struct SpinMetrics<T: Copy> {
    value: UnsafeCell<T>,
    readers: AtomicUsize,
    writer: AtomicBool,
}

unsafe impl<T: Copy + Send> Send for SpinMetrics<T> {}
unsafe impl<T: Copy + Send> Sync for SpinMetrics<T> {}

impl<T: Copy + Default> Default for SpinMetrics<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy> SpinMetrics<T> {
    pub fn new(value: T) -> Self {
        SpinMetrics { value: UnsafeCell::new(value), readers: AtomicUsize::new(0), writer: AtomicBool::new(false) }
    }

    pub fn read(&self) -> T {
        let backoff = Backoff::new();
        loop {
            if !self.writer.load(Ordering::Acquire) {
                self.readers.fetch_add(1, Ordering::AcqRel);
                if !self.writer.load(Ordering::Acquire) {
                    let snapshot = unsafe { *self.value.get() };
                    self.readers.fetch_sub(1, Ordering::AcqRel);
                    return snapshot;
                }
                self.readers.fetch_sub(1, Ordering::AcqRel);
            }
            backoff.spin();
        }
    }

    pub fn write(&self, f: impl FnOnce(&mut T)) {
        let backoff = Backoff::new();
        while self.writer.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            backoff.spin();
        }
        let backoff = Backoff::new();
        while self.readers.load(Ordering::Acquire) > 0 {
            backoff.spin();
        }
        unsafe { f(&mut *self.value.get()) };
        self.writer.store(false, Ordering::Release);
    }
}

/// A stage's aggregate metrics: total time spent executing and begin/end
/// invocation counters (§4.9.6). Plain atomics suffice here since each
/// field is read independently.
#[derive(Default)]
pub struct StageMetrics {
    pub total_nanos: AtomicUsize,
    pub begin_count: AtomicUsize,
    pub end_count: AtomicUsize,
}

impl StageMetrics {
    pub fn record_run(&self, elapsed_nanos: u64) {
        self.total_nanos.fetch_add(elapsed_nanos as usize, Ordering::Relaxed);
    }

    pub fn record_begin(&self) {
        self.begin_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_end(&self) {
        self.end_count.fetch_add(1, Ordering::Relaxed);
    }
}

struct ExecNode {
    successors: Vec<usize>,
    static_deps: usize,
}

/// A raw pointer wrapper used solely to smuggle non-`'static`,
/// non-`Send` pointers (and trait objects) across the thread-pool boundary.
/// Every use is paired with a safety argument tied to
/// [`ExecutionGraph::run`] blocking the calling thread until every spawned
/// closure has completed.
struct SendPtr<T: ?Sized>(*const T);
unsafe impl<T: ?Sized> Send for SendPtr<T> {}
unsafe impl<T: ?Sized> Sync for SendPtr<T> {}
impl<T: ?Sized> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        SendPtr(self.0)
    }
}
impl<T: ?Sized> Copy for SendPtr<T> {}

/// The realized execution graph for one stage: one node per registered
/// system, edges derived from [`DependencyGraph::edges`] (§4.9.3, §4.9.4).
pub struct ExecutionGraph {
    nodes: Vec<ExecNode>,
    metrics: Vec<SpinMetrics<NodeMetricsData>>,
}

impl ExecutionGraph {
    pub fn build(dep: &DependencyGraph, system_count: usize) -> Self {
        let matrix = dep.edges();
        let mut static_deps = vec![0usize; system_count];
        for row in matrix {
            for j in row.ones() {
                static_deps[j] += 1;
            }
        }
        let nodes = (0..system_count)
            .map(|i| ExecNode { successors: matrix[i].ones().collect(), static_deps: static_deps[i] })
            .collect();
        let metrics = (0..system_count).map(|_| SpinMetrics::default()).collect();
        ExecutionGraph { nodes, metrics }
    }

    /// An execution graph with no edges at all (one node per system, every
    /// node a root) — used for `parallel` stages and as the trivial "no
    /// systems yet" case.
    pub fn trivial(system_count: usize) -> Self {
        let nodes = (0..system_count).map(|_| ExecNode { successors: Vec::new(), static_deps: 0 }).collect();
        let metrics = (0..system_count).map(|_| SpinMetrics::default()).collect();
        ExecutionGraph { nodes, metrics }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_metrics(&self, idx: usize) -> NodeMetricsData {
        self.metrics[idx].read()
    }

    /// Runs every node honoring dependency order (§4.9.4). `inline` forces
    /// single-threaded dispatch regardless of `pool` — used for `serial`
    /// stages, whose graph is already a linear chain so this just walks it
    /// in order on the calling thread.
    pub fn run(&self, systems: &mut [BoxedSystem], world: &World, pool: &dyn JobPool, inline: bool) -> Result<()> {
        let total = self.nodes.len();
        if total == 0 {
            return Ok(());
        }

        let remaining: Arc<Vec<AtomicUsize>> =
            Arc::new(self.nodes.iter().map(|n| AtomicUsize::new(n.static_deps)).collect());
        let completed = Arc::new((Mutex::new(0usize), Condvar::new()));
        let first_error: Arc<Mutex<Option<crate::error::EcsError>>> = Arc::new(Mutex::new(None));

        // SAFETY: `run` blocks the calling thread until `completed.0` reaches
        // `total` before returning, so every raw pointer captured below
        // remains valid for the full lifetime of every spawned closure even
        // though the closures themselves must be `'static` to cross the
        // pool boundary. Systems dispatched concurrently never alias: nodes
        // only become runnable once every predecessor that conflicts with
        // or hard-depends on them has finished (dependency.rs's conflict
        // analysis), so each running closure touches a disjoint system and
        // (by the scheduler's non-aliasing proof, §5) disjoint world state.
        let systems_ptr: SendPtr<BoxedSystem> = SendPtr(systems.as_ptr());
        let world_ptr: SendPtr<World> = SendPtr(world as *const World);
        let pool_ptr: SendPtr<dyn JobPool> = SendPtr(pool as *const dyn JobPool);

        for i in 0..total {
            if self.nodes[i].static_deps == 0 {
                self.spawn_node(i, systems_ptr, world_ptr, remaining.clone(), completed.clone(), first_error.clone(), pool_ptr, inline, total);
            }
        }

        let (lock, cvar) = &*completed;
        let mut done = lock.lock();
        while *done < total {
            cvar.wait(&mut done);
        }

        match Arc::try_unwrap(first_error).map(Mutex::into_inner).unwrap_or(None) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_node(
        &self,
        idx: usize,
        systems_ptr: SendPtr<BoxedSystem>,
        world_ptr: SendPtr<World>,
        remaining: Arc<Vec<AtomicUsize>>,
        completed: Arc<(Mutex<usize>, Condvar)>,
        first_error: Arc<Mutex<Option<crate::error::EcsError>>>,
        pool_ptr: SendPtr<dyn JobPool>,
        inline: bool,
        total: usize,
    ) {
        // `self` outlives the run() call that spawned this node (see the
        // safety comment in `run`), so smuggling it as a raw pointer is
        // sound under the same blocking argument.
        let graph_ptr: SendPtr<ExecutionGraph> = SendPtr(self as *const ExecutionGraph);
        let successors = self.nodes[idx].successors.clone();

        let job = move || {
            let graph = unsafe { &*graph_ptr.0 };
            let system = unsafe { &mut *(systems_ptr.0 as *mut BoxedSystem).add(idx) };
            let world = unsafe { &*world_ptr.0 };

            let start = Instant::now();
            let result = system.run(world);
            let elapsed = start.elapsed().as_nanos() as u64;
            graph.metrics[idx].write(|m| m.record(elapsed));

            if let Err(err) = result {
                let mut slot = first_error.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
            }

            for &succ in &successors {
                if remaining[succ].fetch_sub(1, Ordering::AcqRel) == 1 {
                    graph.spawn_node(succ, systems_ptr, world_ptr, remaining.clone(), completed.clone(), first_error.clone(), pool_ptr, inline, total);
                }
            }

            let (lock, cvar) = &*completed;
            let mut done = lock.lock();
            *done += 1;
            if *done == total {
                cvar.notify_all();
            }
        };

        if inline {
            job();
        } else {
            let pool = unsafe { &*pool_ptr.0 };
            pool.execute(Box::new(job));
        }
    }
}
