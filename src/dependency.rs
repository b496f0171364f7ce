//! Dependency analysis and stage construction (SPEC_FULL §4.9.3).
//!
//! Grounded on the teacher's `dependency.rs` (bitset adjacency matrix,
//! Kahn's-algorithm topological layering with greedy conflict-free batch
//! packing, critical-path backtrace), extended with:
//! - explicit `hard_deps` edges (resolved by system name, independent of
//!   registration order) in addition to conflict-derived edges;
//! - eager cycle detection over the `hard_deps` subgraph, which is a fatal
//!   registration error (`EcsError::CyclicSystemDependency`) rather than a
//!   silently-dropped dependency;
//! - the four execution models (§4.9.3): `Deterministic` (layered + packed,
//!   as in the teacher), `Serial` (same layering, then linearized into one
//!   chain), `Parallel` (every system a root, no edges at all), `Passive`
//!   (no execution graph; the stage is driven by explicit calls only).

use rustc_hash::FxHashSet;
use std::collections::VecDeque;

use crate::bitset::BitSet;
use crate::error::{EcsError, Result};
use crate::system::SystemAccess;

/// The four execution models a stage may declare (§4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionModel {
    Serial,
    Parallel,
    Deterministic,
    Passive,
}

/// Represents execution stages where all systems in a stage can run in parallel
#[derive(Clone, Debug)]
pub struct ExecutionStage {
    pub system_indices: Vec<usize>,
    pub depth: usize, // Depth in dependency graph (for priority)
}

/// Builds execution stages from system dependencies using topological sort
pub struct DependencyGraph {
    stages: Vec<ExecutionStage>,
    critical_path: Vec<usize>,
    // Row 'i' contains bit 'j' set iff system 'i' must complete before 'j' starts.
    #[allow(dead_code)] // kept for debugging/analysis (print_schedule, is_critical)
    dependency_matrix: Vec<BitSet>,
}

impl DependencyGraph {
    /// Create graph from system accesses with optimal scheduling.
    ///
    /// `names` is positionally aligned with `system_accesses` and is used to
    /// resolve `hard_deps` (declared by name) back to an index. Returns
    /// `Err(EcsError::CyclicSystemDependency)` if the combined conflict +
    /// hard-dep graph is not a DAG (§4.9.1: cycle detection runs eagerly at
    /// registration).
    pub fn new(system_accesses: Vec<SystemAccess>, names: &[&'static str], model: ExecutionModel) -> Result<Self> {
        let dependency_matrix = Self::build_dependency_matrix(&system_accesses, names)?;

        let stages = match model {
            ExecutionModel::Passive => Vec::new(),
            ExecutionModel::Parallel => Self::build_stages_all_parallel(system_accesses.len()),
            ExecutionModel::Deterministic => Self::build_stages_topological(&system_accesses, &dependency_matrix),
            ExecutionModel::Serial => {
                let layered = Self::build_stages_topological(&system_accesses, &dependency_matrix);
                Self::linearize(layered)
            }
        };

        let critical_path = Self::find_critical_path(&stages, &dependency_matrix);

        Ok(Self { stages, critical_path, dependency_matrix })
    }

    /// §4.9.1 "parallel: every node is a root" — one system per stage, no
    /// dependency edges at all; the executor dispatches every node at once.
    fn build_stages_all_parallel(count: usize) -> Vec<ExecutionStage> {
        (0..count).map(|i| ExecutionStage { system_indices: vec![i], depth: 0 }).collect()
    }

    /// §9 decision: serial stages reuse the deterministic layered
    /// construction, then chain each node to the previous one in emission
    /// order rather than maintaining a separate single-threaded builder.
    fn linearize(layered: Vec<ExecutionStage>) -> Vec<ExecutionStage> {
        let mut out = Vec::new();
        let mut depth = 0;
        for stage in layered {
            for sys_idx in stage.system_indices {
                out.push(ExecutionStage { system_indices: vec![sys_idx], depth });
                depth += 1;
            }
        }
        out
    }

    /// Build bitset matrix representing dependencies between systems: a
    /// conflict edge `i -> j` for `i < j` (arbitrary but consistent tie
    /// break), plus an explicit edge `dep -> system` for every `hard_deps`
    /// entry, resolved by name regardless of registration order.
    fn build_dependency_matrix(accesses: &[SystemAccess], names: &[&'static str]) -> Result<Vec<BitSet>> {
        let count = accesses.len();
        let mut matrix = vec![BitSet::with_capacity(count); count];

        for i in 0..count {
            for j in (i + 1)..count {
                if accesses[i].conflicts_with(&accesses[j]) {
                    matrix[i].set(j);
                }
            }
        }

        for (idx, access) in accesses.iter().enumerate() {
            for dep_name in &access.hard_deps {
                let Some(dep_idx) = names.iter().position(|n| n == dep_name) else { continue };
                if dep_idx != idx {
                    matrix[dep_idx].set(idx);
                }
            }
        }

        Self::check_acyclic(&matrix, names)?;
        Ok(matrix)
    }

    /// Kahn's algorithm over the full matrix (conflicts + hard deps); if
    /// fewer nodes are consumed than exist, a cycle remains — fatal per
    /// §4.9.1.
    fn check_acyclic(matrix: &[BitSet], names: &[&'static str]) -> Result<()> {
        let count = matrix.len();
        let mut in_degree = vec![0usize; count];
        for row in matrix {
            for neighbor in row.ones() {
                in_degree[neighbor] += 1;
            }
        }
        let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for neighbor in matrix[node].ones() {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }
        if visited != count {
            let chain: Vec<&'static str> =
                (0..count).filter(|&i| in_degree[i] > 0).map(|i| names.get(i).copied().unwrap_or("<unknown>")).collect();
            let system = chain.first().copied().unwrap_or("<unknown>");
            return Err(EcsError::CyclicSystemDependency { system, chain });
        }
        Ok(())
    }

    /// Build execution stages using topological sort and graph coloring
    fn build_stages_topological(accesses: &[SystemAccess], dependency_matrix: &[BitSet]) -> Vec<ExecutionStage> {
        let count = accesses.len();
        if count == 0 {
            return vec![];
        }

        let mut in_degree = vec![0; count];
        for matrix_row in dependency_matrix.iter() {
            for neighbor in matrix_row.ones() {
                in_degree[neighbor] += 1;
            }
        }

        let mut depths = vec![0; count];
        let mut queue = VecDeque::new();
        for (idx, &degree) in in_degree.iter().enumerate() {
            if degree == 0 {
                queue.push_back(idx);
            }
        }

        let mut sorted = Vec::with_capacity(count);
        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for neighbor in dependency_matrix[node].ones() {
                in_degree[neighbor] -= 1;
                depths[neighbor] = depths[neighbor].max(depths[node] + 1);
                if in_degree[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        let max_depth = *depths.iter().max().unwrap_or(&0);
        let mut stages = Vec::new();

        for depth in 0..=max_depth {
            let mut stage_systems = Vec::new();
            for &sys_idx in &sorted {
                if depths[sys_idx] == depth {
                    let can_add = stage_systems.iter().all(|&existing: &usize| !accesses[sys_idx].conflicts_with(&accesses[existing]));
                    if can_add {
                        stage_systems.push(sys_idx);
                    }
                }
            }
            if !stage_systems.is_empty() {
                stages.push(ExecutionStage { system_indices: stage_systems, depth });
            }
        }

        Self::optimize_stages(&mut stages, accesses, &sorted, &depths);
        stages
    }

    fn optimize_stages(stages: &mut Vec<ExecutionStage>, accesses: &[SystemAccess], sorted: &[usize], depths: &[usize]) {
        let mut assigned: FxHashSet<usize> = stages.iter().flat_map(|s| s.system_indices.iter().copied()).collect();

        let mut unassigned: Vec<usize> = sorted.iter().copied().filter(|idx| !assigned.contains(idx)).collect();

        while !unassigned.is_empty() {
            let mut next_unassigned = Vec::with_capacity(unassigned.len());

            for &sys_idx in &unassigned {
                let target_depth = depths[sys_idx];
                let mut placed = false;

                for stage in stages.iter_mut().filter(|s| s.depth >= target_depth) {
                    let can_add = stage.system_indices.iter().all(|&existing| !accesses[sys_idx].conflicts_with(&accesses[existing]));
                    if can_add {
                        stage.system_indices.push(sys_idx);
                        assigned.insert(sys_idx);
                        placed = true;
                        break;
                    }
                }

                if !placed {
                    next_unassigned.push(sys_idx);
                }
            }

            if next_unassigned.len() == unassigned.len() && !next_unassigned.is_empty() {
                let sys_idx = next_unassigned.remove(0);
                let new_depth = stages.last().map(|s| s.depth + 1).unwrap_or(0);
                stages.push(ExecutionStage { system_indices: vec![sys_idx], depth: new_depth });
                assigned.insert(sys_idx);
            }

            unassigned = next_unassigned;
        }
    }

    /// Find the critical path (longest dependency chain)
    fn find_critical_path(stages: &[ExecutionStage], dependency_matrix: &[BitSet]) -> Vec<usize> {
        if stages.is_empty() {
            return vec![];
        }

        let mut max_depth_system = 0;
        let mut max_depth = 0;
        for stage in stages {
            if stage.depth > max_depth {
                max_depth = stage.depth;
                if let Some(&first_sys) = stage.system_indices.first() {
                    max_depth_system = first_sys;
                }
            }
        }

        let mut path = vec![max_depth_system];
        let mut current = max_depth_system;

        loop {
            let mut predecessor = None;
            for (i, matrix_row) in dependency_matrix.iter().enumerate() {
                if matrix_row.contains(current) {
                    predecessor = Some(i);
                    break;
                }
            }
            if let Some(pred) = predecessor {
                path.push(pred);
                current = pred;
            } else {
                break;
            }
        }

        path.reverse();
        path
    }

    /// Raw `i -> j` edges (conflict- and hard-dep-derived): row `i` has bit
    /// `j` set iff system `i` must complete before system `j` starts. Used
    /// by `executor.rs` to build the per-node atomic execution graph
    /// (§4.9.4) without re-deriving batch adjacency.
    pub fn edges(&self) -> &[BitSet] {
        &self.dependency_matrix
    }

    /// Get execution stages
    pub fn stages(&self) -> &[ExecutionStage] {
        &self.stages
    }

    /// Get number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Get critical path
    pub fn critical_path(&self) -> &[usize] {
        &self.critical_path
    }

    /// Check if a system is on the critical path
    pub fn is_critical(&self, system_index: usize) -> bool {
        self.critical_path.contains(&system_index)
    }

    /// Print execution plan (for debugging)
    pub fn print_schedule(&self) {
        println!("Execution Schedule ({} stages):", self.stages.len());
        println!("Critical Path: {:?}", self.critical_path);
        println!();

        for (stage_idx, stage) in self.stages.iter().enumerate() {
            println!("  Stage {} (depth {}): {} systems (parallel)", stage_idx + 1, stage.depth, stage.system_indices.len());
            for &sys_idx in &stage.system_indices {
                let marker = if self.is_critical(sys_idx) { " [CRITICAL]" } else { "" };
                println!("    - System {sys_idx}{marker}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_rw<R: 'static, W: 'static>() -> SystemAccess {
        SystemAccess::empty().reads::<R>().writes::<W>()
    }

    #[test]
    fn no_conflicts_parallel() {
        let access1 = SystemAccess::empty().reads::<i32>();
        let access2 = SystemAccess::empty().reads::<f32>();
        let graph = DependencyGraph::new(vec![access1, access2], &["a", "b"], ExecutionModel::Deterministic).unwrap();
        assert_eq!(graph.stage_count(), 1, "Should execute in parallel");
    }

    #[test]
    fn write_conflict_sequential() {
        let access1 = access_rw::<i32, f32>();
        let access2 = SystemAccess::empty().reads::<f32>();
        let graph = DependencyGraph::new(vec![access1, access2], &["a", "b"], ExecutionModel::Deterministic).unwrap();
        assert_eq!(graph.stage_count(), 2, "Should execute sequentially");
    }

    #[test]
    fn hard_dep_orders_independent_systems() {
        let a = SystemAccess::empty().reads::<i32>();
        let b = SystemAccess::empty().reads::<f32>().depends_on("a");
        let graph = DependencyGraph::new(vec![b, a], &["b", "a"], ExecutionModel::Deterministic).unwrap();
        // "a" is index 1 but must still precede "b" at index 0.
        assert_eq!(graph.stage_count(), 2);
        assert!(graph.stages()[0].system_indices.contains(&1));
    }

    #[test]
    fn cyclic_hard_deps_is_rejected() {
        let a = SystemAccess::empty().depends_on("b");
        let b = SystemAccess::empty().depends_on("a");
        let err = DependencyGraph::new(vec![a, b], &["a", "b"], ExecutionModel::Deterministic).unwrap_err();
        assert!(matches!(err, EcsError::CyclicSystemDependency { .. }));
    }

    #[test]
    fn parallel_model_never_serializes() {
        let a = access_rw::<i32, i32>();
        let b = access_rw::<i32, i32>();
        let graph = DependencyGraph::new(vec![a, b], &["a", "b"], ExecutionModel::Parallel).unwrap();
        assert_eq!(graph.stage_count(), 2);
        assert!(graph.stages().iter().all(|s| s.system_indices.len() == 1));
    }

    #[test]
    fn serial_model_is_one_system_per_stage_in_order() {
        let a = SystemAccess::empty().reads::<i32>();
        let b = SystemAccess::empty().reads::<f32>();
        let graph = DependencyGraph::new(vec![a, b], &["a", "b"], ExecutionModel::Serial).unwrap();
        assert_eq!(graph.stage_count(), 2);
        assert_eq!(graph.stages()[0].depth, 0);
        assert_eq!(graph.stages()[1].depth, 1);
    }

    #[test]
    fn passive_model_has_no_stages() {
        let a = SystemAccess::empty().reads::<i32>();
        let graph = DependencyGraph::new(vec![a], &["a"], ExecutionModel::Passive).unwrap();
        assert_eq!(graph.stage_count(), 0);
    }

    #[test]
    fn complex_dependency_graph() {
        let accesses = vec![
            SystemAccess::empty().writes::<i32>(),
            SystemAccess::empty().writes::<f32>(),
            SystemAccess::empty().reads::<i32>().writes::<i64>(),
            SystemAccess::empty().reads::<f32>().writes::<f64>(),
            SystemAccess::empty().reads::<i64>().reads::<f64>(),
        ];
        let graph = DependencyGraph::new(accesses, &["s0", "s1", "s2", "s3", "s4"], ExecutionModel::Deterministic).unwrap();
        assert!(graph.stage_count() <= 3, "Should optimize to 3 or fewer stages");
        let first_stage = &graph.stages()[0];
        assert!(first_stage.system_indices.contains(&0) || first_stage.system_indices.contains(&1));
    }
}
