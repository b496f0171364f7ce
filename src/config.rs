// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! World configuration (SPEC_FULL §6.3): a plain builder struct, no
//! external config-file format, matching the teacher's `with_*`-setter
//! convention already used in `schedule.rs`/`archetype.rs`.

use crate::archetype::{DEFAULT_MAX_CHUNKS, DEFAULT_STARTING_CAPACITY};

/// Construction-time options for a [`crate::world::World`].
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Size of the initial per-kind metadata arrays and entity-ID range.
    pub initial_entity_capacity: u32,
    /// How many entity ids each worker reserves per refill.
    pub thread_local_entity_slice: u32,
    /// Number of chunks per archetype.
    pub archetype_chunk_max: usize,
    /// Initial rows per chunk.
    pub archetype_starting_capacity: usize,
    /// Worker count for the thread pool backing deterministic/parallel stages.
    pub thread_pool_workers: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            initial_entity_capacity: 1024,
            thread_local_entity_slice: 256,
            archetype_chunk_max: DEFAULT_MAX_CHUNKS,
            archetype_starting_capacity: DEFAULT_STARTING_CAPACITY,
            thread_pool_workers: num_cpus_hint(),
        }
    }
}

impl WorldConfig {
    pub fn with_initial_entity_capacity(mut self, capacity: u32) -> Self {
        self.initial_entity_capacity = capacity;
        self
    }

    pub fn with_thread_local_entity_slice(mut self, slice: u32) -> Self {
        self.thread_local_entity_slice = slice;
        self
    }

    pub fn with_archetype_chunk_max(mut self, max: usize) -> Self {
        self.archetype_chunk_max = max;
        self
    }

    pub fn with_archetype_starting_capacity(mut self, capacity: usize) -> Self {
        self.archetype_starting_capacity = capacity;
        self
    }

    pub fn with_thread_pool_workers(mut self, workers: usize) -> Self {
        self.thread_pool_workers = workers;
        self
    }
}

/// A conservative, dependency-free worker-count default. The real pool size
/// is whatever `rayon`'s global pool reports when the `parallel` feature is
/// enabled; this is only the fallback used to size the allocator's
/// per-worker slice table before the pool is known.
fn num_cpus_hint() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
