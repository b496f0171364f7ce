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

//! Entity Allocator (component B): generational entity ids with per-thread
//! slice allocation and recycling.
//!
//! Grounded on `original_source` `ECS/Entity/EntityRegistry.h`
//! (`EntityCreator`, `defaultEntityCapacity`, `threadLocalEntityCapacity`,
//! `getLiveGeneration`). Per the design note on thread-local storage (§9),
//! workers are addressed by an explicit [`WorkerId`] handed to each caller
//! rather than relying on Rust's own `thread_local!`.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::ids::Entity;

/// Identifies a caller's worker slot: `WorkerId(0)` is reserved for the
/// thread that owns the `World` outside of a dispatched system (setup code,
/// or calls made between `run()` invocations); `WorkerId(n)` for `n >= 1`
/// identifies thread-pool worker `n - 1`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WorkerId(pub usize);

impl WorkerId {
    pub const MAIN: WorkerId = WorkerId(0);
}

struct WorkerSlice {
    next_id: u32,
    cap_id: u32,
    recycle: SmallVec<[u32; 32]>,
    pending_deletes: Vec<Entity>,
}

impl WorkerSlice {
    fn empty() -> Self {
        WorkerSlice {
            next_id: 0,
            cap_id: 0,
            recycle: SmallVec::new(),
            pending_deletes: Vec::new(),
        }
    }
}

pub struct EntityAllocator {
    shared_next: AtomicU32,
    thread_local_capacity: u32,
    generations: RwLock<Vec<u8>>,
    workers: Vec<Mutex<WorkerSlice>>,
}

impl EntityAllocator {
    pub fn new(initial_entity_capacity: u32, thread_local_slice: u32, worker_count: usize) -> Self {
        let mut generations = vec![0u8; initial_entity_capacity.max(1) as usize];
        // index 0 is the null entity; never handed out by create().
        if generations.is_empty() {
            generations.push(0);
        }
        EntityAllocator {
            shared_next: AtomicU32::new(1),
            thread_local_capacity: thread_local_slice.max(1),
            generations: RwLock::new(generations),
            workers: (0..=worker_count).map(|_| Mutex::new(WorkerSlice::empty())).collect(),
        }
    }

    fn ensure_capacity(&self, index: u32) {
        let needed = index as usize + 1;
        if self.generations.read().len() >= needed {
            return;
        }
        let mut gens = self.generations.write();
        if gens.len() < needed {
            gens.resize(needed, 0);
        }
    }

    /// Hands out a fresh or recycled entity id for `worker`.
    pub fn create(&self, worker: WorkerId) -> Entity {
        let mut slice = self.workers[worker.0].lock();

        if let Some(index) = slice.recycle.pop() {
            let generation = *self.generations.read().get(index as usize).unwrap_or(&0);
            return Entity::new(index, generation);
        }

        if slice.next_id >= slice.cap_id {
            let start = self
                .shared_next
                .fetch_add(self.thread_local_capacity, Ordering::Relaxed);
            slice.next_id = start;
            slice.cap_id = start + self.thread_local_capacity;
        }

        let index = slice.next_id;
        slice.next_id += 1;
        self.ensure_capacity(index);
        Entity::new(index, 0)
    }

    /// Appends `entity` to `worker`'s thread-local deletion buffer. Actual
    /// removal happens at the next [`EntityAllocator::drain_pending_deletes`].
    pub fn delete(&self, worker: WorkerId, entity: Entity) {
        self.workers[worker.0].lock().pending_deletes.push(entity);
    }

    /// Current generation for `entity`'s index. Returns `255` for an
    /// out-of-bounds index (SPEC_FULL §4.2.1), matching the original's
    /// bound-checked `getLiveGeneration`.
    pub fn live_generation(&self, entity: Entity) -> u8 {
        self.generations
            .read()
            .get(entity.index() as usize)
            .copied()
            .unwrap_or(255)
    }

    /// Whether `entity`'s generation matches the slot's current generation.
    pub fn is_live(&self, entity: Entity) -> bool {
        self.live_generation(entity) == entity.generation()
    }

    /// Merges every worker's pending-delete buffer into one vector,
    /// filtering out stale handles (silently, per §7), and clears the
    /// per-worker buffers. Does **not** bump generations yet — callers
    /// (primary/secondary/boolean storage) must run their per-entity delete
    /// path against the returned handles before calling
    /// [`EntityAllocator::commit_deletions`], matching the commit order of
    /// §4.8 step 6.
    pub fn drain_pending_deletes(&self) -> Vec<Entity> {
        let mut merged = Vec::new();
        for worker in &self.workers {
            let mut slice = worker.lock();
            merged.append(&mut slice.pending_deletes);
        }
        merged.retain(|e| self.is_live(*e));
        merged.sort_by_key(|e| e.index());
        merged.dedup_by_key(|e| e.index());
        merged
    }

    /// Bumps the generation of every entity in `deleted` (wrapping 255 to
    /// 0) and distributes the recycled indices round-robin across worker
    /// recycle stacks.
    pub fn commit_deletions(&self, deleted: &[Entity]) {
        if deleted.is_empty() {
            return;
        }
        let mut gens = self.generations.write();
        for (i, entity) in deleted.iter().enumerate() {
            let index = entity.index() as usize;
            if index >= gens.len() {
                continue;
            }
            gens[index] = entity.generation().wrapping_add(1);
            let worker = i % self.workers.len();
            self.workers[worker].lock().recycle.push(entity.index());
        }
    }

    pub fn entity_limit(&self) -> usize {
        self.generations.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_hands_out_increasing_indices() {
        let alloc = EntityAllocator::new(64, 8, 0);
        let a = alloc.create(WorkerId::MAIN);
        let b = alloc.create(WorkerId::MAIN);
        assert_ne!(a.index(), b.index());
        assert_eq!(a.generation(), 0);
    }

    #[test]
    fn never_hands_out_null_index() {
        let alloc = EntityAllocator::new(64, 8, 0);
        let e = alloc.create(WorkerId::MAIN);
        assert_ne!(e.index(), 0);
    }

    #[test]
    fn delete_then_sync_bumps_generation_and_recycles() {
        let alloc = EntityAllocator::new(64, 8, 0);
        let e = alloc.create(WorkerId::MAIN);
        alloc.delete(WorkerId::MAIN, e);

        let deleted = alloc.drain_pending_deletes();
        assert_eq!(deleted.len(), 1);
        assert!(alloc.is_live(e)); // not yet committed

        alloc.commit_deletions(&deleted);
        assert!(!alloc.is_live(e));
        assert_eq!(alloc.live_generation(e), e.generation().wrapping_add(1));

        let recycled = alloc.create(WorkerId::MAIN);
        assert_eq!(recycled.index(), e.index());
        assert_eq!(recycled.generation(), e.generation().wrapping_add(1));
    }

    #[test]
    fn stale_delete_is_silently_ignored() {
        let alloc = EntityAllocator::new(64, 8, 0);
        let e = alloc.create(WorkerId::MAIN);
        let stale = Entity::new(e.index(), e.generation().wrapping_add(5));
        alloc.delete(WorkerId::MAIN, stale);
        let deleted = alloc.drain_pending_deletes();
        assert!(deleted.is_empty());
    }

    #[test]
    fn generation_wraps_past_255() {
        let alloc = EntityAllocator::new(64, 8, 0);
        let e = alloc.create(WorkerId::MAIN);
        let near_max = Entity::new(e.index(), 255);
        // simulate the slot already being at generation 255
        alloc.commit_deletions(&[near_max]);
        assert_eq!(alloc.live_generation(e), 0);
    }

    #[test]
    fn out_of_bounds_index_reports_generation_255() {
        let alloc = EntityAllocator::new(4, 8, 0);
        let far = Entity::new(1_000_000, 0);
        assert_eq!(alloc.live_generation(far), 255);
    }

    #[test]
    fn multiple_workers_do_not_collide_on_indices() {
        let alloc = EntityAllocator::new(64, 4, 2);
        let a = alloc.create(WorkerId(0));
        let b = alloc.create(WorkerId(1));
        let c = alloc.create(WorkerId(2));
        let mut indices = vec![a.index(), b.index(), c.index()];
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 3);
    }
}
