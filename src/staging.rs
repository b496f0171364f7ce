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

//! Staging Pipeline (component G): per-worker deferred create/add/remove
//! buffers, drained and sorted at the next synchronization (SPEC_FULL §4.7).
//!
//! Grounded on `original_source` `ECS/Forge/EntityCreateBuffer.h` and
//! `EntityCommandBuffer.h` (`CreateTag`/`AppendTag`/`RemoveTag` command
//! shapes, column-of-arrays create buffer) for the per-thread buffer
//! layout; per the design note on thread-local storage (§9), workers are
//! addressed by an explicit [`crate::entity::WorkerId`] rather than
//! language-level TLS, consistent with the entity allocator (component B).

use bumpalo::Bump;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::TypeInfo;
use crate::ids::{hash_type_set, Entity, TypeUuid};

/// One type-set-hash group of the create buffer: a column-of-arrays layout
/// `(entities[], T_0[], T_1[], …)` matching the distilled spec's command-
/// buffer shape (§4.7), backed by plain growable byte vectors rather than a
/// fixed-size ring since Rust has no placement-new-into-preallocated-slot
/// idiom as ergonomic as the original's `EntityCommandBuffer<CreateTag>`.
pub struct CreateGroup {
    pub descriptors: SmallVec<[(TypeUuid, TypeInfo, bool); 8]>,
    pub entities: Vec<Entity>,
    pub columns: Vec<Vec<u8>>,
}

impl CreateGroup {
    fn new(descriptors: &[(TypeUuid, TypeInfo, bool)]) -> Self {
        CreateGroup {
            descriptors: descriptors.iter().copied().collect(),
            entities: Vec::new(),
            columns: descriptors.iter().map(|_| Vec::new()).collect(),
        }
    }

    /// Appends one entity's payload set. `raw_ptrs` must be positionally
    /// aligned with `self.descriptors` (canonical, sorted order).
    fn push(&mut self, entity: Entity, raw_ptrs: &[*const u8]) {
        self.entities.push(entity);
        for (i, &(_, info, _)) in self.descriptors.iter().enumerate() {
            let column = &mut self.columns[i];
            let old_len = column.len();
            if info.size > 0 {
                column.resize(old_len + info.size, 0);
                unsafe {
                    std::ptr::copy_nonoverlapping(raw_ptrs[i], column.as_mut_ptr().add(old_len), info.size);
                }
            }
        }
    }
}

#[derive(Default)]
struct CreateBuffer {
    groups: FxHashMap<u64, CreateGroup>,
}

impl CreateBuffer {
    fn push(&mut self, descriptors: &[(TypeUuid, TypeInfo, bool)], entity: Entity, raw_ptrs: &[*const u8]) {
        let uuids: SmallVec<[TypeUuid; 8]> = descriptors.iter().map(|d| d.0).collect();
        let hash = hash_type_set(&uuids);
        let group = self.groups.entry(hash).or_insert_with(|| CreateGroup::new(descriptors));
        group.push(entity, raw_ptrs);
    }

    fn drain(&mut self) -> FxHashMap<u64, CreateGroup> {
        std::mem::take(&mut self.groups)
    }
}

/// A staged add: `(entity, type, payload)` where the payload lives in the
/// worker's bump arena until the next synchronization drains it (§4.7).
pub struct StagedAdd {
    pub entity: Entity,
    pub type_uuid: TypeUuid,
    pub info: TypeInfo,
    pub payload: *mut u8,
}

/// A staged remove: `(entity, type)`.
#[derive(Clone, Copy)]
pub struct StagedRemove {
    pub entity: Entity,
    pub type_uuid: TypeUuid,
}

// SAFETY: `payload` points into this worker's own `Bump` arena, which
// outlives the `StagedAdd` and is never touched by another thread before
// the single-threaded synchronization phase drains it (§5 "staging buffers
// are partitioned by thread and so require no cross-thread locks").
unsafe impl Send for StagedAdd {}

#[derive(Default)]
struct AddRemoveBuffer {
    adds: Vec<StagedAdd>,
    removes: Vec<StagedRemove>,
}

/// One worker's full set of deferred buffers: creates, adds/removes, and
/// the bump arena backing add payloads.
#[derive(Default)]
struct WorkerStaging {
    creates: CreateBuffer,
    add_remove: AddRemoveBuffer,
    arena: Bump,
}

/// Per-thread staging buffers for every worker slot (component G). Indexed
/// identically to [`crate::entity::EntityAllocator`]'s worker slices so
/// application code and the thread pool address the same worker by the
/// same [`crate::entity::WorkerId`].
pub struct StagingPipeline {
    workers: Vec<Mutex<WorkerStaging>>,
}

impl StagingPipeline {
    pub fn new(worker_count: usize) -> Self {
        StagingPipeline { workers: (0..=worker_count).map(|_| Mutex::new(WorkerStaging::default())).collect() }
    }

    /// Stages a brand-new entity's full component payload. `descriptors`
    /// and `raw_ptrs` must already be in canonical (sorted) order.
    pub fn stage_create(&self, worker: usize, descriptors: &[(TypeUuid, TypeInfo, bool)], entity: Entity, raw_ptrs: &[*const u8]) {
        self.workers[worker].lock().creates.push(descriptors, entity, raw_ptrs);
    }

    /// Stages an add of `(entity, type)` with a payload move-constructed
    /// into this worker's bump arena.
    pub fn stage_add(&self, worker: usize, entity: Entity, type_uuid: TypeUuid, info: TypeInfo, value_ptr: *const u8) {
        let mut staging = self.workers[worker].lock();
        let payload = if info.size > 0 {
            let layout = std::alloc::Layout::from_size_align(info.size, info.align).unwrap();
            let dst = staging.arena.alloc_layout(layout).as_ptr();
            unsafe { (info.move_construct)(dst, value_ptr as *mut u8, 1) };
            dst
        } else {
            std::ptr::NonNull::dangling().as_ptr()
        };
        staging.add_remove.adds.push(StagedAdd { entity, type_uuid, info, payload });
    }

    pub fn stage_remove(&self, worker: usize, entity: Entity, type_uuid: TypeUuid) {
        self.workers[worker].lock().add_remove.removes.push(StagedRemove { entity, type_uuid });
    }

    /// Drains every worker's create groups, merged by type-set hash (groups
    /// that two workers both produced for the same hash are concatenated so
    /// the commit path resolves the destination archetype once per hash,
    /// not once per worker).
    pub fn drain_creates(&self) -> FxHashMap<u64, CreateGroup> {
        let mut merged: FxHashMap<u64, CreateGroup> = FxHashMap::default();
        for worker in &self.workers {
            let groups = worker.lock().creates.drain();
            for (hash, group) in groups {
                match merged.get_mut(&hash) {
                    Some(existing) => {
                        existing.entities.extend_from_slice(&group.entities);
                        for (dst, src) in existing.columns.iter_mut().zip(group.columns) {
                            dst.extend_from_slice(&src);
                        }
                    }
                    None => {
                        merged.insert(hash, group);
                    }
                }
            }
        }
        merged
    }

    /// §4.8 step 2: gather every worker's add/remove vectors into two
    /// global vectors, sorted by `(entity, type)` ascending. The bump
    /// arenas backing the add payloads are reset only after the caller has
    /// finished consuming the returned adds (§4.8 step 7), so the arenas
    /// are returned too and must be kept alive by the caller until commit
    /// completes.
    pub fn drain_add_remove(&self) -> (Vec<StagedAdd>, Vec<StagedRemove>, Vec<Bump>) {
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        let mut arenas = Vec::new();
        for worker in &self.workers {
            let mut staging = worker.lock();
            adds.append(&mut staging.add_remove.adds);
            removes.append(&mut staging.add_remove.removes);
            arenas.push(std::mem::take(&mut staging.arena));
        }
        adds.sort_by_key(|a| (a.entity, a.type_uuid));
        removes.sort_by_key(|r| (r.entity, r.type_uuid));
        (adds, removes, arenas)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::ids::ComponentKind;

    struct Position;
    impl Component for Position {}

    fn uuid(slot: u16) -> TypeUuid {
        TypeUuid::new(ComponentKind(1), slot)
    }

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Pos {
        x: f32,
    }

    #[test]
    fn stage_create_groups_by_type_set_hash() {
        let pipeline = StagingPipeline::new(0);
        let descriptors = [(uuid(1), TypeInfo::of::<Pos>(), false)];
        let value = Pos { x: 1.0 };
        let ptr = &value as *const Pos as *const u8;
        pipeline.stage_create(0, &descriptors, Entity::new(1, 0), &[ptr]);
        std::mem::forget(value);
        let groups = pipeline.drain_creates();
        assert_eq!(groups.len(), 1);
        let group = groups.values().next().unwrap();
        assert_eq!(group.entities.len(), 1);
        assert_eq!(group.columns[0].len(), std::mem::size_of::<Pos>());
    }

    #[test]
    fn drain_creates_is_empty_after_first_drain() {
        let pipeline = StagingPipeline::new(0);
        let descriptors = [(uuid(1), TypeInfo::of::<Pos>(), false)];
        let value = Pos { x: 1.0 };
        pipeline.stage_create(0, &descriptors, Entity::new(1, 0), &[&value as *const Pos as *const u8]);
        std::mem::forget(value);
        pipeline.drain_creates();
        assert!(pipeline.drain_creates().is_empty());
    }

    #[test]
    fn add_remove_sorted_by_entity_then_type() {
        let pipeline = StagingPipeline::new(0);
        let t1 = uuid(1);
        let t2 = uuid(2);
        let e1 = Entity::new(5, 0);
        let e2 = Entity::new(2, 0);
        let v = Pos { x: 0.0 };
        let ptr = &v as *const Pos as *const u8;
        pipeline.stage_add(0, e1, t2, TypeInfo::of::<Pos>(), ptr);
        pipeline.stage_add(0, e2, t1, TypeInfo::of::<Pos>(), ptr);
        pipeline.stage_add(0, e1, t1, TypeInfo::of::<Pos>(), ptr);
        let (adds, _removes, _arenas) = pipeline.drain_add_remove();
        let keys: Vec<(Entity, TypeUuid)> = adds.iter().map(|a| (a.entity, a.type_uuid)).collect();
        assert_eq!(keys, vec![(e2, t1), (e1, t1), (e1, t2)]);
    }

    #[test]
    fn multiple_workers_merge_into_one_create_group() {
        let pipeline = StagingPipeline::new(1);
        let descriptors = [(uuid(1), TypeInfo::of::<Pos>(), false)];
        let v0 = Pos { x: 0.0 };
        let v1 = Pos { x: 1.0 };
        pipeline.stage_create(0, &descriptors, Entity::new(1, 0), &[&v0 as *const Pos as *const u8]);
        pipeline.stage_create(1, &descriptors, Entity::new(2, 0), &[&v1 as *const Pos as *const u8]);
        std::mem::forget(v0);
        std::mem::forget(v1);
        let groups = pipeline.drain_creates();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.values().next().unwrap().entities.len(), 2);
    }
}
