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

//! World: wires the type registry, entity allocator, primary archetype
//! storage, archetype graph, secondary storage, boolean tag storage, staging
//! pipeline and system scheduler into the single `World::end_frame`
//! synchronization pipeline (SPEC_FULL §4.8, §6.1).
//!
//! Grounded on the teacher's `world.rs` central-storage role (its
//! `AHashMap<ArchetypeSignature, usize>` archetype index, `flush_removals`
//! deferred-removal queue, resource map) generalized from a single flat
//! archetype table into the distilled spec's four-storage-kind model; the
//! eight-step commit order itself follows `original_source`
//! `ECS/Entity/Entity.cpp`'s `addEntities`/`removeEntity`/`moveEntity`
//! synchronization walk.

use std::alloc::Layout;
use std::ptr::NonNull;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::archetype::Archetype;
use crate::component::{Bundle, Component, TypeInfo};
use crate::config::WorldConfig;
use crate::entity::{EntityAllocator, WorkerId};
use crate::error::{EcsError, Result};
use crate::graph::{ArchetypeGraph, ROOT};
use crate::ids::{fold_transition, ComponentKind, Entity, TypeUuid};
use crate::parallel::{default_pool, JobPool};
use crate::registry::TypeRegistry;
use crate::schedule::Stage;
use crate::schedule::StageRegistry;
use crate::secondary::SecondaryStorage;
use crate::staging::StagingPipeline;
use crate::system::BoxedSystem;
use crate::tags::TagStorage;
use crate::time::Time;

/// Marker types used only to mint stable, process-wide [`ComponentKind`]s
/// for the primary/secondary/boolean storages (§4.1's "kind 1, 2, … on
/// first call"); every [`World`] resolves to the same three kinds since
/// [`TypeRegistry::global`] is a process-wide singleton.
struct PrimaryMarker;
struct SecondaryMarker;
struct BooleanMarker;

/// An entity's residency in primary storage: which archetype, which chunk,
/// which row (§3.2).
#[derive(Clone, Copy)]
struct PrimaryLocation {
    archetype: usize,
    chunk: usize,
    row: usize,
}

fn ensure_len<T: Clone>(vec: &mut Vec<T>, index: usize, fill: T) {
    if vec.len() <= index {
        vec.resize(index + 1, fill);
    }
}

/// The central ECS world (SPEC_FULL §6.1): owns every storage kind, the
/// staging pipeline, and the stage registry, and is the synchronization
/// point between them.
///
/// Almost every public method takes `&self`: structural operations
/// (`create_entity`/`add`/`remove`/`delete_entity`) only ever append to a
/// per-worker staging buffer, and queries only ever read storage that is
/// never mutated concurrently with system execution (§5). The one
/// exception in spirit is [`World::end_frame`], which *does* mutate
/// storage, but it still takes `&self` — its exclusivity comes from the
/// scheduling contract ("archetype storages are mutated only during
/// synchronization, a single-threaded phase relative to the scheduler"),
/// not from the borrow checker, so its internals reach for write locks.
pub struct World {
    primary_kind: ComponentKind,
    secondary_kind: ComponentKind,
    boolean_kind: ComponentKind,

    allocator: EntityAllocator,
    pub(crate) graph: RwLock<ArchetypeGraph>,
    locations: RwLock<Vec<Option<PrimaryLocation>>>,
    secondary: RwLock<SecondaryStorage>,
    tags: RwLock<TagStorage>,
    tracked_types: RwLock<FxHashSet<TypeUuid>>,
    tag_slot_table: RwLock<Vec<TypeUuid>>,

    staging: StagingPipeline,
    stages: Mutex<StageRegistry>,
    time: Mutex<Time>,
    pool: Box<dyn JobPool>,

    worker_count: usize,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        let registry = TypeRegistry::global();
        let primary_kind = registry.kind_of::<PrimaryMarker>();
        let secondary_kind = registry.kind_of::<SecondaryMarker>();
        let boolean_kind = registry.kind_of::<BooleanMarker>();
        let worker_count = config.thread_pool_workers.max(1);

        World {
            primary_kind,
            secondary_kind,
            boolean_kind,
            allocator: EntityAllocator::new(config.initial_entity_capacity, config.thread_local_entity_slice, worker_count),
            graph: RwLock::new(ArchetypeGraph::new(config.archetype_chunk_max.max(1), config.archetype_starting_capacity.max(1))),
            locations: RwLock::new(Vec::new()),
            secondary: RwLock::new(SecondaryStorage::new(config.archetype_chunk_max.max(1), config.archetype_starting_capacity.max(1))),
            tags: RwLock::new(TagStorage::new()),
            tracked_types: RwLock::new(FxHashSet::default()),
            tag_slot_table: RwLock::new(Vec::new()),
            staging: StagingPipeline::new(worker_count),
            stages: Mutex::new(StageRegistry::new()),
            time: Mutex::new(Time::new()),
            pool: default_pool(),
            worker_count,
        }
    }

    pub(crate) fn primary_kind(&self) -> ComponentKind {
        self.primary_kind
    }

    /// Resolves the caller's [`WorkerId`]: pool worker threads are
    /// addressed by their rayon thread index (offset by one so worker 0 is
    /// reserved for the thread that owns the `World`, per
    /// [`crate::entity::WorkerId`]'s doc comment); any other thread — the
    /// owning thread itself, or a non-pool caller — resolves to `MAIN`.
    fn resolve_worker(&self) -> WorkerId {
        #[cfg(feature = "parallel")]
        {
            if let Some(idx) = rayon::current_thread_index() {
                return WorkerId((idx % self.worker_count) + 1);
            }
        }
        WorkerId::MAIN
    }

    fn is_tracked(&self, type_uuid: TypeUuid) -> bool {
        self.tracked_types.read().contains(&type_uuid)
    }

    /// Declares `T` as a tracked component (§3.3, §4.3.6): writes to this
    /// type's column will set per-row change bits, cleared at frame-end.
    /// Must be called before the first entity carrying `T` is created, to
    /// match the chosen archetype's column metadata.
    pub fn mark_tracked<T: Component>(&self) {
        let type_uuid = TypeRegistry::global().index_of::<T>(self.primary_kind);
        self.tracked_types.write().insert(type_uuid);
    }

    pub fn is_live(&self, entity: Entity) -> bool {
        self.allocator.is_live(entity)
    }

    pub(crate) fn primary_location(&self, entity: Entity) -> Option<(usize, usize, usize)> {
        self.locations
            .read()
            .get(entity.index() as usize)
            .copied()
            .flatten()
            .map(|l| (l.archetype, l.chunk, l.row))
    }

    // ---- Primary storage: create / add / remove / delete (§4.3, §4.7) ----

    /// Stages a brand-new entity with the given component bundle. The
    /// entity is live immediately (its id is valid and its generation is
    /// assigned), but its components are not observable by queries until
    /// the next [`World::end_frame`] (§4.7).
    pub fn create_entity<B: Bundle>(&self, bundle: B) -> Entity {
        let worker = self.resolve_worker();
        let entity = self.allocator.create(worker);
        self.stage_create(worker, entity, bundle);
        entity
    }

    fn stage_create<B: Bundle>(&self, worker: WorkerId, entity: Entity, bundle: B) {
        let type_ids = B::type_ids();
        let infos = B::type_infos();
        let registry = TypeRegistry::global();
        let n = type_ids.len();

        let mut allocs: SmallVec<[(Layout, *mut u8); 8]> = SmallVec::new();
        let mut ptrs_decl: SmallVec<[*mut u8; 8]> = SmallVec::new();
        for info in &infos {
            let layout = Layout::from_size_align(info.size.max(1), info.align).unwrap();
            let ptr = if info.size == 0 {
                NonNull::dangling().as_ptr()
            } else {
                let raw = unsafe { std::alloc::alloc(layout) };
                if raw.is_null() {
                    std::alloc::handle_alloc_error(layout);
                }
                raw
            };
            allocs.push((layout, ptr));
            ptrs_decl.push(ptr);
        }
        unsafe { bundle.write_components(&ptrs_decl) };

        let mut combined: SmallVec<[(TypeUuid, TypeInfo, bool, *const u8); 8]> = SmallVec::new();
        for i in 0..n {
            let type_uuid = registry.index_of_type_id(type_ids[i], self.primary_kind);
            let tracked = self.is_tracked(type_uuid);
            combined.push((type_uuid, infos[i], tracked, ptrs_decl[i] as *const u8));
        }
        combined.sort_by_key(|c| c.0);

        let descriptors: SmallVec<[(TypeUuid, TypeInfo, bool); 8]> = combined.iter().map(|c| (c.0, c.1, c.2)).collect();
        let raw_ptrs: SmallVec<[*const u8; 8]> = combined.iter().map(|c| c.3).collect();
        self.staging.stage_create(worker.0, &descriptors, entity, &raw_ptrs);

        // The bytes were bitwise-copied into the staging buffer; only the
        // backing allocation is ours to free, not the logical value (no
        // destructor runs here — ownership moved into the staged payload).
        for (layout, ptr) in allocs {
            if layout.size() > 0 {
                unsafe { std::alloc::dealloc(ptr, layout) };
            }
        }
    }

    /// Stages an add of `T` onto `entity` (§4.7). A stale `entity` handle
    /// is a silent no-op (§7).
    pub fn add<T: Component>(&self, entity: Entity, value: T) {
        if !self.allocator.is_live(entity) {
            return;
        }
        let worker = self.resolve_worker();
        let type_uuid = TypeRegistry::global().index_of::<T>(self.primary_kind);
        let info = TypeInfo::of::<T>();
        let value = std::mem::ManuallyDrop::new(value);
        self.staging.stage_add(worker.0, entity, type_uuid, info, (&*value) as *const T as *const u8);
    }

    /// Stages a remove of `T` from `entity` (§4.7). A stale `entity` or one
    /// that never had `T` is a silent no-op, resolved at synchronization.
    pub fn remove<T: Component>(&self, entity: Entity) {
        if !self.allocator.is_live(entity) {
            return;
        }
        let worker = self.resolve_worker();
        let type_uuid = TypeRegistry::global().index_of::<T>(self.primary_kind);
        self.staging.stage_remove(worker.0, entity, type_uuid);
    }

    /// Stages `entity`'s deletion (§4.2, §4.7). Takes effect for every
    /// storage kind at the next [`World::end_frame`].
    pub fn delete_entity(&self, entity: Entity) {
        let worker = self.resolve_worker();
        self.allocator.delete(worker, entity);
    }

    // ---- Secondary sparse storage (§4.5): applied immediately, not staged ----

    pub fn add_secondary<T: Component>(&self, entity: Entity, value: T) {
        if !self.allocator.is_live(entity) {
            return;
        }
        let type_uuid = TypeRegistry::global().index_of::<T>(self.secondary_kind);
        let info = TypeInfo::of::<T>();
        let value = std::mem::ManuallyDrop::new(value);
        self.secondary.write().add(entity, type_uuid, info, (&*value) as *const T as *const u8);
    }

    pub fn remove_secondary<T: Component>(&self, entity: Entity) {
        let type_uuid = TypeRegistry::global().index_of::<T>(self.secondary_kind);
        self.secondary.write().remove(entity, type_uuid);
    }

    pub fn has_secondary<T: Component>(&self, entity: Entity) -> bool {
        let type_uuid = TypeRegistry::global().index_of::<T>(self.secondary_kind);
        self.secondary.read().has(entity, type_uuid)
    }

    /// Reads a secondary component by value through a closure, since the
    /// underlying storage is behind a read lock that cannot outlive this
    /// call.
    pub fn with_secondary<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&T) -> R) -> Option<R> {
        let type_uuid = TypeRegistry::global().index_of::<T>(self.secondary_kind);
        let guard = self.secondary.read();
        unsafe { guard.get::<T>(entity, type_uuid) }.map(f)
    }

    // ---- Boolean tag storage (§4.6): applied immediately, not staged ----

    fn register_tag_slot(&self, type_uuid: TypeUuid) {
        let slot = type_uuid.slot() as usize;
        let mut table = self.tag_slot_table.write();
        ensure_len(&mut table, slot, TypeUuid::NULL);
        table[slot] = type_uuid;
    }

    fn tag_type_for_slot(&self, slot: u16) -> Option<TypeUuid> {
        self.tag_slot_table.read().get(slot as usize).copied().filter(|t| !t.is_null())
    }

    pub fn add_tag<Tag: Component>(&self, entity: Entity) {
        if !self.allocator.is_live(entity) {
            return;
        }
        let type_uuid = TypeRegistry::global().index_of::<Tag>(self.boolean_kind);
        self.register_tag_slot(type_uuid);
        self.tags.write().add(entity, type_uuid.slot(), type_uuid);
    }

    pub fn remove_tag<Tag: Component>(&self, entity: Entity) {
        let type_uuid = TypeRegistry::global().index_of::<Tag>(self.boolean_kind);
        self.tags.write().remove(entity, type_uuid.slot(), type_uuid);
    }

    pub fn has_tag<Tag: Component>(&self, entity: Entity) -> bool {
        let type_uuid = TypeRegistry::global().index_of::<Tag>(self.boolean_kind);
        self.tags.read().has(entity, type_uuid.slot())
    }

    /// Declares `Tag` as iterable (§3.6): maintains a dense population
    /// bitset so [`World::iter_tag`] is O(population) rather than
    /// unsupported. Must be called before relying on `iter_tag` for `Tag`.
    pub fn declare_iterable_tag<Tag: Component>(&self) {
        let type_uuid = TypeRegistry::global().index_of::<Tag>(self.boolean_kind);
        self.register_tag_slot(type_uuid);
        self.tags.write().declare_iterable(type_uuid);
    }

    /// Every live entity currently carrying `Tag`, resolved against the
    /// entity allocator's current generation for each index (§4.6).
    pub fn iter_tag<Tag: Component>(&self) -> Vec<Entity> {
        let type_uuid = TypeRegistry::global().index_of::<Tag>(self.boolean_kind);
        let tags = self.tags.read();
        tags.iter_members(type_uuid)
            .map(|index| Entity::new(index, self.allocator.live_generation(Entity::new(index, 0))))
            .collect()
    }

    // ---- System scheduler (§4.9) ----

    pub fn register_stage(&self, stage: Stage) -> Result<()> {
        self.stages.lock().register_stage(stage)
    }

    pub fn register_system(&self, stage_name: &str, system: BoxedSystem) -> Result<()> {
        self.stages.lock().register_system(stage_name, system)
    }

    pub fn run_stage(&self, name: &str) -> Result<()> {
        self.stages.lock().run_stage(name, self, self.pool.as_ref())
    }

    /// Advances the world clock, runs every `per_frame` and `fixed_hz`
    /// stage, then synchronizes staged structural changes (§4.8, §4.9.5).
    pub fn run(&self) -> Result<()> {
        let dt = {
            let mut time = self.time.lock();
            time.update();
            time.delta_seconds() as f64
        };
        {
            let mut stages = self.stages.lock();
            stages.run_per_frame(self, self.pool.as_ref())?;
            stages.tick_fixed_hz(dt, self, self.pool.as_ref())?;
        }
        self.end_frame()
    }

    pub fn time(&self) -> Time {
        self.time.lock().clone()
    }

    // ---- Synchronization (§4.8) ----

    /// The eight-step synchronization/commit pipeline: drains every staged
    /// structural change and every pending deletion, then clears tracked
    /// change bitsets. The only phase that mutates archetype storage; never
    /// runs concurrently with stage execution (§5).
    pub fn end_frame(&self) -> Result<()> {
        let mut graph = self.graph.write();
        let mut locations = self.locations.write();

        // Step 8 (run first): clear whatever tracked change bits survived
        // from the previous synchronization, so that only writes made since
        // then — by systems during this frame's stage execution, and by the
        // structural commit below — are visible as "changed" until the next
        // call clears them in turn.
        for archetype in graph.iter_mut() {
            if archetype.any_enabled_changes() {
                archetype.clear_tracked_changes();
            }
        }

        // Step 1: drain creates, grouped by destination archetype hash.
        let creates = self.staging.drain_creates();
        for group in creates.into_values() {
            if group.entities.is_empty() {
                continue;
            }
            let dst_idx = graph.resolve_new(&group.descriptors);
            let count = group.entities.len();
            let dst = graph.get_mut(dst_idx);
            let (chunk_idx, first_row) = dst.reserve_rows(count);
            dst.write_entities_bulk(chunk_idx, first_row, &group.entities);
            for (i, &(type_uuid, _info, _tracked)) in group.descriptors.iter().enumerate() {
                let col_bytes = &group.columns[i];
                if col_bytes.is_empty() {
                    continue;
                }
                let col_idx = dst.column_index(type_uuid).expect("descriptor present in its own archetype");
                dst.write_column_bulk(chunk_idx, col_idx, first_row, count, col_bytes.as_ptr());
            }
            for (i, &entity) in group.entities.iter().enumerate() {
                let row = first_row + i;
                ensure_len(&mut locations, entity.index() as usize, None);
                locations[entity.index() as usize] = Some(PrimaryLocation { archetype: dst_idx, chunk: chunk_idx, row });
            }
        }

        // Step 2: merge and sort staged adds/removes by (entity, type).
        let (adds, removes, _arenas) = self.staging.drain_add_remove();

        // Step 3: coalesce per-entity, resolving each entity's destination
        // archetype via the fold of its add/remove sets against its current
        // type list.
        struct Pending {
            entity: Entity,
            src: Option<usize>,
            dst: usize,
            add_ptrs: SmallVec<[(TypeUuid, *const u8); 8]>,
        }

        let mut pending: Vec<Pending> = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        while i < adds.len() || j < removes.len() {
            let next_entity = match (adds.get(i), removes.get(j)) {
                (Some(a), Some(r)) => a.entity.min(r.entity),
                (Some(a), None) => a.entity,
                (None, Some(r)) => r.entity,
                (None, None) => unreachable!(),
            };
            if next_entity.is_null() {
                return Err(EcsError::NullEntityOperation);
            }

            let add_start = i;
            while i < adds.len() && adds[i].entity == next_entity {
                i += 1;
            }
            let remove_start = j;
            while j < removes.len() && removes[j].entity == next_entity {
                j += 1;
            }
            let entity_adds = &adds[add_start..i];
            let entity_removes = &removes[remove_start..j];

            if !self.allocator.is_live(next_entity) {
                continue;
            }

            let index = next_entity.index() as usize;
            let src_loc = locations.get(index).copied().flatten();
            let src_archetype_idx = src_loc.map(|l| l.archetype);
            let src_sorted_types: SmallVec<[TypeUuid; 8]> = match src_archetype_idx {
                Some(idx) => graph.get(idx).descriptors().iter().map(|d| d.type_uuid).collect(),
                None => SmallVec::new(),
            };

            let adds_sorted_types: SmallVec<[TypeUuid; 8]> = entity_adds.iter().map(|a| a.type_uuid).collect();
            let removes_sorted_types: SmallVec<[TypeUuid; 8]> = entity_removes.iter().map(|r| r.type_uuid).collect();
            let (add_hash, remove_hash) = fold_transition(&src_sorted_types, &adds_sorted_types, &removes_sorted_types);

            let adds_payload: SmallVec<[(TypeUuid, TypeInfo, bool); 8]> =
                entity_adds.iter().map(|a| (a.type_uuid, a.info, self.is_tracked(a.type_uuid))).collect();

            let dst_idx = graph.resolve(
                src_archetype_idx.unwrap_or(ROOT),
                &adds_payload,
                &removes_sorted_types,
                add_hash,
                remove_hash,
            );

            pending.push(Pending {
                entity: next_entity,
                src: src_archetype_idx,
                dst: dst_idx,
                add_ptrs: entity_adds.iter().map(|a| (a.type_uuid, a.payload as *const u8)).collect(),
            });
        }

        // Step 4: sort by (src_archetype, dst_archetype).
        pending.sort_by_key(|p| (p.src.unwrap_or(usize::MAX), p.dst));

        // Step 5: apply transitions.
        for p in pending {
            match p.src {
                Some(src_idx) if src_idx == p.dst => {
                    let loc = locations[p.entity.index() as usize].expect("src archetype implies a location");
                    graph.get_mut(src_idx).overwrite_in_place(loc.chunk, loc.row, &p.add_ptrs);
                }
                Some(src_idx) => {
                    let loc = locations[p.entity.index() as usize].expect("src archetype implies a location");
                    let (src_arch, dst_arch) = graph.get2_mut(src_idx, p.dst);
                    let ((dst_chunk, dst_row), swapped) = if p.add_ptrs.is_empty() {
                        Archetype::remove_entity(src_arch, loc.chunk, loc.row, dst_arch, p.entity)
                    } else {
                        Archetype::move_entity(src_arch, loc.chunk, loc.row, dst_arch, p.entity, &p.add_ptrs)
                    };
                    locations[p.entity.index() as usize] = Some(PrimaryLocation { archetype: p.dst, chunk: dst_chunk, row: dst_row });
                    if let Some(swapped_entity) = swapped {
                        locations[swapped_entity.index() as usize] =
                            Some(PrimaryLocation { archetype: src_idx, chunk: loc.chunk, row: loc.row });
                    }
                }
                None => {
                    let dst_arch = graph.get_mut(p.dst);
                    let (chunk_idx, row) = dst_arch.add_entity(p.entity, &p.add_ptrs);
                    ensure_len(&mut locations, p.entity.index() as usize, None);
                    locations[p.entity.index() as usize] = Some(PrimaryLocation { archetype: p.dst, chunk: chunk_idx, row });
                }
            }
        }

        // Step 6: drain deletes across every storage kind, then commit the
        // recycled indices and bumped generations.
        let deleted = self.allocator.drain_pending_deletes();
        if !deleted.is_empty() {
            let mut secondary = self.secondary.write();
            let mut tags = self.tags.write();
            for &entity in &deleted {
                if let Some(loc) = locations.get(entity.index() as usize).copied().flatten() {
                    let arch = graph.get_mut(loc.archetype);
                    if let Some(swapped) = arch.erase_entity(loc.chunk, loc.row) {
                        locations[swapped.index() as usize] = Some(PrimaryLocation { archetype: loc.archetype, chunk: loc.chunk, row: loc.row });
                    }
                    locations[entity.index() as usize] = None;
                }
                secondary.delete_entity(entity);
                tags.delete_entity(entity, |slot| self.tag_type_for_slot(slot));
            }
            self.allocator.commit_deletions(&deleted);
        }

        // Step 7 (clearing staging) already happened: every `drain_*` call
        // above reset its buffer's length to zero and took the per-worker
        // bump arenas, which are dropped here at the end of this scope.

        Ok(())
    }
}
