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

//! Component queries over primary archetype storage (SPEC_FULL §4.3.7).
//!
//! Replaces the teacher's `QueryFilter`/`QueryFetch`/`QueryState`/`CachedQuery`
//! stack (built around a single flat `Vec<Archetype>` and a `TypeId`-keyed
//! signature) with a `TypeUuid`-keyed equivalent over the distilled spec's
//! archetype graph: a [`Query`] resolves its candidate archetypes once, via
//! the smallest-candidate-list pivot the graph's `type_index` exists to
//! serve, and every iteration call walks only those archetypes' chunks.
//!
//! A query never mutates archetype storage, so its reads only ever race with
//! `World::end_frame`, which per §5 never runs concurrently with stage
//! execution. [`Query::for_each`]/[`Query::for_each_changed`]/[`Query::get`]
//! take a read lock on the archetype graph for the duration of the call and
//! hand out `'w`-lifetime references derived from it through a raw-pointer
//! reborrow — sound because the guard they came from outlives every use of
//! those references (it isn't dropped until the call returns), the same
//! argument [`crate::archetype::Chunk::column_slice_mut_unchecked`]'s own doc
//! comment makes for its shared-reference aliasing.

use smallvec::SmallVec;

use crate::archetype::Chunk;
use crate::component::Component;
use crate::ids::{ComponentKind, Entity, TypeUuid};
use crate::registry::TypeRegistry;
use crate::world::World;

/// Fetches a single query term's data out of one chunk row.
///
/// # Safety
/// `fetch` trusts that `col_idx` is the column `type_uuid(kind)` resolves to
/// in the archetype `chunk` belongs to, and that `row < chunk.size()`.
pub unsafe trait QueryFetch<'w> {
    type Item;

    fn is_write() -> bool;
    fn type_uuid(kind: ComponentKind) -> TypeUuid;

    /// # Safety
    /// See the trait's safety section.
    unsafe fn fetch(chunk: &'w Chunk, col_idx: usize, row: usize) -> Self::Item;
}

unsafe impl<'w, T: Component> QueryFetch<'w> for &'w T {
    type Item = &'w T;

    fn is_write() -> bool {
        false
    }

    fn type_uuid(kind: ComponentKind) -> TypeUuid {
        TypeRegistry::global().index_of::<T>(kind)
    }

    unsafe fn fetch(chunk: &'w Chunk, col_idx: usize, row: usize) -> Self::Item {
        &unsafe { chunk.column_slice::<T>(col_idx) }[row]
    }
}

unsafe impl<'w, T: Component> QueryFetch<'w> for &'w mut T {
    type Item = &'w mut T;

    fn is_write() -> bool {
        true
    }

    fn type_uuid(kind: ComponentKind) -> TypeUuid {
        TypeRegistry::global().index_of::<T>(kind)
    }

    unsafe fn fetch(chunk: &'w Chunk, col_idx: usize, row: usize) -> Self::Item {
        // Write-implies-dirty (§4.3.7): every mutably-requested term marks
        // its own change bit at fetch time, since queries hand out raw `&mut`
        // references directly rather than going through `Archetype`'s own
        // tracked write paths.
        unsafe { chunk.mark_changed_unchecked(col_idx, row) };
        &mut unsafe { chunk.column_slice_mut_unchecked::<T>(col_idx) }[row]
    }
}

/// A fixed-arity tuple of [`QueryFetch`] terms (generated for 1..=8 terms).
pub trait QueryTuple<'w> {
    type Item;

    fn type_uuids(kind: ComponentKind) -> SmallVec<[TypeUuid; 8]>;
    fn write_flags() -> SmallVec<[bool; 8]>;

    /// # Safety
    /// `col_indices[i]` must be the column for term `i` in the archetype
    /// `chunk` belongs to, and `row < chunk.size()`.
    unsafe fn fetch_row(chunk: &'w Chunk, col_indices: &[usize], row: usize) -> Self::Item;
}

macro_rules! impl_query_tuple {
    ($($T:ident : $idx:tt),+) => {
        impl<'w, $($T: QueryFetch<'w>),+> QueryTuple<'w> for ($($T,)+) {
            type Item = ($($T::Item,)+);

            fn type_uuids(kind: ComponentKind) -> SmallVec<[TypeUuid; 8]> {
                let mut uuids = SmallVec::new();
                $(uuids.push($T::type_uuid(kind));)+
                uuids
            }

            fn write_flags() -> SmallVec<[bool; 8]> {
                let mut flags = SmallVec::new();
                $(flags.push($T::is_write());)+
                flags
            }

            unsafe fn fetch_row(chunk: &'w Chunk, col_indices: &[usize], row: usize) -> Self::Item {
                ($(unsafe { $T::fetch(chunk, col_indices[$idx], row) },)+)
            }
        }
    };
}

impl_query_tuple!(A: 0);
impl_query_tuple!(A: 0, B: 1);
impl_query_tuple!(A: 0, B: 1, C: 2);
impl_query_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_query_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_query_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_query_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_query_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// A query's pre-resolved candidate archetypes, built once against the
/// archetype graph as it stood at construction time. Re-create after staging
/// a structural change the query should observe (i.e. after `World::run`'s
/// synchronization step runs).
pub struct Query<'w, Q: QueryTuple<'w>> {
    world: &'w World,
    archetypes: Vec<usize>,
    col_indices: Vec<SmallVec<[usize; 8]>>,
    #[allow(dead_code)] // kept for callers that want to introspect access shape
    write_flags: SmallVec<[bool; 8]>,
    type_uuids: SmallVec<[TypeUuid; 8]>,
}

impl World {
    /// Builds a [`Query`] for `Q` (a tuple of `&T`/`&mut T` terms): resolves
    /// candidate archetypes by picking, among `Q`'s terms, the one with the
    /// fewest archetypes carrying it (ties broken by lowest [`TypeUuid`]),
    /// then filters that candidate list down to archetypes that are a
    /// superset of every term (§4.3.7).
    pub fn query<'w, Q: QueryTuple<'w>>(&'w self) -> Query<'w, Q> {
        let type_uuids = Q::type_uuids(self.primary_kind());
        let write_flags = Q::write_flags();
        let graph = self.graph.read();

        let mut pivot = type_uuids[0];
        let mut pivot_count = graph.archetypes_with_type(pivot).len();
        for &candidate in &type_uuids[1..] {
            let count = graph.archetypes_with_type(candidate).len();
            if count < pivot_count || (count == pivot_count && candidate < pivot) {
                pivot = candidate;
                pivot_count = count;
            }
        }

        let mut archetypes = Vec::new();
        let mut col_indices = Vec::new();
        for &idx in graph.archetypes_with_type(pivot) {
            let archetype = graph.get(idx);
            if !archetype.is_superset_of(&type_uuids) {
                continue;
            }
            let cols: SmallVec<[usize; 8]> =
                type_uuids.iter().map(|&t| archetype.column_index(t).expect("is_superset_of guarantees the column exists")).collect();
            archetypes.push(idx);
            col_indices.push(cols);
        }

        Query { world: self, archetypes, col_indices, write_flags, type_uuids }
    }
}

impl<'w, Q: QueryTuple<'w>> Query<'w, Q> {
    /// Visits every matching row across every matching archetype's chunks
    /// (§4.3.7).
    pub fn for_each(&self, mut f: impl FnMut(Entity, Q::Item)) {
        let graph = self.world.graph.read();
        for (pos, &arch_idx) in self.archetypes.iter().enumerate() {
            let archetype = graph.get(arch_idx);
            let cols = &self.col_indices[pos];
            for chunk_idx in archetype.iter_chunk_indices() {
                let chunk = archetype.chunk_at(chunk_idx).expect("index came from iter_chunk_indices");
                // SAFETY: `graph` is held until this function returns, which
                // is after every use of `chunk` below.
                let chunk: &'w Chunk = unsafe { &*(chunk as *const Chunk) };
                for row in 0..chunk.size() {
                    let entity = chunk.entities()[row];
                    let item = unsafe { Q::fetch_row(chunk, cols, row) };
                    f(entity, item);
                }
            }
        }
    }

    /// As [`Query::for_each`], but only visits rows where `C`'s change bit is
    /// set in that chunk (§4.3.7). Archetypes that don't carry `C` at all are
    /// skipped.
    pub fn for_each_changed<C: Component>(&self, mut f: impl FnMut(Entity, Q::Item)) {
        let changed_uuid = TypeRegistry::global().index_of::<C>(self.world.primary_kind());
        let graph = self.world.graph.read();
        for (pos, &arch_idx) in self.archetypes.iter().enumerate() {
            let archetype = graph.get(arch_idx);
            let Some(changed_col) = archetype.column_index(changed_uuid) else { continue };
            let cols = &self.col_indices[pos];
            for chunk_idx in archetype.iter_chunk_indices() {
                let chunk = archetype.chunk_at(chunk_idx).expect("index came from iter_chunk_indices");
                let chunk: &'w Chunk = unsafe { &*(chunk as *const Chunk) };
                for row in 0..chunk.size() {
                    if !chunk.is_changed(changed_col, row) {
                        continue;
                    }
                    let entity = chunk.entities()[row];
                    let item = unsafe { Q::fetch_row(chunk, cols, row) };
                    f(entity, item);
                }
            }
        }
    }

    /// Whether `entity` is live and currently resides in one of this query's
    /// matching archetypes.
    pub fn has(&self, entity: Entity) -> bool {
        match self.world.primary_location(entity) {
            Some((arch_idx, _, _)) => self.archetypes.contains(&arch_idx),
            None => false,
        }
    }

    /// Fetches this query's terms for a single entity, or `None` if the
    /// entity is stale or doesn't carry every term (§4.3.7).
    pub fn get(&self, entity: Entity) -> Option<Q::Item> {
        let (arch_idx, chunk_idx, row) = self.world.primary_location(entity)?;
        let pos = self.archetypes.iter().position(|&a| a == arch_idx)?;

        let graph = self.world.graph.read();
        let archetype = graph.get(arch_idx);
        let chunk = archetype.chunk_at(chunk_idx)?;
        // SAFETY: as in `for_each` — `graph` outlives this function's return.
        let chunk: &'w Chunk = unsafe { &*(chunk as *const Chunk) };
        let cols = &self.col_indices[pos];
        Some(unsafe { Q::fetch_row(chunk, cols, row) })
    }

    /// The [`TypeUuid`]s this query reads or writes, in term order.
    pub fn type_uuids(&self) -> &[TypeUuid] {
        &self.type_uuids
    }

    /// How many archetypes currently match this query.
    pub fn matched_archetype_count(&self) -> usize {
        self.archetypes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Position {
        x: f32,
        y: f32,
    }
    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Velocity {
        x: f32,
    }

    fn world() -> World {
        World::new(WorldConfig::default().with_thread_pool_workers(1))
    }

    #[test]
    fn for_each_visits_every_matching_entity() {
        let world = world();
        let a = world.create_entity((Position { x: 0.0, y: 0.0 },));
        let b = world.create_entity((Position { x: 1.0, y: 1.0 }, Velocity { x: 2.0 }));
        world.end_frame().unwrap();

        let query = world.query::<(&Position,)>();
        let mut seen = Vec::new();
        query.for_each(|e, (pos,)| seen.push((e, pos.x)));
        seen.sort_by_key(|&(e, _)| e.index());

        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&(a, 0.0)));
        assert!(seen.contains(&(b, 1.0)));
    }

    #[test]
    fn write_term_mutates_in_place() {
        let world = world();
        let e = world.create_entity((Position { x: 0.0, y: 0.0 }, Velocity { x: 5.0 }));
        world.end_frame().unwrap();

        let query = world.query::<(&mut Position, &Velocity)>();
        query.for_each(|_, (pos, vel)| pos.x += vel.x);

        let query = world.query::<(&Position,)>();
        assert_eq!(query.get(e).unwrap().0.x, 5.0);
    }

    #[test]
    fn for_each_changed_only_visits_rows_written_since_the_last_sync() {
        let world = world();
        world.mark_tracked::<Position>();
        let older = world.create_entity((Position { x: 0.0, y: 0.0 },));
        world.end_frame().unwrap();
        // This second sync clears `older`'s change bit (set by the first
        // sync's creation) before setting a fresh one for `newer`.
        let newer = world.create_entity((Position { x: 9.0, y: 9.0 },));
        world.end_frame().unwrap();

        let query = world.query::<(&Position,)>();
        let mut seen = Vec::new();
        query.for_each_changed::<Position>(|e, _| seen.push(e));

        assert!(seen.contains(&newer));
        assert!(!seen.contains(&older));
    }

    #[test]
    fn get_returns_none_for_entity_missing_a_term() {
        let world = world();
        let e = world.create_entity((Position { x: 0.0, y: 0.0 },));
        world.end_frame().unwrap();

        let query = world.query::<(&Position, &Velocity)>();
        assert!(query.get(e).is_none());
    }

    #[test]
    fn has_reflects_archetype_membership() {
        let world = world();
        let e = world.create_entity((Position { x: 0.0, y: 0.0 }, Velocity { x: 1.0 }));
        world.end_frame().unwrap();

        assert!(world.query::<(&Position, &Velocity)>().has(e));
        assert!(!world.query::<(&Velocity,)>().has(Entity::NULL));
    }
}
