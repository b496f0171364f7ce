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

//! Archetype Transition Graph (component D): an append-only collection of
//! [`Archetype`]s plus the machinery that resolves add/remove transitions
//! between them (SPEC_FULL §4.4).
//!
//! Grounded on `original_source` `ECS/Entity/Entity.cpp`'s archetype-table
//! walk (hash-keyed lookup with a per-archetype transition cache to avoid
//! re-walking the type sets on repeated transitions) generalized from the
//! teacher's flat `FxHashMap<u64, Archetype>` registry in `world.rs` into a
//! dedicated graph type, since the synchronizer needs stable archetype
//! indices (not just hashes) to batch moves by `(src, dst)` pair (§4.8 step 4).

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::archetype::{compute_transition_types, Archetype, ColumnDescriptor};
use crate::component::TypeInfo;
use crate::ids::{hash_type_set, TypeUuid};

/// Index of the empty-type-set archetype that every brand-new entity with
/// no components starts in.
pub const ROOT: usize = 0;

/// Owns every [`Archetype`] that currently exists and the hash→index map
/// used to deduplicate type sets.
pub struct ArchetypeGraph {
    archetypes: Vec<Archetype>,
    by_hash: FxHashMap<u64, usize>,
    /// Reverse index: every archetype that carries a given type, in
    /// creation order. Lets a query pick, among its required types, the
    /// one with the fewest candidate archetypes to scan (SPEC_FULL §4.3.7)
    /// instead of walking the full archetype list on every query build.
    type_index: FxHashMap<TypeUuid, Vec<usize>>,
    chunk_max: usize,
    starting_capacity: usize,
}

impl ArchetypeGraph {
    pub fn new(chunk_max: usize, starting_capacity: usize) -> Self {
        let empty_hash = hash_type_set(&[]);
        let root = Archetype::new(SmallVec::new(), chunk_max, starting_capacity, empty_hash);
        let mut by_hash = FxHashMap::default();
        by_hash.insert(empty_hash, ROOT);
        ArchetypeGraph { archetypes: vec![root], by_hash, type_index: FxHashMap::default(), chunk_max, starting_capacity }
    }

    fn index_archetype(&mut self, idx: usize) {
        let uuids: SmallVec<[TypeUuid; 8]> = self.archetypes[idx].descriptors().iter().map(|d| d.type_uuid).collect();
        for uuid in uuids {
            self.type_index.entry(uuid).or_default().push(idx);
        }
    }

    /// §4.3.7: archetype indices carrying `type_uuid`, in creation order.
    pub fn archetypes_with_type(&self, type_uuid: TypeUuid) -> &[usize] {
        self.type_index.get(&type_uuid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, idx: usize) -> &Archetype {
        &self.archetypes[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Archetype {
        &mut self.archetypes[idx]
    }

    /// Borrows two distinct archetypes mutably at once (for a move between
    /// them). Panics if `a == b` — in-place overwrites never go through
    /// this path (SPEC_FULL §4.8 step 5 handles `src == dst` separately).
    pub fn get2_mut(&mut self, a: usize, b: usize) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(a, b, "get2_mut requires two distinct archetypes");
        if a < b {
            let (left, right) = self.archetypes.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    pub fn find_by_hash(&self, hash: u64) -> Option<usize> {
        self.by_hash.get(&hash).copied()
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the root archetype always exists
    }

    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Archetype> {
        self.archetypes.iter_mut()
    }

    /// Resolves the destination archetype for moving an entity out of
    /// `src_idx` with the given add/remove sets, creating a new archetype
    /// on a genuine miss (§4.4).
    ///
    /// Two-tier lookup: `src_idx`'s own cached transition edges first
    /// (keyed by `(add_hash, remove_hash)`, computed once per staged
    /// transition by [`crate::ids::fold_transition`]); on a miss, a
    /// coordinated walk of `src`'s sorted type set against `adds`/`removes`
    /// computes the destination type set, whose hash is then looked up (or
    /// inserted) in the graph-wide `by_hash` map.
    pub fn resolve(
        &mut self,
        src_idx: usize,
        adds: &[(TypeUuid, TypeInfo, bool)],
        removes: &[TypeUuid],
        add_hash: u64,
        remove_hash: u64,
    ) -> usize {
        if let Some(dst) = self.archetypes[src_idx].find_transition(add_hash, remove_hash) {
            return dst;
        }

        let dst_descriptors = compute_transition_types(self.archetypes[src_idx].descriptors(), adds, removes);
        let mut sorted_uuids: SmallVec<[TypeUuid; 8]> = dst_descriptors.iter().map(|d| d.type_uuid).collect();
        sorted_uuids.sort();
        let type_set_hash = hash_type_set(&sorted_uuids);

        let dst_idx = match self.by_hash.get(&type_set_hash) {
            Some(&idx) => idx,
            None => {
                let idx = self.archetypes.len();
                self.archetypes.push(Archetype::new(dst_descriptors, self.chunk_max, self.starting_capacity, type_set_hash));
                self.by_hash.insert(type_set_hash, idx);
                self.index_archetype(idx);
                idx
            }
        };
        self.archetypes[src_idx].add_transition(add_hash, remove_hash, dst_idx);
        dst_idx
    }

    /// Resolves (or creates) the archetype for a brand-new entity's initial
    /// type set — used by the staging create-buffer drain, which groups
    /// by this hash directly rather than walking from the root archetype
    /// (§4.8 step 1).
    pub fn resolve_new(&mut self, descriptors: &[(TypeUuid, TypeInfo, bool)]) -> usize {
        let mut sorted: SmallVec<[(TypeUuid, TypeInfo, bool); 8]> = descriptors.iter().copied().collect();
        sorted.sort_by_key(|d| d.0);
        let uuids: SmallVec<[TypeUuid; 8]> = sorted.iter().map(|d| d.0).collect();
        let hash = hash_type_set(&uuids);
        if let Some(&idx) = self.by_hash.get(&hash) {
            return idx;
        }
        let cols: SmallVec<[ColumnDescriptor; 8]> =
            sorted.iter().map(|&(type_uuid, info, tracked)| ColumnDescriptor { type_uuid, info, tracked }).collect();
        let idx = self.archetypes.len();
        self.archetypes.push(Archetype::new(cols, self.chunk_max, self.starting_capacity, hash));
        self.by_hash.insert(hash, idx);
        self.index_archetype(idx);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, TypeInfo};
    use crate::ids::ComponentKind;

    struct Position;
    struct Velocity;
    impl Component for Position {}
    impl Component for Velocity {}

    fn uuid(slot: u16) -> TypeUuid {
        TypeUuid::new(ComponentKind(1), slot)
    }

    #[test]
    fn root_archetype_is_empty() {
        let graph = ArchetypeGraph::new(4, 4);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(ROOT).len(), 0);
        assert!(graph.get(ROOT).descriptors().is_empty());
    }

    #[test]
    fn resolve_creates_new_archetype_on_first_add() {
        let mut graph = ArchetypeGraph::new(4, 4);
        let pos = uuid(1);
        let adds = [(pos, TypeInfo::of::<Position>(), false)];
        let dst = graph.resolve(ROOT, &adds, &[], 0xAAAA, 0);
        assert_ne!(dst, ROOT);
        assert_eq!(graph.get(dst).descriptors().len(), 1);
        assert!(graph.get(dst).has_type(pos));
    }

    #[test]
    fn resolve_reuses_existing_archetype_for_same_type_set() {
        let mut graph = ArchetypeGraph::new(4, 4);
        let pos = uuid(1);
        let vel = uuid(2);
        let adds_pos = [(pos, TypeInfo::of::<Position>(), false)];
        let a = graph.resolve(ROOT, &adds_pos, &[], 1, 0);

        // A second, independent path to the same {pos, vel} type set should
        // land on the same archetype index, not create a duplicate.
        let adds_both = [(pos, TypeInfo::of::<Position>(), false), (vel, TypeInfo::of::<Velocity>(), false)];
        let via_root = graph.resolve(ROOT, &adds_both, &[], 2, 0);

        let adds_vel = [(vel, TypeInfo::of::<Velocity>(), false)];
        let via_a = graph.resolve(a, &adds_vel, &[], 3, 0);

        assert_eq!(via_root, via_a);
        assert_eq!(graph.get(via_root).descriptors().len(), 2);
    }

    #[test]
    fn resolve_is_cached_on_src_archetype() {
        let mut graph = ArchetypeGraph::new(4, 4);
        let pos = uuid(1);
        let adds = [(pos, TypeInfo::of::<Position>(), false)];
        let first = graph.resolve(ROOT, &adds, &[], 42, 0);
        let second = graph.resolve(ROOT, &adds, &[], 42, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn resolve_new_deduplicates_by_type_set_hash() {
        let mut graph = ArchetypeGraph::new(4, 4);
        let pos = uuid(1);
        let descriptors = [(pos, TypeInfo::of::<Position>(), false)];
        let a = graph.resolve_new(&descriptors);
        let b = graph.resolve_new(&descriptors);
        assert_eq!(a, b);
        assert_eq!(graph.len(), 2); // root + the new one, not duplicated
    }

    #[test]
    fn get2_mut_returns_distinct_archetypes() {
        let mut graph = ArchetypeGraph::new(4, 4);
        let pos = uuid(1);
        let dst = graph.resolve_new(&[(pos, TypeInfo::of::<Position>(), false)]);
        let (a, b) = graph.get2_mut(ROOT, dst);
        assert_eq!(a.len(), 0);
        assert_eq!(b.descriptors().len(), 1);
    }
}
