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

//! Boolean Tag Storage (component F): a per-entity tag bitset for O(1)
//! `has`, plus an optional dense per-tag bitset archetype for entities
//! declared as "iterable" tags (SPEC_FULL §4.6).
//!
//! Grounded on `original_source` `ECS/Entity/BooleanArchetype.h`
//! (`mem::bitset<> entities; bool active`) — membership is a plain bitset,
//! not a sparse set, matching the original exactly; reuses the teacher's
//! `bitset.rs` `BitSet` for both the per-entity and per-tag bitsets.

use rustc_hash::FxHashMap;

use crate::bitset::BitSet;
use crate::ids::{Entity, TypeUuid};

/// A single boolean tag's dense membership archetype. Only materialised
/// for tags declared iterable (§3.6); `has` never needs this, only
/// population iteration does.
struct ActiveTagArchetype {
    members: BitSet,
}

impl ActiveTagArchetype {
    fn new() -> Self {
        ActiveTagArchetype { members: BitSet::with_capacity(0) }
    }
}

/// Boolean Tag Storage: per-entity tag bitsets indexed by entity index, and
/// the optional dense per-tag membership bitsets for iterable tags.
pub struct TagStorage {
    entity_tags: Vec<BitSet>,
    active: FxHashMap<TypeUuid, ActiveTagArchetype>,
    iterable: FxHashMap<TypeUuid, bool>,
}

impl TagStorage {
    pub fn new() -> Self {
        TagStorage { entity_tags: Vec::new(), active: FxHashMap::default(), iterable: FxHashMap::default() }
    }

    fn ensure_entity(&mut self, index: usize) {
        if self.entity_tags.len() <= index {
            self.entity_tags.resize_with(index + 1, || BitSet::with_capacity(0));
        }
    }

    /// Declares `type_uuid` as an iterable tag — called once at registration
    /// (§3.6 "declared as iterable tags rather than pure lookups").
    pub fn declare_iterable(&mut self, type_uuid: TypeUuid) {
        self.iterable.insert(type_uuid, true);
    }

    fn is_iterable(&self, type_uuid: TypeUuid) -> bool {
        self.iterable.get(&type_uuid).copied().unwrap_or(false)
    }

    /// §4.6 add: set the kind-local slot bit; if the tag is iterable, also
    /// add the entity into the dense archetype.
    pub fn add(&mut self, entity: Entity, slot: u16, type_uuid: TypeUuid) {
        let index = entity.index() as usize;
        self.ensure_entity(index);
        self.entity_tags[index].set(slot as usize);
        if self.is_iterable(type_uuid) {
            let archetype = self.active.entry(type_uuid).or_insert_with(ActiveTagArchetype::new);
            archetype.members.resize(index + 1);
            archetype.members.set(index);
        }
    }

    /// §4.6 remove: reset the slot bit; if active, remove from the dense set.
    pub fn remove(&mut self, entity: Entity, slot: u16, type_uuid: TypeUuid) {
        let index = entity.index() as usize;
        if index < self.entity_tags.len() {
            self.entity_tags[index].clear(slot as usize);
        }
        if let Some(archetype) = self.active.get_mut(&type_uuid) {
            archetype.members.clear(index);
        }
    }

    /// O(1) membership test via the per-entity bitset (§3.6).
    pub fn has(&self, entity: Entity, slot: u16) -> bool {
        self.entity_tags.get(entity.index() as usize).is_some_and(|bits| bits.contains(slot as usize))
    }

    /// §4.6 "Delete entity: iterate set bits of the entity bitset, call
    /// remove on each, then free the bitset." The caller supplies
    /// `slot_to_type` to resolve each set bit back to a [`TypeUuid`] for the
    /// dense-archetype removal half of `remove`.
    pub fn delete_entity(&mut self, entity: Entity, slot_to_type: impl Fn(u16) -> Option<TypeUuid>) {
        let index = entity.index() as usize;
        let Some(bits) = self.entity_tags.get(index).cloned() else { return };
        for slot in bits.ones() {
            if let Some(type_uuid) = slot_to_type(slot as u16) {
                if let Some(archetype) = self.active.get_mut(&type_uuid) {
                    archetype.members.clear(index);
                }
            }
        }
        if let Some(bits) = self.entity_tags.get_mut(index) {
            bits.clear_all();
        }
    }

    /// Population iteration for an iterable tag: O(population) via the
    /// dense bitset's set-bit scan. Returns entity *indices*; the caller
    /// (the world) zips these against the entity allocator's current
    /// generation to produce live [`Entity`] handles, since this storage
    /// has no access to generation state (§4.2 is component B's concern).
    pub fn iter_members(&self, type_uuid: TypeUuid) -> impl Iterator<Item = u32> + '_ {
        self.active.get(&type_uuid).into_iter().flat_map(|a| a.members.ones()).map(|i| i as u32)
    }
}

impl Default for TagStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ComponentKind;

    fn uuid(slot: u16) -> TypeUuid {
        TypeUuid::new(ComponentKind(6), slot)
    }

    #[test]
    fn has_is_false_before_any_add() {
        let storage = TagStorage::new();
        assert!(!storage.has(Entity::new(1, 0), 1));
    }

    #[test]
    fn add_then_has_reports_true() {
        let mut storage = TagStorage::new();
        let e = Entity::new(1, 0);
        storage.add(e, 3, uuid(3));
        assert!(storage.has(e, 3));
        assert!(!storage.has(e, 4));
    }

    #[test]
    fn remove_clears_membership() {
        let mut storage = TagStorage::new();
        let e = Entity::new(1, 0);
        storage.add(e, 3, uuid(3));
        storage.remove(e, 3, uuid(3));
        assert!(!storage.has(e, 3));
    }

    #[test]
    fn non_iterable_tag_has_no_population() {
        let mut storage = TagStorage::new();
        let e = Entity::new(1, 0);
        let t = uuid(5);
        storage.add(e, 5, t);
        assert_eq!(storage.iter_members(t).count(), 0);
    }

    #[test]
    fn iterable_tag_population_matches_members() {
        let mut storage = TagStorage::new();
        let t = uuid(7);
        storage.declare_iterable(t);
        let e1 = Entity::new(1, 0);
        let e2 = Entity::new(5, 0);
        storage.add(e1, 7, t);
        storage.add(e2, 7, t);
        let mut members: Vec<u32> = storage.iter_members(t).collect();
        members.sort();
        assert_eq!(members, vec![1, 5]);
        storage.remove(e1, 7, t);
        let members: Vec<u32> = storage.iter_members(t).collect();
        assert_eq!(members, vec![5]);
    }

    #[test]
    fn delete_entity_clears_all_tags_and_dense_sets() {
        let mut storage = TagStorage::new();
        let t1 = uuid(1);
        let t2 = uuid(2);
        storage.declare_iterable(t1);
        let e = Entity::new(1, 0);
        storage.add(e, 1, t1);
        storage.add(e, 2, t2);
        storage.delete_entity(e, |slot| if slot == 1 { Some(t1) } else if slot == 2 { Some(t2) } else { None });
        assert!(!storage.has(e, 1));
        assert!(!storage.has(e, 2));
        assert_eq!(storage.iter_members(t1).count(), 0);
    }
}
