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

//! Secondary Sparse Storage (component E): one chunked, single-column
//! archetype per secondary [`TypeUuid`], with a per-entity sorted location
//! vector so a type can be found, added, or removed without walking every
//! per-type archetype (SPEC_FULL §4.5).
//!
//! Grounded on `original_source` `ECS/Entity/SecondaryArchetype.h` (chunked
//! arena per type, `nextFree`/`expandChunk` growth) and
//! `SecondaryComponentType.h`'s sparse per-entity metadata vector; the
//! chunk-growth algorithm mirrors [`crate::archetype::Archetype`]'s
//! `next_free`/`expand` but drops the multi-column bookkeeping since each
//! sparse archetype holds exactly one type.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::TypeInfo;
use crate::ids::{Entity, TypeUuid};

struct SparseChunk {
    entities: Vec<Entity>,
    info: TypeInfo,
    ptr: NonNull<u8>,
    size: usize,
    capacity: usize,
}

impl SparseChunk {
    fn new(info: TypeInfo) -> Self {
        SparseChunk { entities: Vec::new(), info, ptr: NonNull::dangling(), size: 0, capacity: 0 }
    }

    fn layout_for(info: &TypeInfo, elems: usize) -> Layout {
        if info.size == 0 || elems == 0 {
            Layout::from_size_align(0, info.align.max(1)).unwrap()
        } else {
            Layout::from_size_align(info.size * elems, info.align).unwrap()
        }
    }

    fn tail_space(&self) -> usize {
        self.capacity - self.size
    }

    fn row_ptr(&self, row: usize) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(row * self.info.size) }
    }

    fn grow_to(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        let new_layout = Self::layout_for(&self.info, new_capacity);
        let new_ptr = if new_layout.size() == 0 {
            NonNull::dangling()
        } else {
            let raw = unsafe { alloc(new_layout) };
            NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(new_layout))
        };
        if self.size > 0 {
            unsafe { (self.info.move_construct)(new_ptr.as_ptr(), self.ptr.as_ptr(), self.size) };
        }
        if self.capacity > 0 {
            let old_layout = Self::layout_for(&self.info, self.capacity);
            if old_layout.size() > 0 {
                unsafe { dealloc(self.ptr.as_ptr(), old_layout) };
            }
        }
        self.ptr = new_ptr;
        self.capacity = new_capacity;
        self.entities.resize(new_capacity, Entity::NULL);
    }

    fn reserve_one(&mut self, starting_capacity: usize) -> usize {
        if self.tail_space() == 0 {
            let new_cap = if self.capacity == 0 { starting_capacity } else { self.capacity * 2 };
            self.grow_to(new_cap);
        }
        let row = self.size;
        self.size += 1;
        row
    }

    /// Swap-with-last erase; returns the entity that was moved into `row`,
    /// if any (§4.5 "remove(entity, type): locate; do chunk swap-with-last").
    fn remove(&mut self, row: usize) -> Option<Entity> {
        let last = self.size - 1;
        unsafe { (self.info.destroy)(self.row_ptr(row), 1) };
        if last != row {
            unsafe { (self.info.move_construct)(self.row_ptr(row), self.row_ptr(last), 1) };
            self.entities[row] = self.entities[last];
            self.size -= 1;
            Some(self.entities[row])
        } else {
            self.size -= 1;
            None
        }
    }
}

impl Drop for SparseChunk {
    fn drop(&mut self) {
        if self.size > 0 {
            unsafe { (self.info.destroy)(self.row_ptr(0), self.size) };
        }
        if self.capacity > 0 {
            let layout = Self::layout_for(&self.info, self.capacity);
            if layout.size() > 0 {
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}

/// Per-type chunked sparse archetype: up to `chunk_max` chunks, doubling
/// capacity from `starting_capacity`, `expands` picking the next chunk to
/// grow modulo `chunk_max` — the same policy as the primary archetype's
/// §4.3.1, specialised to a single column.
struct SparseArchetype {
    info: TypeInfo,
    chunks: Vec<Option<SparseChunk>>,
    chunk_max: usize,
    starting_capacity: usize,
    expands: usize,
}

impl SparseArchetype {
    fn new(info: TypeInfo, chunk_max: usize, starting_capacity: usize) -> Self {
        SparseArchetype {
            info,
            chunks: (0..chunk_max).map(|_| None).collect(),
            chunk_max,
            starting_capacity: starting_capacity.max(1),
            expands: 0,
        }
    }

    fn next_free(&self) -> Option<usize> {
        for (i, slot) in self.chunks.iter().enumerate() {
            match slot {
                Some(c) if c.tail_space() > 0 => return Some(i),
                None => return Some(i),
                _ => {}
            }
        }
        None
    }

    fn expand(&mut self) -> usize {
        let idx = self.expands % self.chunk_max;
        self.expands += 1;
        let info = self.info;
        let chunk = self.chunks[idx].get_or_insert_with(|| SparseChunk::new(info));
        let new_cap = if chunk.capacity == 0 { self.starting_capacity } else { chunk.capacity * 2 };
        chunk.grow_to(new_cap);
        idx
    }

    fn add(&mut self, entity: Entity, value_ptr: *const u8) -> (usize, usize) {
        let idx = self.next_free().unwrap_or_else(|| self.expand());
        let info = self.info;
        let chunk = self.chunks[idx].get_or_insert_with(|| SparseChunk::new(info));
        let row = chunk.reserve_one(self.starting_capacity);
        unsafe { (info.move_construct)(chunk.row_ptr(row), value_ptr as *mut u8, 1) };
        chunk.entities[row] = entity;
        (idx, row)
    }

    fn overwrite(&mut self, chunk_idx: usize, row: usize, value_ptr: *const u8) {
        let chunk = self.chunks[chunk_idx].as_mut().expect("chunk initialised");
        unsafe {
            (chunk.info.destroy)(chunk.row_ptr(row), 1);
            (chunk.info.move_construct)(chunk.row_ptr(row), value_ptr as *mut u8, 1);
        }
    }

    fn remove(&mut self, chunk_idx: usize, row: usize) -> Option<Entity> {
        self.chunks[chunk_idx].as_mut().expect("chunk initialised").remove(row)
    }

    #[cfg(test)]
    fn value_at<T>(&self, chunk_idx: usize, row: usize) -> &T {
        let chunk = self.chunks[chunk_idx].as_ref().unwrap();
        unsafe { &*(chunk.row_ptr(row) as *const T) }
    }
}

/// One per-entity sparse-storage location record (§3.5).
#[derive(Clone, Copy)]
struct Location {
    type_uuid: TypeUuid,
    chunk_index: usize,
    row: usize,
}

/// Secondary Sparse Storage (component E): a per-type archetype table plus
/// the per-entity sorted location vectors of §3.2/§3.5.
pub struct SecondaryStorage {
    archetypes: FxHashMap<TypeUuid, SparseArchetype>,
    metadata: Vec<SmallVec<[Location; 4]>>,
    chunk_max: usize,
    starting_capacity: usize,
}

impl SecondaryStorage {
    pub fn new(chunk_max: usize, starting_capacity: usize) -> Self {
        SecondaryStorage { archetypes: FxHashMap::default(), metadata: Vec::new(), chunk_max, starting_capacity }
    }

    fn ensure_metadata(&mut self, index: usize) {
        if self.metadata.len() <= index {
            self.metadata.resize_with(index + 1, SmallVec::new);
        }
    }

    /// §4.5 add: resolve-or-create the per-type archetype; move-assign an
    /// existing slot for `(entity, type)` or insert a new sorted entry.
    pub fn add(&mut self, entity: Entity, type_uuid: TypeUuid, info: TypeInfo, value_ptr: *const u8) {
        let index = entity.index() as usize;
        self.ensure_metadata(index);
        let existing = self.metadata[index].iter().position(|l| l.type_uuid == type_uuid);

        let chunk_max = self.chunk_max;
        let starting_capacity = self.starting_capacity;
        let archetype = self
            .archetypes
            .entry(type_uuid)
            .or_insert_with(|| SparseArchetype::new(info, chunk_max, starting_capacity));

        if let Some(pos) = existing {
            let loc = self.metadata[index][pos];
            archetype.overwrite(loc.chunk_index, loc.row, value_ptr);
            return;
        }

        let (chunk_index, row) = archetype.add(entity, value_ptr);
        let loc = Location { type_uuid, chunk_index, row };
        let locations = &mut self.metadata[index];
        let pos = locations.binary_search_by_key(&type_uuid, |l| l.type_uuid).unwrap_or_else(|i| i);
        locations.insert(pos, loc);
    }

    /// §4.5 remove: locate, swap-with-last in the type's chunk, fix up the
    /// swapped entity's metadata, erase the metadata entry.
    pub fn remove(&mut self, entity: Entity, type_uuid: TypeUuid) {
        let index = entity.index() as usize;
        if index >= self.metadata.len() {
            return;
        }
        let Some(pos) = self.metadata[index].iter().position(|l| l.type_uuid == type_uuid) else {
            return;
        };
        let loc = self.metadata[index].remove(pos);
        let Some(archetype) = self.archetypes.get_mut(&type_uuid) else { return };
        if let Some(swapped) = archetype.remove(loc.chunk_index, loc.row) {
            self.fixup_swapped(swapped, type_uuid, loc.chunk_index, loc.row);
        }
    }

    fn fixup_swapped(&mut self, swapped: Entity, type_uuid: TypeUuid, chunk_index: usize, row: usize) {
        let swapped_idx = swapped.index() as usize;
        if swapped_idx >= self.metadata.len() {
            return;
        }
        if let Some(loc) = self.metadata[swapped_idx].iter_mut().find(|l| l.type_uuid == type_uuid) {
            loc.chunk_index = chunk_index;
            loc.row = row;
        }
    }

    /// §4.5 "Delete entity: walk the entity's location vector, remove from
    /// each chunk, clear the vector."
    pub fn delete_entity(&mut self, entity: Entity) {
        let index = entity.index() as usize;
        if index >= self.metadata.len() {
            return;
        }
        let locations: SmallVec<[Location; 4]> = std::mem::take(&mut self.metadata[index]);
        for loc in locations {
            if let Some(archetype) = self.archetypes.get_mut(&loc.type_uuid) {
                if let Some(swapped) = archetype.remove(loc.chunk_index, loc.row) {
                    self.fixup_swapped(swapped, loc.type_uuid, loc.chunk_index, loc.row);
                }
            }
        }
    }

    pub fn has(&self, entity: Entity, type_uuid: TypeUuid) -> bool {
        let index = entity.index() as usize;
        self.metadata
            .get(index)
            .is_some_and(|locs| locs.iter().any(|l| l.type_uuid == type_uuid))
    }

    /// # Safety
    /// `T` must be the component type registered under `type_uuid`.
    pub unsafe fn get<T>(&self, entity: Entity, type_uuid: TypeUuid) -> Option<&T> {
        let index = entity.index() as usize;
        let loc = self.metadata.get(index)?.iter().find(|l| l.type_uuid == type_uuid)?;
        Some(self.archetypes.get(&type_uuid)?.value_at_pub::<T>(loc.chunk_index, loc.row))
    }
}

impl SparseArchetype {
    fn value_at_pub<T>(&self, chunk_idx: usize, row: usize) -> &T {
        let chunk = self.chunks[chunk_idx].as_ref().expect("chunk initialised");
        unsafe { &*(chunk.row_ptr(row) as *const T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::ids::ComponentKind;

    struct Marker;
    impl Component for Marker {}

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Name(u32);

    fn uuid(slot: u16) -> TypeUuid {
        TypeUuid::new(ComponentKind(9), slot)
    }

    #[test]
    fn add_then_get_roundtrips() {
        let mut storage = SecondaryStorage::new(4, 4);
        let t = uuid(1);
        let e = Entity::new(1, 0);
        let v = Name(42);
        storage.add(e, t, TypeInfo::of::<Name>(), &v as *const Name as *const u8);
        std::mem::forget(v);
        assert!(storage.has(e, t));
        let got = unsafe { storage.get::<Name>(e, t) };
        assert_eq!(got, Some(&Name(42)));
    }

    #[test]
    fn add_twice_overwrites_in_place() {
        let mut storage = SecondaryStorage::new(4, 4);
        let t = uuid(1);
        let e = Entity::new(1, 0);
        let v1 = Name(1);
        storage.add(e, t, TypeInfo::of::<Name>(), &v1 as *const Name as *const u8);
        std::mem::forget(v1);
        let v2 = Name(2);
        storage.add(e, t, TypeInfo::of::<Name>(), &v2 as *const Name as *const u8);
        std::mem::forget(v2);
        assert_eq!(unsafe { storage.get::<Name>(e, t) }, Some(&Name(2)));
    }

    #[test]
    fn remove_swaps_last_and_fixes_up_metadata() {
        let mut storage = SecondaryStorage::new(4, 4);
        let t = uuid(1);
        let e0 = Entity::new(1, 0);
        let e1 = Entity::new(2, 0);
        let e2 = Entity::new(3, 0);
        for (e, val) in [(e0, 10u32), (e1, 20), (e2, 30)] {
            let v = Name(val);
            storage.add(e, t, TypeInfo::of::<Name>(), &v as *const Name as *const u8);
            std::mem::forget(v);
        }
        storage.remove(e0, t);
        assert!(!storage.has(e0, t));
        assert_eq!(unsafe { storage.get::<Name>(e2, t) }, Some(&Name(30)));
        assert_eq!(unsafe { storage.get::<Name>(e1, t) }, Some(&Name(20)));
    }

    #[test]
    fn delete_entity_clears_every_type() {
        let mut storage = SecondaryStorage::new(4, 4);
        let t1 = uuid(1);
        let t2 = uuid(2);
        let e = Entity::new(1, 0);
        let v1 = Name(1);
        storage.add(e, t1, TypeInfo::of::<Name>(), &v1 as *const Name as *const u8);
        std::mem::forget(v1);
        let v2 = Name(2);
        storage.add(e, t2, TypeInfo::of::<Name>(), &v2 as *const Name as *const u8);
        std::mem::forget(v2);
        storage.delete_entity(e);
        assert!(!storage.has(e, t1));
        assert!(!storage.has(e, t2));
    }

    #[test]
    fn expansion_across_many_entities_of_one_type() {
        let mut storage = SecondaryStorage::new(2, 2);
        let t = uuid(1);
        for i in 0..20u32 {
            let e = Entity::new(i + 1, 0);
            let v = Name(i);
            storage.add(e, t, TypeInfo::of::<Name>(), &v as *const Name as *const u8);
            std::mem::forget(v);
        }
        for i in 0..20u32 {
            let e = Entity::new(i + 1, 0);
            assert_eq!(unsafe { storage.get::<Name>(e, t) }, Some(&Name(i)));
        }
    }
}
