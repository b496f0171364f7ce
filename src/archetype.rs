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

//! Primary Archetype Storage (component C): chunked SoA columns, in-place
//! expansion, archetype transitions, and change-bit tracking (SPEC_FULL §4.3).
//!
//! Grounded on `original_source` `ECS/Entity/Archetype.h` + `Entity.cpp`
//! (`InternalStorage`, `STARTING_CAPACITY`, `MAX_STORAGES`, `nextFree`,
//! `expandAllocator`, `eraseEntity`, `moveEntity`); the raw-byte-column plus
//! type-erased destructor idiom follows the teacher's `ComponentColumn`,
//! generalized here to a full move/destroy vtable ([`TypeInfo`]) and to
//! per-chunk `BitSet`s for tracked-component change detection.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::bitset::BitSet;
use crate::component::TypeInfo;
use crate::ids::{Entity, TypeUuid};

/// Default chunk count per archetype (§6.3 `archetype_chunk_max`).
pub const DEFAULT_MAX_CHUNKS: usize = 10;
/// Default starting row capacity of a freshly-initialised chunk
/// (§6.3 `archetype_starting_capacity`).
pub const DEFAULT_STARTING_CAPACITY: usize = 32;

/// Static per-type metadata for one column of an archetype.
#[derive(Clone, Copy)]
pub struct ColumnDescriptor {
    pub type_uuid: TypeUuid,
    pub info: TypeInfo,
    /// Whether writes to this column are recorded in a per-chunk change
    /// bitset (§3.3, §4.3.6).
    pub tracked: bool,
}

/// A manually-allocated, type-erased column: `capacity` contiguous elements
/// of `info.size` bytes, relocated via `info.move_construct` on growth.
///
/// Does not track how many of its elements are *live* — that is the owning
/// [`Chunk`]'s `size`. Dropping a `RawColumn` frees the backing allocation
/// without running any element destructor; callers must destroy live rows
/// themselves before the chunk (and its columns) are dropped.
struct RawColumn {
    info: TypeInfo,
    ptr: NonNull<u8>,
    capacity: usize,
}

impl RawColumn {
    fn empty(info: TypeInfo) -> Self {
        RawColumn { info, ptr: NonNull::dangling(), capacity: 0 }
    }

    fn layout_for(info: &TypeInfo, elems: usize) -> Layout {
        if info.size == 0 || elems == 0 {
            Layout::from_size_align(0, info.align.max(1)).unwrap()
        } else {
            Layout::from_size_align(info.size * elems, info.align).unwrap()
        }
    }

    /// Grows the backing allocation to `new_capacity` elements, relocating
    /// the first `live` elements via `info.move_construct`. A no-op if
    /// `new_capacity <= self.capacity`.
    fn grow_to(&mut self, new_capacity: usize, live: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        let new_layout = Self::layout_for(&self.info, new_capacity);
        let new_ptr = if new_layout.size() == 0 {
            NonNull::dangling()
        } else {
            let raw = unsafe { alloc(new_layout) };
            match NonNull::new(raw) {
                Some(p) => p,
                None => handle_alloc_error(new_layout),
            }
        };
        if live > 0 {
            unsafe { (self.info.move_construct)(new_ptr.as_ptr(), self.ptr.as_ptr(), live) };
        }
        if self.capacity > 0 {
            let old_layout = Self::layout_for(&self.info, self.capacity);
            if old_layout.size() > 0 {
                unsafe { dealloc(self.ptr.as_ptr(), old_layout) };
            }
        }
        self.ptr = new_ptr;
        self.capacity = new_capacity;
    }

    #[inline]
    fn row_ptr(&self, row: usize) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(row * self.info.size) }
    }
}

impl Drop for RawColumn {
    fn drop(&mut self) {
        if self.capacity > 0 {
            let layout = Self::layout_for(&self.info, self.capacity);
            if layout.size() > 0 {
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}

/// A fixed-capacity SoA storage slab within an archetype: an entity-ID
/// column, one raw column per component type, and a change bitset per
/// tracked type (§3.3).
pub(crate) struct Chunk {
    entities: Vec<Entity>,
    columns: Vec<RawColumn>,
    changes: Vec<Option<BitSet>>,
    size: usize,
    capacity: usize,
}

impl Chunk {
    fn new(descriptors: &[ColumnDescriptor]) -> Self {
        Chunk {
            entities: Vec::new(),
            columns: descriptors.iter().map(|d| RawColumn::empty(d.info)).collect(),
            changes: descriptors
                .iter()
                .map(|d| if d.tracked { Some(BitSet::with_capacity(0)) } else { None })
                .collect(),
            size: 0,
            capacity: 0,
        }
    }

    fn ensure_capacity(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        self.entities.resize(new_capacity, Entity::NULL);
        for column in &mut self.columns {
            column.grow_to(new_capacity, self.size);
        }
        for change in self.changes.iter_mut().flatten() {
            change.resize(new_capacity);
        }
        self.capacity = new_capacity;
    }

    #[inline]
    fn tail_space(&self) -> usize {
        self.capacity - self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities[..self.size]
    }

    /// # Safety
    /// `col_idx` must name a column whose component type is `T`.
    pub unsafe fn column_slice<T>(&self, col_idx: usize) -> &[T] {
        let col = &self.columns[col_idx];
        std::slice::from_raw_parts(col.ptr.as_ptr() as *const T, self.size)
    }

    /// # Safety
    /// `col_idx` must name a column whose component type is `T`.
    pub unsafe fn column_slice_mut<T>(&mut self, col_idx: usize) -> &mut [T] {
        let size = self.size;
        let col = &mut self.columns[col_idx];
        std::slice::from_raw_parts_mut(col.ptr.as_ptr() as *mut T, size)
    }

    pub fn is_changed(&self, col_idx: usize, row: usize) -> bool {
        self.changes[col_idx].as_ref().is_some_and(|b| b.contains(row))
    }

    pub fn mark_changed(&mut self, col_idx: usize, row: usize) {
        if let Some(bits) = &mut self.changes[col_idx] {
            bits.set(row);
        }
    }

    /// As [`Chunk::column_slice_mut`], but through a shared reference.
    ///
    /// # Safety
    /// The caller must ensure no other live reference (shared or mutable)
    /// to this column exists for the duration of the returned slice. Sound
    /// only because the system scheduler's conflict analysis
    /// (`SystemAccess::conflicts_with`) guarantees two systems that both
    /// access the same component type are never dispatched concurrently —
    /// the same invariant that lets `executor.rs`'s `SendPtr` hand out
    /// per-system `&World` references across threads.
    pub unsafe fn column_slice_mut_unchecked<T>(&self, col_idx: usize) -> &mut [T] {
        let col = &self.columns[col_idx];
        std::slice::from_raw_parts_mut(col.ptr.as_ptr() as *mut T, self.size)
    }

    /// As [`Chunk::mark_changed`], but through a shared reference. Same
    /// aliasing contract as [`Chunk::column_slice_mut_unchecked`].
    ///
    /// # Safety
    /// See [`Chunk::column_slice_mut_unchecked`].
    pub unsafe fn mark_changed_unchecked(&self, col_idx: usize, row: usize) {
        let ptr = &self.changes[col_idx] as *const Option<BitSet> as *mut Option<BitSet>;
        if let Some(bits) = &mut *ptr {
            bits.set(row);
        }
    }

    fn clear_changes(&mut self) {
        for change in self.changes.iter_mut().flatten() {
            change.clear_all();
        }
    }

    fn any_tracked(&self) -> bool {
        self.changes.iter().any(Option::is_some)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }
        for col in &mut self.columns {
            unsafe { (col.info.destroy)(col.row_ptr(0), self.size) };
        }
    }
}

#[derive(Clone, Copy)]
struct TransitionEdge {
    add_hash: u64,
    remove_hash: u64,
    dst: usize,
}

/// The set of primary component types an entity carries, canonicalised as a
/// sorted array of [`TypeUuid`]s, plus the chunked storage for every entity
/// currently carrying exactly that set (§3.3).
pub struct Archetype {
    pub(crate) descriptors: SmallVec<[ColumnDescriptor; 8]>,
    chunks: Vec<Option<Chunk>>,
    chunk_max: usize,
    starting_capacity: usize,
    expands: usize,
    pub(crate) type_set_hash: u64,
    transitions: Vec<TransitionEdge>,
}

impl Archetype {
    pub(crate) fn new(
        mut descriptors: SmallVec<[ColumnDescriptor; 8]>,
        chunk_max: usize,
        starting_capacity: usize,
        type_set_hash: u64,
    ) -> Self {
        descriptors.sort_by_key(|d| d.type_uuid);
        Archetype {
            descriptors,
            chunks: (0..chunk_max).map(|_| None).collect(),
            chunk_max,
            starting_capacity: starting_capacity.max(1),
            expands: 0,
            type_set_hash,
            transitions: Vec::new(),
        }
    }

    pub fn descriptors(&self) -> &[ColumnDescriptor] {
        &self.descriptors
    }

    pub fn column_index(&self, type_uuid: TypeUuid) -> Option<usize> {
        self.descriptors.binary_search_by_key(&type_uuid, |d| d.type_uuid).ok()
    }

    pub fn has_type(&self, type_uuid: TypeUuid) -> bool {
        self.column_index(type_uuid).is_some()
    }

    /// Whether `self`'s type set is a superset of `required` (used to
    /// resolve a query's smallest-archetype-count tie-break, §4.3.7).
    pub fn is_superset_of(&self, required: &[TypeUuid]) -> bool {
        required.iter().all(|&t| self.has_type(t))
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().flatten().map(|c| c.size()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn chunk_at(&self, idx: usize) -> Option<&Chunk> {
        self.chunks.get(idx).and_then(|c| c.as_ref())
    }

    pub(crate) fn chunk_at_mut(&mut self, idx: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(idx).and_then(|c| c.as_mut())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub(crate) fn iter_chunk_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks.iter().enumerate().filter(|(_, c)| c.is_some()).map(|(i, _)| i)
    }

    pub(crate) fn find_transition(&self, add_hash: u64, remove_hash: u64) -> Option<usize> {
        self.transitions
            .binary_search_by_key(&(add_hash, remove_hash), |e| (e.add_hash, e.remove_hash))
            .ok()
            .map(|i| self.transitions[i].dst)
    }

    pub(crate) fn add_transition(&mut self, add_hash: u64, remove_hash: u64, dst: usize) {
        let pos = self
            .transitions
            .binary_search_by_key(&(add_hash, remove_hash), |e| (e.add_hash, e.remove_hash))
            .unwrap_or_else(|i| i);
        self.transitions.insert(pos, TransitionEdge { add_hash, remove_hash, dst });
    }

    /// §4.3.1: first chunk with enough tail space, or the first
    /// uninitialised chunk slot. `None` if every chunk is initialised and
    /// full — the caller must [`Archetype::expand`] in that case.
    fn next_free(&self, count: usize) -> Option<usize> {
        for (i, slot) in self.chunks.iter().enumerate() {
            match slot {
                Some(chunk) if chunk.tail_space() >= count => return Some(i),
                None => return Some(i),
                _ => {}
            }
        }
        None
    }

    /// Picks chunk `expands % chunk_max`, doubling its capacity (moving
    /// every column via its type's move-constructor) and reusing the chunk
    /// index (§4.3.1).
    fn expand(&mut self) -> usize {
        let idx = self.expands % self.chunk_max;
        self.expands += 1;
        let descriptors = self.descriptors.clone();
        let chunk = self.chunks[idx].get_or_insert_with(|| Chunk::new(&descriptors));
        let new_cap = if chunk.capacity == 0 { self.starting_capacity } else { chunk.capacity * 2 };
        chunk.ensure_capacity(new_cap);
        idx
    }

    /// Reserves `count` contiguous, uninitialised rows and returns
    /// `(chunk_index, first_row)`. Grows or initialises chunks as needed.
    pub fn reserve_rows(&mut self, count: usize) -> (usize, usize) {
        let idx = match self.next_free(count) {
            Some(i) => i,
            None => self.expand(),
        };
        let descriptors = self.descriptors.clone();
        let chunk = self.chunks[idx].get_or_insert_with(|| Chunk::new(&descriptors));
        if chunk.tail_space() < count {
            let mut new_cap = chunk.capacity.max(self.starting_capacity);
            while new_cap - chunk.size < count {
                new_cap *= 2;
            }
            chunk.ensure_capacity(new_cap);
        }
        let first_row = chunk.size;
        chunk.size += count;
        (idx, first_row)
    }

    pub fn finish_entity(&mut self, chunk_idx: usize, row: usize, entity: Entity) {
        self.chunks[chunk_idx].as_mut().expect("chunk initialised by reserve_rows").entities[row] = entity;
    }

    fn write_single_from_ptr(&mut self, chunk_idx: usize, row: usize, col_idx: usize, src_ptr: *const u8) {
        let info = self.descriptors[col_idx].info;
        let chunk = self.chunks[chunk_idx].as_mut().expect("chunk initialised by reserve_rows");
        let dst_ptr = chunk.columns[col_idx].row_ptr(row);
        unsafe { (info.move_construct)(dst_ptr, src_ptr as *mut u8, 1) };
        chunk.mark_changed(col_idx, row);
    }

    /// Bulk-writes `count` contiguous values of one column starting at
    /// `first_row`, for the staging create-buffer drain (§4.8 step 1).
    pub fn write_column_bulk(&mut self, chunk_idx: usize, col_idx: usize, first_row: usize, count: usize, src_ptr: *const u8) {
        let info = self.descriptors[col_idx].info;
        let chunk = self.chunks[chunk_idx].as_mut().expect("chunk initialised by reserve_rows");
        let dst_ptr = chunk.columns[col_idx].row_ptr(first_row);
        unsafe { (info.move_construct)(dst_ptr, src_ptr as *mut u8, count) };
        for row in first_row..first_row + count {
            chunk.mark_changed(col_idx, row);
        }
    }

    pub fn write_entities_bulk(&mut self, chunk_idx: usize, first_row: usize, entities: &[Entity]) {
        let chunk = self.chunks[chunk_idx].as_mut().expect("chunk initialised by reserve_rows");
        chunk.entities[first_row..first_row + entities.len()].copy_from_slice(entities);
    }

    /// §4.3.2: add a brand-new entity (no prior archetype) with the given
    /// payloads (by [`TypeUuid`], raw pointer to a value to move-construct).
    pub fn add_entity(&mut self, entity: Entity, payloads: &[(TypeUuid, *const u8)]) -> (usize, usize) {
        let (chunk_idx, row) = self.reserve_rows(1);
        let descriptors = self.descriptors.clone();
        for (col_idx, desc) in descriptors.iter().enumerate() {
            if let Some(&(_, ptr)) = payloads.iter().find(|(t, _)| *t == desc.type_uuid) {
                self.write_single_from_ptr(chunk_idx, row, col_idx, ptr);
            }
        }
        self.finish_entity(chunk_idx, row, entity);
        (chunk_idx, row)
    }

    /// §5 "if src == dst": overwrites named columns of a resident entity in
    /// place and marks their change bits, without any row migration.
    pub fn overwrite_in_place(&mut self, chunk_idx: usize, row: usize, payloads: &[(TypeUuid, *const u8)]) {
        for &(type_uuid, ptr) in payloads {
            if let Some(col_idx) = self.column_index(type_uuid) {
                self.write_single_from_ptr(chunk_idx, row, col_idx, ptr);
            }
        }
    }

    /// §4.3.3: swap-with-last erase. `retired[col_idx] == true` means that
    /// column's value at `row` was already relocated elsewhere (by a
    /// migration) and must not be destroyed here, only overwritten.
    fn erase_entity_ex(&mut self, chunk_idx: usize, row: usize, retired: Option<&[bool]>) -> Option<Entity> {
        let descriptors = self.descriptors.clone();
        let chunk = self.chunks[chunk_idx].as_mut().expect("chunk must be initialised to erase from it");
        let last_row = chunk.size - 1;
        for (col_idx, desc) in descriptors.iter().enumerate() {
            let col = &mut chunk.columns[col_idx];
            let already_retired = retired.map(|r| r[col_idx]).unwrap_or(false);
            unsafe {
                if !already_retired {
                    (desc.info.destroy)(col.row_ptr(row), 1);
                }
                if last_row != row {
                    (desc.info.move_construct)(col.row_ptr(row), col.row_ptr(last_row), 1);
                }
            }
            if let Some(bits) = &mut chunk.changes[col_idx] {
                if last_row != row {
                    let carried = bits.contains(last_row);
                    bits.clear(last_row);
                    if carried {
                        bits.set(row);
                    } else {
                        bits.clear(row);
                    }
                } else {
                    bits.clear(row);
                }
            }
        }
        let swapped = if last_row != row {
            chunk.entities[row] = chunk.entities[last_row];
            Some(chunk.entities[row])
        } else {
            None
        };
        chunk.size -= 1;
        swapped
    }

    /// Erases a fully-deleted entity's row (every column destroyed).
    pub fn erase_entity(&mut self, chunk_idx: usize, row: usize) -> Option<Entity> {
        self.erase_entity_ex(chunk_idx, row, None)
    }

    fn relocate_one(
        src: &Archetype,
        src_chunk_idx: usize,
        src_row: usize,
        src_col_idx: usize,
        dst: &mut Archetype,
        dst_chunk_idx: usize,
        dst_row: usize,
        dst_col_idx: usize,
    ) {
        let info = dst.descriptors[dst_col_idx].info;
        let src_ptr = src.chunks[src_chunk_idx]
            .as_ref()
            .expect("src chunk initialised")
            .columns[src_col_idx]
            .row_ptr(src_row);
        let dst_chunk = dst.chunks[dst_chunk_idx].as_mut().expect("dst chunk initialised by reserve_rows");
        let dst_ptr = dst_chunk.columns[dst_col_idx].row_ptr(dst_row);
        unsafe { (info.move_construct)(dst_ptr, src_ptr, 1) };
        dst_chunk.mark_changed(dst_col_idx, dst_row);
    }

    /// §4.3.4: dst's types are a subset of src's. Moves every dst column's
    /// value from src, then erases the entity from src.
    pub fn remove_entity(
        src: &mut Archetype,
        src_chunk: usize,
        src_row: usize,
        dst: &mut Archetype,
        entity: Entity,
    ) -> ((usize, usize), Option<Entity>) {
        let (dst_chunk, dst_row) = dst.reserve_rows(1);
        let dst_descriptors = dst.descriptors.clone();
        let mut retired = vec![false; src.descriptors.len()];
        for (dst_col_idx, desc) in dst_descriptors.iter().enumerate() {
            if let Some(src_col_idx) = src.column_index(desc.type_uuid) {
                Archetype::relocate_one(src, src_chunk, src_row, src_col_idx, dst, dst_chunk, dst_row, dst_col_idx);
                retired[src_col_idx] = true;
            }
        }
        dst.finish_entity(dst_chunk, dst_row, entity);
        let swapped = src.erase_entity_ex(src_chunk, src_row, Some(&retired));
        ((dst_chunk, dst_row), swapped)
    }

    /// §4.3.5: dst's types are `src ∪ adds.keys() \ removes`. Payloads in
    /// `adds` are written directly (covers both genuinely new types and
    /// overrides of a type already on src); every other dst column is
    /// relocated from src; src is erased last.
    pub fn move_entity(
        src: &mut Archetype,
        src_chunk: usize,
        src_row: usize,
        dst: &mut Archetype,
        entity: Entity,
        adds: &[(TypeUuid, *const u8)],
    ) -> ((usize, usize), Option<Entity>) {
        let (dst_chunk, dst_row) = dst.reserve_rows(1);
        let dst_descriptors = dst.descriptors.clone();
        let mut retired = vec![false; src.descriptors.len()];
        for (dst_col_idx, desc) in dst_descriptors.iter().enumerate() {
            if let Some(&(_, ptr)) = adds.iter().find(|(t, _)| *t == desc.type_uuid) {
                dst.write_single_from_ptr(dst_chunk, dst_row, dst_col_idx, ptr);
            } else if let Some(src_col_idx) = src.column_index(desc.type_uuid) {
                Archetype::relocate_one(src, src_chunk, src_row, src_col_idx, dst, dst_chunk, dst_row, dst_col_idx);
                retired[src_col_idx] = true;
            }
        }
        dst.finish_entity(dst_chunk, dst_row, entity);
        let swapped = src.erase_entity_ex(src_chunk, src_row, Some(&retired));
        ((dst_chunk, dst_row), swapped)
    }

    /// §4.3.6: whether any column of this archetype is change-tracked.
    pub fn any_enabled_changes(&self) -> bool {
        self.descriptors.iter().any(|d| d.tracked)
    }

    /// Clears every tracked-type change bitset in every chunk (frame-end,
    /// §4.8 step 8). Only walked for archetypes with `any_enabled_changes`.
    pub fn clear_tracked_changes(&mut self) {
        for chunk in self.chunks.iter_mut().flatten() {
            if chunk.any_tracked() {
                chunk.clear_changes();
            }
        }
    }
}

/// Computes the destination type set for a transition on a cache miss
/// (§4.4 step 2): `(src ∪ adds) \ removes`, via a coordinated walk of the
/// two sorted inputs. `removes` must be sorted.
pub(crate) fn compute_transition_types(
    src: &[ColumnDescriptor],
    adds: &[(TypeUuid, TypeInfo, bool)],
    removes: &[TypeUuid],
) -> SmallVec<[ColumnDescriptor; 8]> {
    let mut result = SmallVec::new();
    let mut si = 0;
    let mut ai = 0;
    while si < src.len() || ai < adds.len() {
        match (src.get(si), adds.get(ai)) {
            (Some(s), Some(a)) => match s.type_uuid.cmp(&a.0) {
                std::cmp::Ordering::Less => {
                    if removes.binary_search(&s.type_uuid).is_err() {
                        result.push(*s);
                    }
                    si += 1;
                }
                std::cmp::Ordering::Greater => {
                    result.push(ColumnDescriptor { type_uuid: a.0, info: a.1, tracked: a.2 });
                    ai += 1;
                }
                std::cmp::Ordering::Equal => {
                    // "add" of a type already present overrides the value in
                    // place; the column itself (and its tracked flag) stays.
                    result.push(*s);
                    si += 1;
                    ai += 1;
                }
            },
            (Some(s), None) => {
                if removes.binary_search(&s.type_uuid).is_err() {
                    result.push(*s);
                }
                si += 1;
            }
            (None, Some(a)) => {
                result.push(ColumnDescriptor { type_uuid: a.0, info: a.1, tracked: a.2 });
                ai += 1;
            }
            (None, None) => unreachable!(),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::ids::ComponentKind;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Position {
        x: f32,
        y: f32,
    }
    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Velocity {
        x: f32,
    }

    fn descriptor<T: Component>(uuid: TypeUuid, tracked: bool) -> ColumnDescriptor {
        ColumnDescriptor { type_uuid: uuid, info: TypeInfo::of::<T>(), tracked }
    }

    fn uuid(kind: u16, slot: u16) -> TypeUuid {
        TypeUuid::new(ComponentKind(kind), slot)
    }

    #[test]
    fn add_and_read_entity() {
        let pos_uuid = uuid(1, 1);
        let mut arch = Archetype::new(smallvec::smallvec![descriptor::<Position>(pos_uuid, false)], 4, 4, 1);
        let e = Entity::new(1, 0);
        let value = Position { x: 1.0, y: 2.0 };
        let (chunk_idx, row) = arch.add_entity(e, &[(pos_uuid, &value as *const Position as *const u8)]);
        std::mem::forget(value);
        let chunk = arch.chunk_at(chunk_idx).unwrap();
        assert_eq!(chunk.entities()[row], e);
        let col_idx = arch.column_index(pos_uuid).unwrap();
        let slice = unsafe { chunk.column_slice::<Position>(col_idx) };
        assert_eq!(slice[row], Position { x: 1.0, y: 2.0 });
    }

    #[test]
    fn expansion_preserves_existing_rows() {
        let pos_uuid = uuid(1, 1);
        let mut arch = Archetype::new(smallvec::smallvec![descriptor::<Position>(pos_uuid, false)], 1, 2, 1);
        let mut entities = Vec::new();
        for i in 0..5u32 {
            let e = Entity::new(i + 1, 0);
            let v = Position { x: i as f32, y: 0.0 };
            arch.add_entity(e, &[(pos_uuid, &v as *const Position as *const u8)]);
            std::mem::forget(v);
            entities.push(e);
        }
        let chunk = arch.chunk_at(0).unwrap();
        assert_eq!(chunk.size(), 5);
        let col_idx = arch.column_index(pos_uuid).unwrap();
        let slice = unsafe { chunk.column_slice::<Position>(col_idx) };
        for (i, item) in slice.iter().enumerate().take(5) {
            assert_eq!(item.x, i as f32);
        }
    }

    #[test]
    fn erase_swaps_last_row_into_hole() {
        let pos_uuid = uuid(1, 1);
        let mut arch = Archetype::new(smallvec::smallvec![descriptor::<Position>(pos_uuid, false)], 4, 4, 1);
        let mut entities = Vec::new();
        let mut locs = Vec::new();
        for i in 0..3u32 {
            let e = Entity::new(i + 1, 0);
            let v = Position { x: i as f32, y: 0.0 };
            let loc = arch.add_entity(e, &[(pos_uuid, &v as *const Position as *const u8)]);
            std::mem::forget(v);
            entities.push(e);
            locs.push(loc);
        }
        let swapped = arch.erase_entity(locs[0].0, locs[0].1);
        assert_eq!(swapped, Some(entities[2]));
        let chunk = arch.chunk_at(0).unwrap();
        assert_eq!(chunk.size(), 2);
        assert_eq!(chunk.entities()[0], entities[2]);
    }

    #[test]
    fn move_entity_relocates_shared_columns_and_writes_new_ones() {
        let pos_uuid = uuid(1, 1);
        let vel_uuid = uuid(1, 2);
        let mut src = Archetype::new(smallvec::smallvec![descriptor::<Position>(pos_uuid, false)], 4, 4, 1);
        let mut dst = Archetype::new(
            smallvec::smallvec![descriptor::<Position>(pos_uuid, false), descriptor::<Velocity>(vel_uuid, false)],
            4,
            4,
            2,
        );
        let e = Entity::new(1, 0);
        let pos = Position { x: 3.0, y: 4.0 };
        let (chunk_idx, row) = src.add_entity(e, &[(pos_uuid, &pos as *const Position as *const u8)]);
        std::mem::forget(pos);

        let vel = Velocity { x: 9.0 };
        let ((dst_chunk, dst_row), swapped) =
            Archetype::move_entity(&mut src, chunk_idx, row, &mut dst, e, &[(vel_uuid, &vel as *const Velocity as *const u8)]);
        std::mem::forget(vel);
        assert!(swapped.is_none());
        assert_eq!(src.len(), 0);
        assert_eq!(dst.len(), 1);

        let dst_chunk_ref = dst.chunk_at(dst_chunk).unwrap();
        let pos_col = dst.column_index(pos_uuid).unwrap();
        let vel_col = dst.column_index(vel_uuid).unwrap();
        let positions = unsafe { dst_chunk_ref.column_slice::<Position>(pos_col) };
        let velocities = unsafe { dst_chunk_ref.column_slice::<Velocity>(vel_col) };
        assert_eq!(positions[dst_row], Position { x: 3.0, y: 4.0 });
        assert_eq!(velocities[dst_row].x, 9.0);
    }

    #[test]
    fn remove_entity_drops_types_not_in_dst() {
        let pos_uuid = uuid(1, 1);
        let vel_uuid = uuid(1, 2);
        let mut src = Archetype::new(
            smallvec::smallvec![descriptor::<Position>(pos_uuid, false), descriptor::<Velocity>(vel_uuid, false)],
            4,
            4,
            1,
        );
        let mut dst = Archetype::new(smallvec::smallvec![descriptor::<Position>(pos_uuid, false)], 4, 4, 2);
        let e = Entity::new(1, 0);
        let pos = Position { x: 1.0, y: 1.0 };
        let vel = Velocity { x: 2.0 };
        let (chunk_idx, row) =
            src.add_entity(e, &[(pos_uuid, &pos as *const Position as *const u8), (vel_uuid, &vel as *const Velocity as *const u8)]);
        std::mem::forget(pos);
        std::mem::forget(vel);

        let ((dst_chunk, dst_row), _swapped) = Archetype::remove_entity(&mut src, chunk_idx, row, &mut dst, e);
        assert_eq!(src.len(), 0);
        assert_eq!(dst.len(), 1);
        let pos_col = dst.column_index(pos_uuid).unwrap();
        let positions = unsafe { dst.chunk_at(dst_chunk).unwrap().column_slice::<Position>(pos_col) };
        assert_eq!(positions[dst_row], Position { x: 1.0, y: 1.0 });
    }

    #[test]
    fn tracked_changes_clear_at_frame_end() {
        let pos_uuid = uuid(1, 1);
        let mut arch = Archetype::new(smallvec::smallvec![descriptor::<Position>(pos_uuid, true)], 4, 4, 1);
        let e = Entity::new(1, 0);
        let v = Position { x: 0.0, y: 0.0 };
        let (chunk_idx, row) = arch.add_entity(e, &[(pos_uuid, &v as *const Position as *const u8)]);
        std::mem::forget(v);
        assert!(arch.chunk_at(chunk_idx).unwrap().is_changed(0, row));
        arch.clear_tracked_changes();
        assert!(!arch.chunk_at(chunk_idx).unwrap().is_changed(0, row));
    }
}
