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

//! Type Registry (component A): stable numeric ids for component kinds and
//! for concrete component types within a kind.
//!
//! Mutation paths are serialized by a single lock (§5); lookups after a
//! type's first registration are served from a memoization cache guarded by
//! its own `RwLock`, so a repeat lookup only ever takes a read guard and
//! never contends with the mutation mutex.

use std::any::TypeId;
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::ids::{ComponentIndex, ComponentKind, TypeUuid};

struct KindTable {
    index_of_type: FxHashMap<TypeId, u16>,
    next_slot: u16,
    zero_type: Option<TypeId>,
}

impl KindTable {
    fn new() -> Self {
        KindTable {
            index_of_type: FxHashMap::default(),
            next_slot: 1,
            zero_type: None,
        }
    }
}

struct Inner {
    kind_of_marker: FxHashMap<TypeId, ComponentKind>,
    next_kind: u16,
    per_kind: FxHashMap<ComponentKind, KindTable>,
    next_component_index: u32,
    index_of_type: FxHashMap<TypeId, ComponentIndex>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            kind_of_marker: FxHashMap::default(),
            next_kind: 1,
            per_kind: FxHashMap::default(),
            next_component_index: 1,
            index_of_type: FxHashMap::default(),
        }
    }
}

/// Read-mostly memoization of `Inner`'s maps, kept eventually-consistent
/// with it under a separate `RwLock` so repeat lookups never have to
/// acquire `Inner`'s mutex.
struct Cache {
    kind_of_marker: FxHashMap<TypeId, ComponentKind>,
    index_of_type_id: FxHashMap<(ComponentKind, TypeId), TypeUuid>,
    component_index_of: FxHashMap<TypeId, ComponentIndex>,
}

impl Cache {
    fn new() -> Self {
        Cache {
            kind_of_marker: FxHashMap::default(),
            index_of_type_id: FxHashMap::default(),
            component_index_of: FxHashMap::default(),
        }
    }
}

/// Process-wide registry of component kinds and per-kind type tables.
///
/// Grounded on `original_source` `ComponentRegistry.h`'s two-level
/// kind→slot indirection; the locking discipline follows §5's "single
/// mutex on mutation paths, lock-free lookups after first registration".
pub struct TypeRegistry {
    inner: Mutex<Inner>,
    cache: RwLock<Cache>,
}

impl TypeRegistry {
    fn new() -> Self {
        TypeRegistry {
            inner: Mutex::new(Inner::new()),
            cache: RwLock::new(Cache::new()),
        }
    }

    /// The process-global registry instance.
    pub fn global() -> &'static TypeRegistry {
        static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();
        REGISTRY.get_or_init(TypeRegistry::new)
    }

    /// Idempotent: assigns kind 1, 2, … on first call for a given marker
    /// type `K`; kind 0 is reserved and never returned here.
    pub fn kind_of<K: 'static>(&self) -> ComponentKind {
        let marker = TypeId::of::<K>();
        if let Some(kind) = self.cache.read().kind_of_marker.get(&marker) {
            return *kind;
        }

        let mut inner = self.inner.lock();
        let kind = if let Some(kind) = inner.kind_of_marker.get(&marker) {
            *kind
        } else {
            let kind = ComponentKind(inner.next_kind);
            inner.next_kind += 1;
            inner.kind_of_marker.insert(marker, kind);
            inner.per_kind.insert(kind, KindTable::new());
            tracing::debug!(kind = kind.0, "registered component kind");
            kind
        };
        drop(inner);

        self.cache.write().kind_of_marker.insert(marker, kind);
        kind
    }

    /// Dense per-kind index for a concrete component type, starting at 1;
    /// also assigns (on first call for that type, process-wide) a
    /// globally-unique [`ComponentIndex`].
    pub fn index_of<T: 'static>(&self, kind: ComponentKind) -> TypeUuid {
        self.index_of_type_id(TypeId::of::<T>(), kind)
    }

    /// As [`TypeRegistry::index_of`], but takes an already-erased
    /// [`TypeId`]. Used by [`crate::component::Bundle`]-driven call sites
    /// (`World::add`/`World::remove`) that only have `Bundle::type_ids()`'s
    /// erased ids to work with, not the concrete types themselves.
    pub fn index_of_type_id(&self, type_id: TypeId, kind: ComponentKind) -> TypeUuid {
        if let Some(uuid) = self.cache.read().index_of_type_id.get(&(kind, type_id)) {
            return *uuid;
        }

        let mut inner = self.inner.lock();

        let component_index = if let Some(&idx) = inner.index_of_type.get(&type_id) {
            idx
        } else {
            let idx = ComponentIndex(inner.next_component_index);
            inner.next_component_index += 1;
            inner.index_of_type.insert(type_id, idx);
            idx
        };

        let table = inner.per_kind.entry(kind).or_insert_with(KindTable::new);

        let uuid = if let Some(&slot) = table.index_of_type.get(&type_id) {
            TypeUuid::new(kind, slot)
        } else {
            let slot = table.next_slot;
            table.next_slot += 1;
            table.index_of_type.insert(type_id, slot);
            tracing::debug!(kind = kind.0, slot, "registered component type");
            TypeUuid::new(kind, slot)
        };
        drop(inner);

        let mut cache = self.cache.write();
        cache.component_index_of.insert(type_id, component_index);
        cache.index_of_type_id.insert((kind, type_id), uuid);
        uuid
    }

    /// The process-global [`ComponentIndex`] for a type already registered
    /// via [`TypeRegistry::index_of`]. Returns `None` if the type was never
    /// registered under any kind.
    pub fn component_index_of<T: 'static>(&self) -> Option<ComponentIndex> {
        let type_id = TypeId::of::<T>();
        if let Some(idx) = self.cache.read().component_index_of.get(&type_id) {
            return Some(*idx);
        }

        let idx = self.inner.lock().index_of_type.get(&type_id).copied()?;
        self.cache.write().component_index_of.insert(type_id, idx);
        Some(idx)
    }

    /// Declares that `T` is the null/"absent" type of `kind` — used by
    /// categories that have a semantic absent value (e.g. names). Must be
    /// called before any other registration under `kind`, or it panics: the
    /// null type must always be slot 0.
    pub fn zero_index<T: 'static>(&self, kind: ComponentKind) {
        let type_id = TypeId::of::<T>();
        let mut inner = self.inner.lock();
        let table = inner.per_kind.entry(kind).or_insert_with(KindTable::new);
        assert!(
            table.zero_type.is_none() && table.next_slot == 1,
            "zero_index must be called before any other registration for this kind"
        );
        table.zero_type = Some(type_id);
        table.index_of_type.insert(type_id, 0);
        table.next_slot = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PrimaryMarker;
    struct SecondaryMarker;
    struct Position;
    struct Velocity;

    #[test]
    fn kind_assignment_is_idempotent() {
        let reg = TypeRegistry::new();
        let a = reg.kind_of::<PrimaryMarker>();
        let b = reg.kind_of::<PrimaryMarker>();
        assert_eq!(a, b);
        assert!(!a.is_null());
    }

    #[test]
    fn different_kinds_get_different_numbers() {
        let reg = TypeRegistry::new();
        let a = reg.kind_of::<PrimaryMarker>();
        let b = reg.kind_of::<SecondaryMarker>();
        assert_ne!(a, b);
    }

    #[test]
    fn index_of_is_dense_starting_at_one() {
        let reg = TypeRegistry::new();
        let kind = reg.kind_of::<PrimaryMarker>();
        let pos = reg.index_of::<Position>(kind);
        let vel = reg.index_of::<Velocity>(kind);
        assert_eq!(pos.slot(), 1);
        assert_eq!(vel.slot(), 2);
        assert_eq!(pos.kind(), kind);
    }

    #[test]
    fn index_of_is_idempotent() {
        let reg = TypeRegistry::new();
        let kind = reg.kind_of::<PrimaryMarker>();
        let a = reg.index_of::<Position>(kind);
        let b = reg.index_of::<Position>(kind);
        assert_eq!(a, b);
    }

    #[test]
    fn component_index_is_globally_unique_across_kinds() {
        let reg = TypeRegistry::new();
        let k1 = reg.kind_of::<PrimaryMarker>();
        let k2 = reg.kind_of::<SecondaryMarker>();
        reg.index_of::<Position>(k1);
        reg.index_of::<Velocity>(k2);
        let ci_pos = reg.component_index_of::<Position>().unwrap();
        let ci_vel = reg.component_index_of::<Velocity>().unwrap();
        assert_ne!(ci_pos, ci_vel);
    }

    /// After first registration, repeat lookups must be servable while the
    /// mutation mutex stays held elsewhere - a plain `Mutex`-only lookup
    /// would deadlock here instead of reading through the cache.
    #[test]
    fn repeat_lookups_do_not_take_the_mutation_lock() {
        let reg = TypeRegistry::new();
        let kind = reg.kind_of::<PrimaryMarker>();
        let pos = reg.index_of::<Position>(kind);
        let ci = reg.component_index_of::<Position>().unwrap();

        let _held = reg.inner.lock();
        assert_eq!(reg.kind_of::<PrimaryMarker>(), kind);
        assert_eq!(reg.index_of::<Position>(kind), pos);
        assert_eq!(reg.component_index_of::<Position>(), Some(ci));
    }
}
