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

//! Component and Bundle traits, and the dynamic type-info descriptor that
//! storage and staging use to move/destroy component bytes without any
//! generic dispatch after registration (SPEC_FULL §3.8, §6.4).

use std::any::TypeId;

use smallvec::{smallvec, SmallVec};

use crate::ids::{ComponentKind, TypeUuid};
use crate::registry::TypeRegistry;

/// Maximum number of components supported by a single `Bundle` tuple.
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for components. Components must be `'static` (no borrowed
/// data) and `Send + Sync` so they can cross the staging/scheduler thread
/// boundary freely.
pub trait Component: 'static + Send + Sync {}

impl<T: 'static + Send + Sync> Component for T {}

/// The "dynamic type info consumed from external collaborators" of
/// SPEC_FULL §6.4: everything the archetype storage needs to relocate or
/// drop a component's bytes without knowing its Rust type. Built once at
/// registration and copied by value into every column descriptor that
/// holds this type.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    pub type_id: TypeId,
    pub size: usize,
    pub align: usize,
    /// Relocates `count` contiguous values from `src` to `dst` without
    /// re-running any destructor at `src` — Rust has no user-level move
    /// constructor, so "move" is the same bitwise relocation `Vec`
    /// reallocation performs internally.
    pub move_construct: unsafe fn(dst: *mut u8, src: *mut u8, count: usize),
    /// Drops `count` contiguous values in place.
    pub destroy: unsafe fn(ptr: *mut u8, count: usize),
    /// Present only when the component implements `Clone`.
    pub copy_construct: Option<unsafe fn(dst: *mut u8, src: *const u8, count: usize)>,
}

impl TypeInfo {
    pub fn of<T: Component>() -> Self {
        TypeInfo {
            type_id: TypeId::of::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            move_construct: move_construct::<T>,
            destroy: destroy::<T>,
            copy_construct: None,
        }
    }

    pub fn of_clone<T: Component + Clone>() -> Self {
        TypeInfo {
            copy_construct: Some(copy_construct::<T>),
            ..Self::of::<T>()
        }
    }
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("type_id", &self.type_id)
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

unsafe fn move_construct<T>(dst: *mut u8, src: *mut u8, count: usize) {
    std::ptr::copy_nonoverlapping(src as *const T, dst as *mut T, count);
}

unsafe fn destroy<T>(ptr: *mut u8, count: usize) {
    let slice = std::ptr::slice_from_raw_parts_mut(ptr as *mut T, count);
    std::ptr::drop_in_place(slice);
}

unsafe fn copy_construct<T: Clone>(dst: *mut u8, src: *const u8, count: usize) {
    for i in 0..count {
        let value = (*(src as *const T).add(i)).clone();
        std::ptr::write((dst as *mut T).add(i), value);
    }
}

/// A bundle of components that can be spawned onto an entity in one call.
/// Implemented for tuples of up to [`MAX_BUNDLE_COMPONENTS`] components.
pub trait Bundle: Send + Sync + 'static {
    /// Type ids in declaration order — the same order `write_components`
    /// expects its `ptrs` slice to be in.
    fn type_ids() -> SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Type-info descriptors, positionally aligned with [`Bundle::type_ids`].
    fn type_infos() -> SmallVec<[TypeInfo; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Writes each field of the bundle into the pointer at the same
    /// position in `ptrs` (declaration order, not canonical/sorted order —
    /// callers are responsible for resolving declaration position to a
    /// storage column before calling this).
    ///
    /// # Safety
    /// Each pointer must be valid, writable, and aligned for its
    /// corresponding field's type.
    unsafe fn write_components(self, ptrs: &[*mut u8]);
}

macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> Bundle for ($($T,)*) {
            fn type_ids() -> SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(TypeId::of::<$T>()),*]
            }

            fn type_infos() -> SmallVec<[TypeInfo; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(TypeInfo::of::<$T>()),*]
            }

            #[allow(non_snake_case)]
            unsafe fn write_components(self, ptrs: &[*mut u8]) {
                let ($($T,)*) = self;
                let mut i = 0;
                $(
                    std::ptr::write(ptrs[i] as *mut $T, $T);
                    i += 1;
                )*
                let _ = i;
            }
        }
    };
}

impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    #![allow(dead_code)]
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy)]
    struct Velocity {
        x: f32,
    }

    #[test]
    fn single_component_bundle() {
        let type_ids = <(Position,)>::type_ids();
        assert_eq!(type_ids.len(), 1);
        assert_eq!(type_ids[0], TypeId::of::<Position>());
    }

    #[test]
    fn multi_component_bundle() {
        let type_ids = <(Position, Velocity)>::type_ids();
        assert_eq!(type_ids.len(), 2);
        let infos = <(Position, Velocity)>::type_infos();
        assert_eq!(infos[0].size, std::mem::size_of::<Position>());
        assert_eq!(infos[1].size, std::mem::size_of::<Velocity>());
    }

    #[test]
    fn move_construct_relocates_bytes() {
        let mut src = Position { x: 1.0, y: 2.0 };
        let mut dst = std::mem::MaybeUninit::<Position>::uninit();
        unsafe {
            move_construct::<Position>(dst.as_mut_ptr() as *mut u8, &mut src as *mut _ as *mut u8, 1);
            let moved = dst.assume_init();
            assert_eq!(moved.x, 1.0);
            assert_eq!(moved.y, 2.0);
        }
    }
}
