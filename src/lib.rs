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

//! A high-throughput entity-component-system runtime.
//!
//! Entities live in one of three storages depending on how they're
//! accessed: the primary chunked archetype storage (dense iteration via
//! [`World::query`]), a secondary sparse storage for components that are
//! rarely iterated but frequently point-accessed ([`World::add_secondary`]),
//! and a boolean tag storage for marker components with no payload
//! ([`World::add_tag`]). Structural changes against the primary storage
//! (creates, adds, removes, deletes) are staged and only committed at
//! [`World::end_frame`]; secondary and tag storage mutate immediately.
//!
//! Systems are registered onto named [`Stage`]s and scheduled by
//! [`DependencyGraph`] from their declared [`SystemAccess`], then run
//! through an [`ExecutionGraph`] that dispatches each system as soon as
//! its predecessors complete.

pub mod archetype;
pub mod bitset;
pub mod component;
pub mod config;
pub mod dependency;
pub mod entity;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ids;
pub mod parallel;
pub mod query;
pub mod registry;
pub mod schedule;
pub mod secondary;
pub mod staging;
pub mod system;
pub mod tags;
pub mod time;
pub mod world;

pub mod prelude;

pub use archetype::Archetype;
pub use component::{Bundle, Component, TypeInfo};
pub use config::WorldConfig;
pub use dependency::{DependencyGraph, ExecutionModel};
pub use entity::{EntityAllocator, WorkerId};
pub use error::{EcsError, Result};
pub use executor::{ExecutionGraph, NodeMetricsData, StageMetrics};
pub use graph::ArchetypeGraph;
pub use ids::{ComponentIndex, ComponentKind, Entity, TypeUuid};
pub use query::{Query, QueryFetch, QueryTuple};
pub use registry::TypeRegistry;
pub use schedule::{ScheduleModel, Stage, StageRegistry};
pub use system::{BoxedSystem, System, SystemAccess, SystemId};
pub use time::Time;
pub use world::World;
