//! Convenient re-exports of commonly used types.
//!
//! The prelude can be imported with:
//! ```
//! use archetype_ecs::prelude::*;
//! ```

pub use crate::component::{Bundle, Component};
pub use crate::config::WorldConfig;
pub use crate::error::{EcsError, Result};
pub use crate::ids::{ComponentKind, Entity, TypeUuid};
pub use crate::query::{Query, QueryFetch, QueryTuple};
pub use crate::schedule::{ScheduleModel, Stage, StageRegistry};
pub use crate::system::{BoxedSystem, System, SystemAccess, SystemId};
pub use crate::time::Time;
pub use crate::world::World;
