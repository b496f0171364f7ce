//! System trait and access metadata (SPEC_FULL §4.9.1, §4.9.2).
//!
//! Extends the teacher's `SystemAccess::conflicts_with`/`System`/
//! `BoxedSystem` with `res_reads`/`res_writes` (systems referenced by
//! resource) and `hard_deps` (explicit ordering by system name) per the
//! distilled spec's per-stage descriptor.

use std::any::TypeId;

use smallvec::SmallVec;

use crate::error::Result;
use crate::World;

/// Opaque system identifier: its index within a stage's registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub u32);

/// A per-stage system descriptor's declared reads/writes (§4.9.1, §4.9.2).
#[derive(Debug, Clone, Default)]
pub struct SystemAccess {
    pub reads: SmallVec<[TypeId; 8]>,
    pub writes: SmallVec<[TypeId; 8]>,
    /// Other systems (by name) this system reads by resource reference.
    pub res_reads: SmallVec<[&'static str; 4]>,
    /// Other systems (by name) this system writes by resource reference.
    pub res_writes: SmallVec<[&'static str; 4]>,
    /// Systems that must run before this one in the same stage, regardless
    /// of whether they conflict (§4.9.1 `hard_deps`).
    pub hard_deps: SmallVec<[&'static str; 4]>,
}

impl SystemAccess {
    /// Create empty access
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn reads<T: 'static>(mut self) -> Self {
        self.reads.push(TypeId::of::<T>());
        self
    }

    pub fn writes<T: 'static>(mut self) -> Self {
        self.writes.push(TypeId::of::<T>());
        self
    }

    pub fn reads_resource(mut self, system: &'static str) -> Self {
        self.res_reads.push(system);
        self
    }

    pub fn writes_resource(mut self, system: &'static str) -> Self {
        self.res_writes.push(system);
        self
    }

    pub fn depends_on(mut self, system: &'static str) -> Self {
        self.hard_deps.push(system);
        self
    }

    /// §4.9.2: two systems conflict iff one writes a component type the
    /// other reads or writes, or one writes a resource the other reads or
    /// writes by resource reference.
    pub fn conflicts_with(&self, other: &SystemAccess) -> bool {
        for w in &self.writes {
            if other.writes.contains(w) || other.reads.contains(w) {
                return true;
            }
        }
        for r in &self.reads {
            if other.writes.contains(r) {
                return true;
            }
        }
        for w in &self.res_writes {
            if other.res_writes.contains(w) || other.res_reads.contains(w) {
                return true;
            }
        }
        for r in &self.res_reads {
            if other.res_writes.contains(r) {
                return true;
            }
        }
        false
    }
}

/// An application-defined unit of computation registered into one or more
/// stages (§4.9.1). `run` receives shared access to the [`World`]; the
/// scheduler's static proof that concurrently dispatched systems never
/// conflict is what makes `&World` sufficient even though systems mutate
/// component data through queries.
pub trait System: Send + Sync {
    /// Get system access metadata
    fn access(&self) -> SystemAccess;

    /// Get system name
    fn name(&self) -> &'static str;

    /// Run system
    fn run(&mut self, world: &World) -> Result<()>;
}

/// Boxed system
pub type BoxedSystem = Box<dyn System>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_access_conflicts() {
        let access1 = SystemAccess::empty().writes::<i32>();
        let access2 = SystemAccess::empty().writes::<i32>();
        assert!(access1.conflicts_with(&access2));
    }

    #[test]
    fn test_system_access_no_conflicts() {
        let access1 = SystemAccess::empty().reads::<i32>();
        let access2 = SystemAccess::empty().reads::<i32>();
        assert!(!access1.conflicts_with(&access2));
    }

    #[test]
    fn write_read_conflicts() {
        let a = SystemAccess::empty().writes::<i32>();
        let b = SystemAccess::empty().reads::<i32>();
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn resource_write_conflicts_with_resource_read() {
        let a = SystemAccess::empty().writes_resource("physics");
        let b = SystemAccess::empty().reads_resource("physics");
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn disjoint_access_does_not_conflict() {
        let a = SystemAccess::empty().writes::<i32>();
        let b = SystemAccess::empty().writes::<u8>();
        assert!(!a.conflicts_with(&b));
    }
}
