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

//! Error taxonomy (SPEC_FULL §7).
//!
//! Stale-entity handling is not represented here: it is recoverable and
//! silently ignored at the call site (`delete`/`add`/`remove` become no-ops,
//! `query.get` returns `None`) rather than surfaced as an `Err`. Everything
//! in this enum is either fatal (registration/invariant) or a recoverable
//! condition the caller must decide how to react to (missing dependency).

use std::fmt;

/// ECS error type.
#[derive(Debug, Clone)]
pub enum EcsError {
    /// A registered system's `hard_deps` form a cycle (§4.9.2). Fatal at
    /// registration: the system is rejected.
    CyclicSystemDependency { system: &'static str, chain: Vec<&'static str> },

    /// A system's declared reads/writes reference a component type that was
    /// never registered with the [`crate::registry::TypeRegistry`].
    UnregisteredAccessType { system: &'static str },

    /// Two stages were registered under the same stage id.
    StageConflict { stage: &'static str },

    /// A system was rejected during registration and is not present in any
    /// stage's execution graph.
    SystemNotFound,

    /// A null-entity staging record was observed during synchronization.
    /// §9 Open Questions: treated as an error rather than a silent skip.
    NullEntityOperation,

    /// A debug-assertion-guarded invariant did not hold (entity metadata
    /// pointing at a disagreeing archetype/chunk/row). Fatal: indicates
    /// storage corruption, not a recoverable condition.
    InvariantViolation(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::CyclicSystemDependency { system, chain } => {
                write!(f, "cyclic hard-dependency involving system '{system}': {chain:?}")
            }
            EcsError::UnregisteredAccessType { system } => {
                write!(f, "system '{system}' declares access to an unregistered component type")
            }
            EcsError::StageConflict { stage } => write!(f, "stage '{stage}' already registered"),
            EcsError::SystemNotFound => write!(f, "system not found"),
            EcsError::NullEntityOperation => write!(f, "staging record referenced the null entity"),
            EcsError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias.
pub type Result<T> = std::result::Result<T, EcsError>;
