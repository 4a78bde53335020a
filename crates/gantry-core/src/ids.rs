//! Strongly-typed identifiers for domain entities.
//!
//! Tasks and runners live in flat arenas owned by the simulation; relations
//! between them (dependencies, assignments) are stored as index newtypes
//! rather than owning pointers, which keeps lookups O(1) and avoids
//! reference cycles between tasks and the runners executing them.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_index_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub usize);

        impl $name {
            pub fn index(&self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }
    };
}

define_index_id!(TaskId, "tsk");
define_index_id!(RunnerId, "rnr");
