// ============================================================================
// memorm Library
// ============================================================================
//
// Identity map and event-driven consistency engine of an ORM runtime:
//
// - `event`      per-instance synchronous publish/subscribe
// - `entity`     rows with baseline, dirty tracking and lifecycle; relations
// - `repository` bounded (table, connection, row id) -> entity map
// - `manager`    in-memory manager collaborator
//
// Everything here is single-threaded and synchronous. SQL, drivers and
// retries live in the surrounding persistence layer.
//
// ============================================================================

pub mod core;
pub mod entity;
pub mod event;
pub mod manager;
pub mod prelude;
pub mod repository;

// Re-export main types for convenience
pub use crate::core::{FieldMap, InstanceToken, OrmError, RepoKey, Result, RowId, Value};
pub use crate::entity::{DisposeGuard, Entity, EntityBuilder, EntityLookup, Relation, RelationDef};
pub use crate::event::{Announceable, Announcer, Event, EventKind};
pub use crate::manager::MemoryManager;
pub use crate::repository::{Repository, RepositoryConfig};
