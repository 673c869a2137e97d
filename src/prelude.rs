//! Common imports for code that drives entities directly.
//!
//! `use memorm::prelude::*;` brings in the entity, relation and repository
//! types together with the `Announceable` trait their subscription methods
//! come from.

pub use crate::core::{FieldMap, ID_FIELD, InstanceToken, OrmError, RepoKey, Result, RowId, Value};
pub use crate::entity::{DisposeGuard, Entity, EntityLookup, Relation, RelationDef};
pub use crate::event::{Announceable, Event, EventKind};
pub use crate::manager::MemoryManager;
pub use crate::repository::{Repository, RepositoryConfig};
