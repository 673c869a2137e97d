// ============================================================================
// Entity Module
// ============================================================================
//
// In-memory rows with a committed baseline, incremental dirty tracking and a
// delete / commit / rollback lifecycle. Every mutation is announced so that
// the repository and relations can keep their indices in step.
//
// ============================================================================

pub mod entity;
pub mod relation;

pub use entity::{DisposeGuard, Entity, EntityBuilder, WeakEntity};
pub use relation::{EntityLookup, Relation, RelationDef};
