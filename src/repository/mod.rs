// ============================================================================
// Repository Module
// ============================================================================
//
// Bounded identity map partitioned by (table, connection). Guarantees at most
// one tracked entity per row id and keeps its indices correct by listening to
// the entities it tracks. Capacity overflow clears everything and carries on.
//
// ============================================================================

pub mod config;
pub mod repository;

pub use config::{DEFAULT_MAX_ENTITIES, MAX_ENTITIES_ENV, RepositoryConfig};
pub use repository::Repository;
