// ============================================================================
// Manager Module
// ============================================================================
//
// Reference implementation of the manager side of the core: builds entities
// from rows, registers them with a repository and commits or deletes them
// around its own writes. Storage is a plain in-memory table; no I/O.
//
// ============================================================================

pub mod memory;

pub use memory::MemoryManager;
