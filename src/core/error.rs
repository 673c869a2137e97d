use thiserror::Error;

use crate::core::types::{InstanceToken, RepoKey, RowId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrmError {
    #[error("Entity of table '{table}' is deleted; cannot {operation} (rollback to recover)")]
    DeletedAccess { table: String, operation: String },

    #[error("Entity of table '{table}' is deleted and committed; cannot {operation}")]
    TerminalAccess { table: String, operation: String },

    #[error("Instance token {token} is already registered under {key}")]
    DuplicateToken { key: RepoKey, token: InstanceToken },

    #[error("Row id {row_id} is already tracked under {key}")]
    DuplicateRowId { key: RepoKey, row_id: RowId },

    #[error("Cannot move entity to row id {row_id}: already tracked under {key}")]
    RowIdCollision { key: RepoKey, row_id: RowId },

    #[error("No row id left to assign in {0}")]
    RowIdExhausted(RepoKey),

    #[error("Inconsistent repository state: {0}")]
    InconsistentState(String),

    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrmError {
    /// Only a deleted-but-uncommitted entity can be brought back (via `rollback`).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DeletedAccess { .. })
    }

    /// Repository bookkeeping failures. These are programming errors and are never retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateToken { .. }
                | Self::DuplicateRowId { .. }
                | Self::RowIdCollision { .. }
                | Self::InconsistentState(_)
        )
    }

    pub(crate) fn deleted(table: &str, operation: &str) -> Self {
        Self::DeletedAccess {
            table: table.to_string(),
            operation: operation.to_string(),
        }
    }

    pub(crate) fn terminal(table: &str, operation: &str) -> Self {
        Self::TerminalAccess {
            table: table.to_string(),
            operation: operation.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrmError>;
