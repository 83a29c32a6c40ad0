//! Store errors.
//!
//! Everything redb or serde reports is flattened into [`StateError::Storage`]
//! tagged with the step that failed; services only ever branch on
//! [`StateError::NotFound`].

use std::fmt;

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// The store step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Open,
    Transaction,
    Table,
    Read,
    Write,
    Serialize,
    Deserialize,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::Open => "open",
            StoreOp::Transaction => "transaction",
            StoreOp::Table => "table",
            StoreOp::Read => "read",
            StoreOp::Write => "write",
            StoreOp::Serialize => "encode",
            StoreOp::Deserialize => "decode",
        })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store {op} failed: {reason}")]
    Storage { op: StoreOp, reason: String },

    /// A row that must exist for the operation (a tenant being charged,
    /// a group being updated) is absent.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StateError {
    pub fn storage(op: StoreOp, reason: impl Into<String>) -> Self {
        StateError::Storage {
            op,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_name_the_failed_step() {
        let err = StateError::storage(StoreOp::Deserialize, "expected value at line 1");
        assert_eq!(err.to_string(), "state store decode failed: expected value at line 1");
        assert!(!err.is_not_found());
        assert!(StateError::NotFound("tenant".into()).is_not_found());
    }
}
