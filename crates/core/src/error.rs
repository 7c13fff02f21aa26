//! Core error model.

use thiserror::Error;

use crate::table::ColumnType;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building identifiers or tables.
///
/// These are deterministic input failures; IO and backend errors live in
/// `vizcache-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. an empty identifier).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A value of the wrong type was pushed into a column.
    #[error("column `{column}` expects {expected:?}, got {found:?}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },

    /// A column does not have the table's row count.
    #[error("column `{column}` has {found} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    /// Two tables could not be combined.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }
}
