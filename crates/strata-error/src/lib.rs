//! Error types for the Strata hash join engine.
//!
//! Every public API in the workspace returns [`Result`]. The engine never
//! retries internally: the first error a worker hits is recorded once and
//! surfaced from the stage that was running.
//!
//! [`BatchFormatError`] lives here, beside [`StrataError`], so the engine
//! wraps it structurally; `strata-batch` re-exports it alongside the batch
//! types.

use std::fmt;

use thiserror::Error;

/// Errors raised when assembling or reading a column batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchFormatError {
    /// Columns of one batch disagree on row count.
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    /// A batch's column count does not match the schema it is used with.
    SchemaMismatch {
        expected_columns: usize,
        actual_columns: usize,
    },
    /// A value does not fit the column's declared type.
    TypeMismatch { column: String, expected: String },
    /// Column index past the end of the schema.
    ColumnIndexOutOfBounds { index: usize, count: usize },
    /// Row index past the end of the batch.
    RowIndexOutOfBounds { row: usize, rows: usize },
    /// A variable-width column's offsets do not cover its byte buffer.
    OffsetOutOfBounds {
        column: String,
        row: usize,
        start: usize,
        end: usize,
        bytes_len: usize,
    },
}

impl fmt::Display for BatchFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColumnLengthMismatch {
                column,
                expected,
                actual,
            } => write!(
                f,
                "column {column} has {actual} rows, batch expects {expected}"
            ),
            Self::SchemaMismatch {
                expected_columns,
                actual_columns,
            } => write!(
                f,
                "batch has {actual_columns} columns, schema expects {expected_columns}"
            ),
            Self::TypeMismatch { column, expected } => {
                write!(f, "value does not fit column {column} of type {expected}")
            }
            Self::ColumnIndexOutOfBounds { index, count } => {
                write!(f, "column index {index} out of bounds for {count} columns")
            }
            Self::RowIndexOutOfBounds { row, rows } => {
                write!(f, "row index {row} out of bounds for {rows} rows")
            }
            Self::OffsetOutOfBounds {
                column,
                row,
                start,
                end,
                bytes_len,
            } => write!(
                f,
                "column {column} has invalid offset range [{start}, {end}) for row {row} \
                 (bytes_len={bytes_len})"
            ),
        }
    }
}

impl std::error::Error for BatchFormatError {}

/// Unified error type for build and probe execution.
#[derive(Debug, Error)]
pub enum StrataError {
    /// The external cancellation signal was observed.
    #[error("query cancelled")]
    Cancelled,

    /// The memory tracker refused an allocation.
    #[error("memory quota exceeded: requested {requested} bytes, limit {limit} bytes")]
    OutOfQuota { requested: usize, limit: usize },

    /// A build or probe batch source failed while producing input.
    #[error("upstream source error: {0}")]
    Upstream(String),

    /// The residual-predicate evaluator failed on a candidate batch.
    #[error("residual predicate error: {0}")]
    Predicate(String),

    /// A structural invariant did not hold. Impossible in a correct build;
    /// surfaces instead of corrupting memory or looping forever.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// A batch handed across the engine interface was malformed.
    #[error("batch format error: {0}")]
    Batch(#[from] BatchFormatError),
}

impl StrataError {
    /// Wrap an upstream source failure.
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Self::Upstream(err.to_string())
    }

    /// Wrap a residual-predicate evaluator failure.
    pub fn predicate(err: impl std::fmt::Display) -> Self {
        Self::Predicate(err.to_string())
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, StrataError>;
