//! Error types for the storage and transaction core.
//!
//! Errors form a closed set mirroring the error codes surfaced to callers.
//! Constraint and conflict errors are recoverable at the transaction
//! boundary; storage and corruption errors abort the in-flight commit and
//! propagate to the conglomerate.

use thiserror::Error;

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in the storage core.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure of the underlying persistent device or journal.
    ///
    /// Unrecoverable within the current transaction; the transaction is
    /// rolled back and the store may be marked read-only pending recovery.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A detected invariant violation: bad magic, an impossible row-state
    /// transition, or index/state disagreement the opening scan could not
    /// repair. The database must stop accepting writes.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A selected table was modified by a concurrently committed
    /// transaction and dirty-select strictness is enabled.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// A row modified by this transaction was removed by an intervening
    /// committed transaction.
    #[error("row conflict on table '{table}': row {row} was removed by a concurrent commit")]
    RowConflict { table: String, row: i64 },

    /// A UNIQUE or PRIMARY KEY constraint rejected a row.
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),

    /// A FOREIGN KEY constraint rejected an insert, delete or update.
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// A CHECK expression evaluated to false for a row.
    #[error("check constraint violation: {0}")]
    CheckViolation(String),

    /// A NOT NULL column received a null value.
    #[error("column '{0}' does not allow NULL values")]
    NotNullViolation(String),

    /// A write path was invoked on a read-only database.
    #[error("database is read-only")]
    ReadOnly,

    /// The persisted `database.version` value is not the accepted literal.
    #[error("database version mismatch: found '{found}', expected '{expected}'")]
    VersionMismatch { found: String, expected: String },

    /// A blocking wait was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// Bad configuration or bad API call ordering. No state was changed.
    #[error("{0}")]
    Usage(String),
}

impl Error {
    /// The stable error-code string surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "STORAGE_IO",
            Error::Corruption(_) => "CORRUPTION",
            Error::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            Error::RowConflict { .. } => "ROW_CONFLICT",
            Error::UniqueViolation(_) => "UNIQUE_VIOLATION",
            Error::ForeignKeyViolation(_) => "FK_VIOLATION",
            Error::CheckViolation(_) => "CHECK_VIOLATION",
            Error::NotNullViolation(_) => "NOT_NULL_VIOLATION",
            Error::ReadOnly => "READ_ONLY",
            Error::VersionMismatch { .. } => "VERSION_MISMATCH",
            Error::Cancelled => "CANCELLED",
            Error::Usage(_) => "USAGE",
        }
    }

    /// Whether the transaction may simply be retried after this error.
    ///
    /// True for conflicts and constraint violations; false for storage
    /// failures and corruption, which require operator attention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransactionConflict(_)
                | Error::RowConflict { .. }
                | Error::UniqueViolation(_)
                | Error::ForeignKeyViolation(_)
                | Error::CheckViolation(_)
                | Error::NotNullViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::ReadOnly.code(), "READ_ONLY");
        assert_eq!(Error::Cancelled.code(), "CANCELLED");
        assert_eq!(
            Error::RowConflict {
                table: "P".into(),
                row: 3
            }
            .code(),
            "ROW_CONFLICT"
        );
        assert_eq!(Error::Corruption("bad magic".into()).code(), "CORRUPTION");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), "STORAGE_IO");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::UniqueViolation("pk".into()).is_retryable());
        assert!(Error::TransactionConflict("t".into()).is_retryable());
        assert!(!Error::ReadOnly.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::NotNullViolation("name".into());
        assert_eq!(format!("{}", err), "column 'name' does not allow NULL values");
    }
}
