//! Error taxonomy for connection, statement and cursor operations.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by this layer. Nothing here is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation was attempted on a connection whose native handle is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Bind argument count differs from the statement's parameter count.
    #[error("expected {expected} bind arguments but {actual} were provided")]
    BindArgumentCount { expected: usize, actual: usize },

    /// The native engine reported a failure; carries its code and message verbatim.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// A cancellation signal fired before or during the call.
    #[error("operation canceled")]
    OperationCanceled,

    /// The database failed an integrity check or the engine reported corruption.
    #[error("database corruption: {0}")]
    Corruption(String),

    /// Protocol violation by the caller (transaction misuse, refused pragma, ...).
    #[error("{0}")]
    Misuse(String),

    /// Configuration rejected before any native work happened.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A statement builder was given arguments it cannot turn into SQL.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A single-row query produced no row.
    #[error("SQL command did not yield a result row")]
    NoRows,

    /// A column of a materialized row set held more than one non-null value kind.
    #[error("column {column} ('{name}') holds values of more than one type")]
    MixedColumnTypes { column: usize, name: String },

    /// A cursor was read outside its valid row or column range.
    #[error("index {index} requested, with a size of {size}")]
    CursorIndexOutOfBounds { index: i64, size: i64 },

    /// A stored value cannot be converted to the requested kind.
    #[error("column {column}: cannot read {actual} as {requested}")]
    ColumnTypeMismatch {
        column: usize,
        actual: &'static str,
        requested: &'static str,
    },

    /// A single row needs more space than an empty cursor window provides.
    #[error("row {position} is too big to fit into the cursor window")]
    RowTooBig { position: usize },
}

impl Error {
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        Error::Misuse(message.into())
    }

    /// The engine error code, when this error came from the native engine.
    pub fn sqlite_error_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Sqlite(err) => err.sqlite_error_code(),
            _ => None,
        }
    }

    /// True for explicit corruption and for engine errors that mean the file is damaged.
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Corruption(_) => true,
            _ => matches!(
                self.sqlite_error_code(),
                Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    #[test]
    fn corruption_is_recognized_from_engine_codes() {
        let corrupt = Error::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CORRUPT),
            Some("database disk image is malformed".to_string()),
        ));
        assert!(corrupt.is_corruption());

        let not_a_db = Error::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_NOTADB),
            None,
        ));
        assert!(not_a_db.is_corruption());

        let constraint = Error::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_corruption());
        assert!(Error::Corruption("integrity_check".into()).is_corruption());
        assert!(!Error::ConnectionClosed.is_corruption());
    }

    #[test]
    fn bind_count_message_names_both_counts() {
        let err = Error::BindArgumentCount {
            expected: 2,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "expected 2 bind arguments but 3 were provided"
        );
    }
}
