//! SQLite connection and transaction layer.
//!
//! # Intention
//!
//! - Own one native SQLite handle per [`Connection`] and everything derived
//!   from it: compiled statements, the transaction stack and cancellation.
//! - Keep frequently used statements compiled in a per-connection LRU cache.
//! - Nest transactions in software; only the outermost level reaches the engine.
//! - Page large results through byte-bounded [`CursorWindow`]s.
//!
//! # Architectural Boundaries
//!
//! - Only connection-level SQLite code belongs here. Pooling connections,
//!   schema management and higher level services live elsewhere.
//! - Calls are synchronous and block the calling thread; nothing here spawns threads.
//! - A connection may be shared across threads, but statements on it run one at
//!   a time. The only re-entry is a registered SQL function running statements
//!   on the connection that is executing it.

pub mod cancel;
pub mod config;
pub mod connection;
pub mod crud;
pub mod cursor;
pub mod error;
pub mod global;
mod native;
pub mod operation_log;
pub mod rows;
pub mod statement;
pub mod transaction;
pub mod value;

pub use cancel::{CancellationSignal, OnCancelListener};
pub use config::{OpenFlags, SqliteConfig, SyncMode};
pub use connection::{Connection, CorruptionHandler, DefaultCorruptionHandler};
pub use crud::{
    ConflictAlgorithm, DeleteOperation, InsertOperation, Query, QueryOperator, ReadOperation,
    UpdateOperation,
};
pub use cursor::{CursorWindow, ResultCursor, WindowFill};
pub use error::{Error, Result};
pub use operation_log::{OperationLog, OperationSnapshot};
pub use rows::RowSet;
pub use statement::{StatementInfo, StatementType};
pub use transaction::{TransactionMode, TransactionOutcome};
pub use value::{DataType, Value};
