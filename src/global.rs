//! Process-wide tuning applied to every connection at open time.

use crate::config::SyncMode;

/// Page size written to a fresh database.
pub const DEFAULT_PAGE_SIZE: i64 = 1024;

/// Upper bound on the WAL file size kept after a checkpoint, in bytes.
pub const JOURNAL_SIZE_LIMIT: i64 = 3_000_000;

/// Pages written to the WAL before an automatic checkpoint.
pub const WAL_AUTO_CHECKPOINT: i64 = 1000;

pub const DEFAULT_SYNC_MODE: SyncMode = SyncMode::Full;

/// Busy timeout the engine is expected to use. It is only verified, never written.
pub const BUSY_TIMEOUT_MS: i64 = 5000;

pub const DEFAULT_MAX_SQL_CACHE_SIZE: usize = 25;

/// Largest statement cache a configuration may ask for.
pub const MAX_SQL_CACHE_SIZE: usize = 100;

/// Byte budget of one cursor window.
pub const CURSOR_WINDOW_SIZE: usize = 2 * 1024 * 1024;

/// VM instructions between two polls of the cancellation flag.
pub const CANCEL_POLL_INSTRUCTIONS: i32 = 4;

/// Operations slower than this are logged when they end.
pub const SLOW_OPERATION_THRESHOLD_MS: i64 = 10_000;

/// Entries kept by the operation log ring.
pub const MAX_RECENT_OPERATIONS: usize = 60;

pub const DEFAULT_LOCALE: &str = "en-US";
