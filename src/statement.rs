//! Statement classification and the per-connection prepared statement cache.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use lru::LruCache;
use rusqlite::ffi;
use tracing::debug;

use crate::error::Result;
use crate::native::NativeStatement;
use crate::operation_log::trim_sql_for_display;

/// Coarse statement kind, decided from the first three letters of the SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementType {
    Select,
    Update,
    Attach,
    Begin,
    Commit,
    Abort,
    Pragma,
    Ddl,
    Unprepared,
    Other,
}

impl StatementType {
    pub fn of(sql: &str) -> Self {
        let sql = sql.trim_start();
        let Some(prefix) = sql.get(..3) else {
            return StatementType::Other;
        };
        match prefix.to_ascii_uppercase().as_str() {
            "SEL" => StatementType::Select,
            "INS" | "UPD" | "REP" | "DEL" => StatementType::Update,
            "ATT" => StatementType::Attach,
            "COM" | "END" => StatementType::Commit,
            "ROL" => StatementType::Abort,
            "BEG" => StatementType::Begin,
            "PRA" => StatementType::Pragma,
            "CRE" | "DRO" | "ALT" => StatementType::Ddl,
            "ANA" | "DET" => StatementType::Unprepared,
            _ => StatementType::Other,
        }
    }

    /// Only plain reads and writes are worth keeping compiled.
    pub fn is_cacheable(self) -> bool {
        matches!(self, StatementType::Select | StatementType::Update)
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementType::Select => "SELECT",
            StatementType::Update => "UPDATE",
            StatementType::Attach => "ATTACH",
            StatementType::Begin => "BEGIN",
            StatementType::Commit => "COMMIT",
            StatementType::Abort => "ABORT",
            StatementType::Pragma => "PRAGMA",
            StatementType::Ddl => "DDL",
            StatementType::Unprepared => "UNPREPARED",
            StatementType::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// What is known about a compiled statement without touching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub sql: String,
    pub num_parameters: usize,
    pub statement_type: StatementType,
    pub read_only: bool,
    pub column_names: Vec<String>,
}

/// A statement checked out of the cache. It must go back through
/// [`PreparedStatementCache::release`].
pub(crate) struct PreparedStatement {
    id: u64,
    info: Arc<StatementInfo>,
    native: NativeStatement,
}

impl PreparedStatement {
    pub(crate) fn info(&self) -> &StatementInfo {
        &self.info
    }

    pub(crate) fn native(&self) -> &NativeStatement {
        &self.native
    }

    /// Gives up the statement without returning it to the cache.
    pub(crate) fn into_native(self) -> NativeStatement {
        self.native
    }
}

struct CachedStatement {
    id: u64,
    info: Arc<StatementInfo>,
    /// `None` while the statement is checked out.
    parked: Option<NativeStatement>,
}

impl CachedStatement {
    fn in_use(&self) -> bool {
        self.parked.is_none()
    }
}

/// Statements removed from the cache. Dropping them finalizes the natives,
/// which callers do once they are done mutating the cache.
pub(crate) type Evicted = Vec<NativeStatement>;

/// LRU cache of compiled statements keyed by SQL text.
pub(crate) struct PreparedStatementCache {
    entries: LruCache<String, CachedStatement>,
    max_size: usize,
    next_id: u64,
    hit_count: u64,
    miss_count: u64,
    checked_out: usize,
}

impl PreparedStatementCache {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_size,
            next_id: 0,
            hit_count: 0,
            miss_count: 0,
            checked_out: 0,
        }
    }

    /// Returns a cached statement for `sql` when one is idle, otherwise compiles one.
    pub(crate) fn acquire(
        &mut self,
        db: *mut ffi::sqlite3,
        sql: &str,
    ) -> Result<(PreparedStatement, Evicted)> {
        let mut already_cached = false;
        if let Some(entry) = self.entries.get_mut(sql) {
            self.hit_count += 1;
            if let Some(native) = entry.parked.take() {
                self.checked_out += 1;
                let statement = PreparedStatement {
                    id: entry.id,
                    info: Arc::clone(&entry.info),
                    native,
                };
                return Ok((statement, Evicted::new()));
            }
            // checked out by an outer call on this thread; compile a one-off
            already_cached = true;
        } else {
            self.miss_count += 1;
        }

        let native = unsafe { NativeStatement::prepare(db, sql)? };
        let info = Arc::new(StatementInfo {
            sql: sql.to_string(),
            num_parameters: native.parameter_count(),
            statement_type: StatementType::of(sql),
            read_only: native.is_read_only(),
            column_names: native.column_names(),
        });

        let mut evicted = Evicted::new();
        if info.statement_type == StatementType::Ddl {
            evicted.extend(self.evict_all());
        }

        self.next_id += 1;
        let id = self.next_id;
        if !already_cached && info.statement_type.is_cacheable() && self.max_size > 0 {
            evicted.extend(self.make_room());
            self.entries.put(
                sql.to_string(),
                CachedStatement {
                    id,
                    info: Arc::clone(&info),
                    parked: None,
                },
            );
        }

        self.checked_out += 1;
        Ok((PreparedStatement { id, info, native }, evicted))
    }

    /// Returns a statement after use. Whatever comes back must be finalized.
    pub(crate) fn release(&mut self, statement: PreparedStatement) -> Option<NativeStatement> {
        self.checked_out = self.checked_out.saturating_sub(1);
        let PreparedStatement { id, info, native } = statement;

        let still_cached = self
            .entries
            .peek(&info.sql)
            .is_some_and(|entry| entry.id == id);
        if !still_cached {
            return Some(native);
        }

        match native.reset_and_clear_bindings() {
            Ok(()) => {
                if let Some(entry) = self.entries.peek_mut(&info.sql) {
                    entry.parked = Some(native);
                    return None;
                }
                Some(native)
            }
            Err(err) => {
                debug!(sql = %trim_sql_for_display(&info.sql), error = %err,
                    "could not reset cached statement, removing it from the cache");
                self.entries.pop(&info.sql);
                Some(native)
            }
        }
    }

    /// Evicts down to `max_size - 1` entries, idle entries first in LRU order.
    fn make_room(&mut self) -> Evicted {
        let mut evicted = Evicted::new();
        while self.entries.len() >= self.max_size {
            let idle_key = self
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| !entry.in_use())
                .map(|(key, _)| key.clone());
            let removed = match idle_key {
                Some(key) => self.entries.pop(&key),
                None => self.entries.pop_lru().map(|(_, entry)| entry),
            };
            match removed {
                Some(entry) => evicted.extend(entry.parked),
                None => break,
            }
        }
        evicted
    }

    /// Empties the cache. Checked-out statements are finalized on release.
    pub(crate) fn evict_all(&mut self) -> Evicted {
        let mut evicted = Evicted::new();
        while let Some((_, entry)) = self.entries.pop_lru() {
            evicted.extend(entry.parked);
        }
        evicted
    }

    pub(crate) fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub(crate) fn miss_count(&self) -> u64 {
        self.miss_count
    }

    pub(crate) fn size(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Statements currently checked out, cached or not.
    pub(crate) fn checked_out(&self) -> usize {
        self.checked_out
    }

    /// Appends one line per cached statement, least recently used first.
    pub(crate) fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "  Prepared statement cache:");
        if self.entries.is_empty() {
            let _ = writeln!(out, "    <none>");
            return;
        }
        for (i, (_, entry)) in self.entries.iter().rev().enumerate() {
            let info = &entry.info;
            let _ = writeln!(
                out,
                "    {i}: inUse={}, numParameters={}, type={}, readOnly={}, sql=\"{}\"",
                entry.in_use(),
                info.num_parameters,
                info.statement_type,
                info.read_only,
                trim_sql_for_display(&info.sql)
            );
        }
    }
}
