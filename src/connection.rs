//! A single SQLite connection and everything that hangs off its native handle.
//!
//! All guarded state lives behind one reentrant mutex. A SQL function
//! registered on the connection runs on the thread that is stepping a
//! statement, with the mutex already held, and may execute further statements
//! on the same connection. `RefCell` borrows of the state are therefore never
//! held while a statement steps.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use rusqlite::ffi;
use rusqlite::functions::{Context, FunctionFlags};
use tracing::{debug, error, info, warn};

use crate::cancel::{CancellationCoordinator, CancellationSignal};
use crate::config::{OpenFlags, SqliteConfig, SyncMode};
use crate::cursor::{fill_window, CursorWindow, ResultCursor, WindowFill};
use crate::error::{Error, Result};
use crate::global;
use crate::native;
use crate::operation_log::OperationLog;
use crate::rows::RowSet;
use crate::statement::{PreparedStatement, PreparedStatementCache, StatementInfo, StatementType};
use crate::transaction::{TransactionManager, TransactionMode};
use crate::value::Value;

/// Collation registered on every connection unless `NO_LOCALIZED_COLLATORS` is set.
pub const LOCALIZED_COLLATION: &str = "LOCALIZED";

/// Receives corruption reports for a connection.
pub trait CorruptionHandler: Send + Sync {
    fn on_corruption(&self, connection: &Connection) -> Result<()>;
}

/// Logs the corruption and fails with [`Error::Corruption`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCorruptionHandler;

impl CorruptionHandler for DefaultCorruptionHandler {
    fn on_corruption(&self, connection: &Connection) -> Result<()> {
        error!(
            app_name = %connection.app_name(),
            session = %connection.session_qualifier(),
            "corruption reported by sqlite on database"
        );
        Err(Error::Corruption(format!(
            "corruption reported by sqlite on database {} {}",
            connection.app_name(),
            connection.label()
        )))
    }
}

struct ConnectionState {
    // dropped before `db`: statements must be finalized before the handle closes
    cache: PreparedStatementCache,
    db: Option<rusqlite::Connection>,
    transactions: TransactionManager,
    cancellation: CancellationCoordinator,
}

impl ConnectionState {
    fn handle(&self) -> Result<&rusqlite::Connection> {
        self.db.as_ref().ok_or(Error::ConnectionClosed)
    }

    fn raw_handle(&self) -> Result<*mut ffi::sqlite3> {
        Ok(unsafe { self.handle()?.handle() })
    }
}

/// Puts a checked-out statement back into the cache when dropped.
struct StatementLease<'a> {
    state: &'a RefCell<ConnectionState>,
    statement: ManuallyDrop<PreparedStatement>,
}

impl Deref for StatementLease<'_> {
    type Target = PreparedStatement;

    fn deref(&self) -> &PreparedStatement {
        &self.statement
    }
}

impl Drop for StatementLease<'_> {
    fn drop(&mut self) {
        let statement = unsafe { ManuallyDrop::take(&mut self.statement) };
        let finalize = match self.state.try_borrow_mut() {
            Ok(mut state) => state.cache.release(statement),
            Err(_) => {
                error!(sql = %statement.info().sql, "connection state busy, finalizing statement");
                Some(statement.into_native())
            }
        };
        drop(finalize);
    }
}

/// Keeps a signal attached to the connection's interrupt while alive.
struct CancellationAttachment<'a> {
    state: &'a RefCell<ConnectionState>,
    signal: &'a CancellationSignal,
}

impl<'a> CancellationAttachment<'a> {
    fn attach(state: &'a RefCell<ConnectionState>, signal: &'a CancellationSignal) -> Result<Self> {
        let mut guard = state.borrow_mut();
        let st = &mut *guard;
        let db = st.db.as_ref().ok_or(Error::ConnectionClosed)?;
        st.cancellation.attach(db, signal)?;
        Ok(Self { state, signal })
    }
}

impl Drop for CancellationAttachment<'_> {
    fn drop(&mut self) {
        match self.state.try_borrow_mut() {
            Ok(mut guard) => {
                let st = &mut *guard;
                if let Some(db) = st.db.as_ref() {
                    st.cancellation.detach(db, self.signal);
                }
            }
            Err(_) => error!("connection state busy, cancellation signal left attached"),
        }
    }
}

/// One open SQLite database handle with its statement cache and transaction stack.
pub struct Connection {
    config: SqliteConfig,
    label: String,
    session_qualifier: String,
    operation_log: Arc<OperationLog>,
    corruption_handler: Arc<dyn CorruptionHandler>,
    state: ReentrantMutex<RefCell<ConnectionState>>,
}

impl Connection {
    /// Opens the database described by `config` and applies its settings.
    ///
    /// Corruption detected while opening is reported to the corruption
    /// handler before the error is returned.
    pub fn open(
        config: SqliteConfig,
        session_qualifier: impl Into<String>,
        operation_log: Arc<OperationLog>,
        corruption_handler: Option<Arc<dyn CorruptionHandler>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let state = ConnectionState {
            cache: PreparedStatementCache::new(config.max_sql_cache_size),
            db: None,
            transactions: TransactionManager::new(),
            cancellation: CancellationCoordinator::new(),
        };
        let connection = Arc::new(Self {
            label: config.label(),
            config,
            session_qualifier: session_qualifier.into(),
            operation_log,
            corruption_handler: corruption_handler
                .unwrap_or_else(|| Arc::new(DefaultCorruptionHandler)),
            state: ReentrantMutex::new(RefCell::new(state)),
        });

        match connection.open_impl() {
            Ok(()) => Ok(connection),
            Err(err) if err.is_corruption() => {
                connection.on_corruption()?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Opens with a private operation log and the default corruption handler.
    pub fn connect(config: SqliteConfig, session_qualifier: impl Into<String>) -> Result<Arc<Self>> {
        let operation_log = Arc::new(OperationLog::new(config.app_name.clone()));
        Self::open(config, session_qualifier, operation_log, None)
    }

    fn open_impl(&self) -> Result<()> {
        let flags = self.config.open_flags;
        let guard = self.state.lock();
        let mut native_flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if flags.contains(OpenFlags::CREATE_IF_NECESSARY) {
            native_flags |= rusqlite::OpenFlags::SQLITE_OPEN_CREATE;
        }
        let db = rusqlite::Connection::open_with_flags(&self.config.db_path, native_flags)?;
        self.operation_log.tick_open();
        guard.borrow_mut().db = Some(db);

        if let Err(err) = self.configure() {
            if let Err(close_err) = self.dispose_native(&guard) {
                warn!(error = %close_err, "closing a connection that failed to open");
            }
            return Err(err);
        }

        info!(
            app_name = %self.config.app_name,
            session = %self.session_qualifier,
            label = %self.label,
            "connection opened"
        );
        Ok(())
    }

    fn configure(&self) -> Result<()> {
        {
            let guard = self.state.lock();
            let state = guard.borrow();
            let db = state.handle()?;
            if !self
                .config
                .open_flags
                .contains(OpenFlags::NO_LOCALIZED_COLLATORS)
            {
                db.create_collation(LOCALIZED_COLLATION, |a: &str, b: &str| a.cmp(b))?;
            }
            if native::is_read_only_database(state.raw_handle()?) {
                return Err(Error::misuse(format!(
                    "database {} could only be opened read-only",
                    self.label
                )));
            }
        }

        self.set_page_size()?;
        self.set_foreign_key_mode()?;
        self.set_journal_size_limit()?;
        self.set_auto_checkpoint_interval()?;
        self.set_locking_mode()?;
        self.set_journal_mode()?;
        self.set_sync_mode()?;
        self.check_busy_timeout()
    }

    fn set_page_size(&self) -> Result<()> {
        let new_value = global::DEFAULT_PAGE_SIZE;
        let value = self.execute_for_long("PRAGMA page_size", &[], None)?;
        if value != new_value {
            self.execute(&format!("PRAGMA page_size={new_value}"), &[], None)?;
        }
        Ok(())
    }

    fn set_foreign_key_mode(&self) -> Result<()> {
        let new_value = i64::from(self.config.foreign_key_constraints_enabled);
        let value = self.execute_for_long("PRAGMA foreign_keys", &[], None)?;
        if value != new_value {
            self.execute(&format!("PRAGMA foreign_keys={new_value}"), &[], None)?;
        }
        Ok(())
    }

    fn set_journal_size_limit(&self) -> Result<()> {
        let new_value = global::JOURNAL_SIZE_LIMIT;
        let value = self.execute_for_long("PRAGMA journal_size_limit", &[], None)?;
        if value != new_value {
            self.execute_for_long(&format!("PRAGMA journal_size_limit={new_value}"), &[], None)?;
        }
        Ok(())
    }

    fn set_auto_checkpoint_interval(&self) -> Result<()> {
        let new_value = global::WAL_AUTO_CHECKPOINT;
        let value = self.execute_for_long("PRAGMA wal_autocheckpoint", &[], None)?;
        if value != new_value {
            self.execute_for_long(&format!("PRAGMA wal_autocheckpoint={new_value}"), &[], None)?;
        }
        Ok(())
    }

    fn set_locking_mode(&self) -> Result<()> {
        let value = self
            .execute_for_string("PRAGMA locking_mode", &[], None)?
            .unwrap_or_default();
        if value.eq_ignore_ascii_case("NORMAL") {
            return Ok(());
        }
        let changed = self
            .execute_for_string("PRAGMA locking_mode=NORMAL", &[], None)?
            .unwrap_or_default();
        if changed.eq_ignore_ascii_case("NORMAL") {
            return Ok(());
        }
        error!(label = %self.label, from = %value, "could not change the database locking mode to NORMAL");
        Err(Error::misuse(format!(
            "Unable to change the locking mode from '{value}' to 'NORMAL'"
        )))
    }

    fn set_journal_mode(&self) -> Result<()> {
        let value = self
            .execute_for_string("PRAGMA journal_mode", &[], None)?
            .unwrap_or_default();
        if value.eq_ignore_ascii_case("WAL") {
            return Ok(());
        }
        let changed = self
            .execute_for_string("PRAGMA journal_mode=WAL", &[], None)?
            .unwrap_or_default();
        if changed.eq_ignore_ascii_case("WAL") {
            info!(label = %self.label, from = %value, "changed journal mode to WAL");
            return Ok(());
        }
        error!(label = %self.label, from = %value, "could not change the database journal mode to WAL");
        Err(Error::misuse(format!(
            "Unable to change the journal mode from '{value}' to 'WAL'"
        )))
    }

    fn set_sync_mode(&self) -> Result<()> {
        let value = self
            .execute_for_string("PRAGMA synchronous", &[], None)?
            .unwrap_or_default();
        let new_value = self.config.sync_mode.pragma_value();
        if SyncMode::canonicalize(&value) != new_value {
            self.execute(&format!("PRAGMA synchronous={new_value}"), &[], None)?;
        }
        Ok(())
    }

    /// The engine's busy timeout cannot be changed from here; a mismatch is only reported.
    fn check_busy_timeout(&self) -> Result<()> {
        let value = self.execute_for_long("PRAGMA busy_timeout", &[], None)?;
        if value != global::BUSY_TIMEOUT_MS {
            warn!(
                label = %self.label,
                busy_timeout = value,
                expected = global::BUSY_TIMEOUT_MS,
                "busy timeout differs from the expected value"
            );
        }
        Ok(())
    }

    /// Evicts every statement and closes the native handle.
    fn dispose_native(&self, state: &RefCell<ConnectionState>) -> Result<()> {
        let (evicted, db) = {
            let mut st = state.borrow_mut();
            (st.cache.evict_all(), st.db.take())
        };
        drop(evicted);
        let Some(db) = db else {
            return Ok(());
        };
        self.operation_log.tick_close();
        db.close().map_err(|(_, err)| Error::Sqlite(err))
    }

    /// Closes the connection. Open transactions are ended (and so rolled
    /// back) first. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.close_impl(false)
    }

    fn close_impl(&self, leaked: bool) -> Result<()> {
        let guard = self.state.lock();
        if guard.borrow().db.is_none() {
            return Ok(());
        }
        if guard.borrow().cache.checked_out() > 0 {
            return Err(Error::misuse(
                "Cannot close the connection while a statement is executing.",
            ));
        }

        let cookie = self
            .operation_log
            .begin_operation(&self.session_qualifier, "close", None, &[]);
        let depth = guard.borrow().transactions.depth();
        for _ in 0..depth {
            if !guard.borrow().transactions.has_transaction() {
                break;
            }
            error!(
                app_name = %self.config.app_name,
                session = %self.session_qualifier,
                "Program error! A transaction is open when {}",
                if leaked { "the connection was dropped" } else { "calling close()" }
            );
            if let Err(err) = self.end_transaction(None) {
                warn!(error = %err, "failed to end a transaction left open at close");
            }
        }

        let result = self.dispose_native(&guard);
        if let Err(err) = &result {
            self.operation_log.fail_operation(cookie, err);
        }
        self.operation_log.end_operation(cookie);
        if result.is_ok() {
            info!(
                app_name = %self.config.app_name,
                session = %self.session_qualifier,
                "connection closed"
            );
        }
        result
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().borrow().db.is_some()
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub fn session_qualifier(&self) -> &str {
        &self.session_qualifier
    }

    pub fn path(&self) -> &str {
        &self.config.db_path
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn operation_log(&self) -> &Arc<OperationLog> {
        &self.operation_log
    }

    /// Reports corruption to this connection's handler.
    pub fn on_corruption(&self) -> Result<()> {
        self.corruption_handler.on_corruption(self)
    }

    /// Runs `PRAGMA main.integrity_check(1)`. Failures are logged.
    pub fn is_database_integrity_ok(&self) -> Result<bool> {
        let result = self.execute_for_string("PRAGMA main.integrity_check(1);", &[], None)?;
        match result.as_deref() {
            Some(answer) if answer.eq_ignore_ascii_case("ok") => Ok(true),
            other => {
                error!(
                    app_name = %self.config.app_name,
                    session = %self.session_qualifier,
                    result = ?other,
                    "PRAGMA main.integrity_check(1); failed"
                );
                Ok(false)
            }
        }
    }

    pub fn version(&self) -> Result<i64> {
        self.execute_for_long("PRAGMA user_version;", &[], None)
    }

    pub fn set_version(&self, version: i64) -> Result<()> {
        self.execute(&format!("PRAGMA user_version = {version};"), &[], None)
    }

    // ---- transactions ----

    pub fn begin_transaction(
        &self,
        mode: TransactionMode,
        signal: Option<&CancellationSignal>,
    ) -> Result<()> {
        if let Some(signal) = signal {
            signal.check()?;
        }
        let guard = self.state.lock();
        let outermost = {
            let mut state = guard.borrow_mut();
            state.handle()?;
            state.transactions.begin_transaction(mode)?
        };
        if outermost {
            if let Err(err) = self.execute_logged("executeImpl", mode.begin_sql(), &[], signal) {
                if let Err(cancel_err) = guard.borrow_mut().transactions.cancel_transaction() {
                    warn!(error = %cancel_err, "could not undo a transaction whose BEGIN failed");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn begin_transaction_non_exclusive(&self) -> Result<()> {
        self.begin_transaction(TransactionMode::Deferred, None)
    }

    pub fn set_transaction_successful(&self) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.handle()?;
        state.transactions.set_transaction_successful()
    }

    /// Ends the innermost transaction. Only the outermost one reaches the
    /// engine, committing when every level was marked successful.
    pub fn end_transaction(&self, signal: Option<&CancellationSignal>) -> Result<()> {
        if let Some(signal) = signal {
            signal.check()?;
        }
        let guard = self.state.lock();
        let outcome = {
            let mut state = guard.borrow_mut();
            state.handle()?;
            state.transactions.end_transaction()?
        };
        match outcome.sql() {
            Some(sql) => self.execute_logged("executeImpl", sql, &[], signal),
            None => Ok(()),
        }
    }

    fn commit_transaction(&self, signal: Option<&CancellationSignal>) -> Result<()> {
        let _guard = self.state.lock();
        self.set_transaction_successful()?;
        self.end_transaction(signal)
    }

    pub fn in_transaction(&self) -> Result<bool> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.handle()?;
        Ok(state.transactions.has_transaction())
    }

    /// Nesting depth of the software transaction stack.
    pub fn transaction_depth(&self) -> Result<usize> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.handle()?;
        Ok(state.transactions.depth())
    }

    /// True while the engine itself has a transaction open.
    pub fn in_engine_transaction(&self) -> Result<bool> {
        let guard = self.state.lock();
        let state = guard.borrow();
        Ok(native::in_engine_transaction(state.raw_handle()?))
    }

    // ---- statement execution ----

    /// Handles BEGIN, COMMIT/END and ROLLBACK through the transaction stack.
    fn execute_special(&self, sql: &str, signal: Option<&CancellationSignal>) -> Result<bool> {
        if let Some(signal) = signal {
            signal.check()?;
        }
        match StatementType::of(sql) {
            StatementType::Begin => {
                self.begin_transaction(TransactionMode::from_begin_sql(sql), signal)?;
                Ok(true)
            }
            StatementType::Commit => {
                self.commit_transaction(signal)?;
                Ok(true)
            }
            StatementType::Abort if !is_savepoint_rollback(sql) => {
                self.end_transaction(signal)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Checks `sql` out of the cache.
    fn acquire<'a>(&self, state: &'a RefCell<ConnectionState>, sql: &str) -> Result<StatementLease<'a>> {
        let (statement, evicted) = {
            let mut st = state.borrow_mut();
            let db = st.raw_handle()?;
            st.cache.acquire(db, sql)?
        };
        drop(evicted);
        Ok(StatementLease {
            state,
            statement: ManuallyDrop::new(statement),
        })
    }

    /// Acquires, binds and runs `body` with cancellation armed, then releases.
    fn with_statement<T>(
        &self,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
        body: impl FnOnce(&PreparedStatement) -> Result<T>,
    ) -> Result<T> {
        let guard = self.state.lock();
        let state: &RefCell<ConnectionState> = &guard;
        let statement = self.acquire(state, sql)?;

        let expected = statement.info().num_parameters;
        if args.len() != expected {
            return Err(Error::BindArgumentCount {
                expected,
                actual: args.len(),
            });
        }
        statement.native().bind_all(args)?;

        let _attachment = signal
            .map(|signal| CancellationAttachment::attach(state, signal))
            .transpose()?;
        body(&statement)
    }

    /// Wraps `run` in an operation log entry.
    fn logged<T>(&self, kind: &str, sql: &str, args: &[Value], run: impl FnOnce() -> Result<T>) -> Result<T> {
        let cookie = self
            .operation_log
            .begin_operation(&self.session_qualifier, kind, Some(sql), args);
        let result = run();
        if let Err(err) = &result {
            self.operation_log.fail_operation(cookie, err);
        }
        self.operation_log.end_operation(cookie);
        result
    }

    fn execute_logged(
        &self,
        kind: &str,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
    ) -> Result<()> {
        self.logged(kind, sql, args, || {
            self.with_statement(sql, args, signal, |s| s.native().execute_non_query())
        })
    }

    /// Compiles `sql` (through the cache) and describes it.
    pub fn prepare(&self, sql: &str) -> Result<StatementInfo> {
        self.logged("prepare", sql, &[], || {
            let guard = self.state.lock();
            let statement = self.acquire(&guard, sql)?;
            Ok(statement.info().clone())
        })
    }

    /// Runs a statement that returns no rows.
    pub fn execute(&self, sql: &str, args: &[Value], signal: Option<&CancellationSignal>) -> Result<()> {
        if self.execute_special(sql, signal)? {
            return Ok(());
        }
        self.execute_logged("execute", sql, args, signal)
    }

    /// First column of the first row as an integer.
    pub fn execute_for_long(
        &self,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
    ) -> Result<i64> {
        if self.execute_special(sql, signal)? {
            return Ok(0);
        }
        self.logged("executeForLong", sql, args, || {
            self.with_statement(sql, args, signal, |s| {
                s.native().execute_one_row()?;
                Ok(s.native().column_i64(0))
            })
        })
    }

    /// First column of the first row as text; `None` when it is NULL.
    pub fn execute_for_string(
        &self,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
    ) -> Result<Option<String>> {
        if self.execute_special(sql, signal)? {
            return Ok(None);
        }
        self.logged("executeForString", sql, args, || {
            self.with_statement(sql, args, signal, |s| {
                s.native().execute_one_row()?;
                Ok(s.native().column_text(0))
            })
        })
    }

    /// Runs an INSERT/UPDATE/DELETE and returns how many rows it changed.
    pub fn execute_for_changed_row_count(
        &self,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
    ) -> Result<usize> {
        if self.execute_special(sql, signal)? {
            return Ok(0);
        }
        let mut changed = 0;
        let cookie = self.operation_log.begin_operation(
            &self.session_qualifier,
            "executeForChangedRowCount",
            Some(sql),
            args,
        );
        let result = self.with_statement(sql, args, signal, |s| {
            s.native().execute_non_query()?;
            changed = native::changes(s.native().db());
            Ok(changed)
        });
        if let Err(err) = &result {
            self.operation_log.fail_operation(cookie, err);
        }
        self.operation_log
            .end_operation_with_detail(cookie, &format!("changedRows={changed}"));
        result
    }

    /// Runs an INSERT and returns the new row id, or `None` when nothing was inserted.
    pub fn execute_for_last_inserted_row_id(
        &self,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
    ) -> Result<Option<i64>> {
        if self.execute_special(sql, signal)? {
            return Ok(None);
        }
        self.logged("executeForLastInsertedRowId", sql, args, || {
            self.with_statement(sql, args, signal, |s| {
                s.native().execute_non_query()?;
                let db = s.native().db();
                Ok((native::changes(db) > 0).then(|| native::last_insert_rowid(db)))
            })
        })
    }

    /// Runs a query and materializes every row.
    pub fn execute_for_rows(
        &self,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
    ) -> Result<Option<RowSet>> {
        if self.execute_special(sql, signal)? {
            return Ok(None);
        }
        let cookie = self.operation_log.begin_operation(
            &self.session_qualifier,
            "executeForRows",
            Some(sql),
            args,
        );
        let result = self.with_statement(sql, args, signal, |s| RowSet::collect(s.native()));
        if let Err(err) = &result {
            self.operation_log.fail_operation(cookie, err);
        }
        let counted = result.as_ref().map_or(0, RowSet::len);
        self.operation_log
            .end_operation_with_detail(cookie, &format!("countedRows={counted}"));
        result.map(Some)
    }

    /// Fills `window` with rows of `sql` as described by `fill`.
    /// Returns the number of rows stepped.
    pub fn execute_for_cursor_window(
        &self,
        sql: &str,
        args: &[Value],
        window: &mut CursorWindow,
        fill: WindowFill,
        signal: Option<&CancellationSignal>,
    ) -> Result<usize> {
        let cookie = self.operation_log.begin_operation(
            &self.session_qualifier,
            "executeForCursorWindow",
            Some(sql),
            args,
        );
        let result = self.with_statement(sql, args, signal, |s| fill_window(s.native(), window, fill));
        if let Err(err) = &result {
            self.operation_log.fail_operation(cookie, err);
        }
        let counted = result.as_ref().copied().unwrap_or(0);
        self.operation_log.end_operation_with_detail(
            cookie,
            &format!(
                "window='{}', startPos={}, actualPos={}, filledRows={}, countedRows={}",
                window.name(),
                fill.start_position,
                window.start_position(),
                window.num_rows(),
                counted
            ),
        );
        result
    }

    /// Opens a windowed cursor over the result of `sql`. The query runs
    /// lazily, on the cursor's first access.
    pub fn query(
        self: &Arc<Self>,
        sql: &str,
        args: &[Value],
        signal: Option<&CancellationSignal>,
    ) -> Result<ResultCursor> {
        let info = self.prepare(sql)?;
        if args.len() != info.num_parameters {
            return Err(Error::BindArgumentCount {
                expected: info.num_parameters,
                actual: args.len(),
            });
        }
        Ok(ResultCursor::new(
            Arc::clone(self),
            sql.to_string(),
            args.to_vec(),
            signal.cloned(),
            info.column_names,
            self.config.cursor_window_size,
        ))
    }

    /// Registers a deterministic scalar SQL function. `function` runs while a
    /// statement steps and may itself execute statements on this connection.
    pub fn create_scalar_function<F>(&self, name: &str, n_args: i32, function: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + 'static,
    {
        let guard = self.state.lock();
        let state = guard.borrow();
        let db = state.handle()?;
        let function = AssertUnwindSafe(function);
        db.create_scalar_function(
            name,
            n_args,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx: &Context<'_>| {
                // borrow the whole wrapper so the closure captures it, not the inner field
                let function = &function;
                let args: Vec<Value> = (0..ctx.len()).map(|i| Value::from(ctx.get_raw(i))).collect();
                (function.0)(&args).map_err(|err| rusqlite::Error::UserFunctionError(Box::new(err)))
            },
        )?;
        debug!(name, n_args, "registered scalar function");
        Ok(())
    }

    // ---- diagnostics ----

    pub fn prepared_statement_cache_hit_count(&self) -> u64 {
        self.state.lock().borrow().cache.hit_count()
    }

    pub fn prepared_statement_cache_miss_count(&self) -> u64 {
        self.state.lock().borrow().cache.miss_count()
    }

    pub fn prepared_statement_cache_size(&self) -> usize {
        self.state.lock().borrow().cache.size()
    }

    /// Signals currently attached; zero whenever no statement is executing.
    pub fn cancellation_attach_count(&self) -> usize {
        self.state.lock().borrow().cancellation.attach_count()
    }

    pub fn dump(&self, verbose: bool) -> String {
        let guard = self.state.lock();
        let state = guard.borrow();
        let mut out = String::new();
        let _ = writeln!(out, "Connection: {}", self.label);
        let _ = writeln!(out, "  appName: {}", self.config.app_name);
        let _ = writeln!(out, "  sessionQualifier: {}", self.session_qualifier);
        let _ = writeln!(out, "  isOpen: {}", state.db.is_some());
        let _ = writeln!(out, "  locale: {}", self.config.locale);
        let _ = writeln!(
            out,
            "  transactionDepth: {}, mode: {:?}",
            state.transactions.depth(),
            state.transactions.outermost_mode()
        );
        let _ = writeln!(
            out,
            "  cancellation: attached={}, interruptRequested={}",
            state.cancellation.attach_count(),
            state.cancellation.interrupt_requested()
        );
        let _ = writeln!(
            out,
            "  preparedStatementCache: hits={}, misses={}, size={}/{}",
            state.cache.hit_count(),
            state.cache.miss_count(),
            state.cache.size(),
            state.cache.max_size()
        );
        self.operation_log.dump(&mut out, verbose);
        if verbose {
            state.cache.dump(&mut out);
        }
        out
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state.get_mut().get_mut().db.is_none() {
            return;
        }
        error!(
            app_name = %self.config.app_name,
            session = %self.session_qualifier,
            "A connection for database '{}' sessionQualifier '{}' was leaked! Close it when it is no longer needed.",
            self.config.app_name,
            self.session_qualifier
        );
        if let Err(err) = self.close_impl(true) {
            error!(error = %err, "failed to close a leaked connection");
        }
    }
}

/// `ROLLBACK TO <savepoint>` undoes part of a transaction without ending it.
fn is_savepoint_rollback(sql: &str) -> bool {
    sql.split(|c: char| c.is_whitespace() || c == ';')
        .skip(1)
        .any(|word| word.eq_ignore_ascii_case("TO"))
}
