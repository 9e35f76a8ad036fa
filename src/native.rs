//! Owned compiled statements on top of the raw SQLite statement API.
//!
//! `rusqlite::Statement` borrows its connection, which rules it out for a
//! cache that lives next to the connection it was prepared on. A
//! [`NativeStatement`] owns its `sqlite3_stmt` instead and finalizes it on drop.
//! Every statement must be dropped before the owning database handle is closed.

use std::ffi::{c_int, CStr};
use std::os::raw::c_char;
use std::ptr::{self, NonNull};

use rusqlite::ffi;

use crate::error::{Error, Result};
use crate::value::{DataType, Value};

/// Builds the crate error for a failed native call, reading the connection's
/// current error message. Interrupts become [`Error::OperationCanceled`].
pub(crate) fn error_from_code(db: *mut ffi::sqlite3, code: c_int) -> Error {
    if code & 0xff == ffi::SQLITE_INTERRUPT {
        return Error::OperationCanceled;
    }
    let message = unsafe {
        let msg = ffi::sqlite3_errmsg(db);
        if msg.is_null() {
            None
        } else {
            Some(CStr::from_ptr(msg).to_string_lossy().into_owned())
        }
    };
    Error::Sqlite(rusqlite::Error::SqliteFailure(ffi::Error::new(code), message))
}

fn misuse_failure(code: c_int, message: &str) -> Error {
    Error::Sqlite(rusqlite::Error::SqliteFailure(
        ffi::Error::new(code),
        Some(message.to_string()),
    ))
}

/// Rows changed by the most recent INSERT/UPDATE/DELETE on `db`.
pub(crate) fn changes(db: *mut ffi::sqlite3) -> usize {
    let count = unsafe { ffi::sqlite3_changes(db) };
    usize::try_from(count).unwrap_or(0)
}

pub(crate) fn last_insert_rowid(db: *mut ffi::sqlite3) -> i64 {
    unsafe { ffi::sqlite3_last_insert_rowid(db) }
}

/// True while the engine has an open transaction on `db`.
pub(crate) fn in_engine_transaction(db: *mut ffi::sqlite3) -> bool {
    unsafe { ffi::sqlite3_get_autocommit(db) == 0 }
}

/// True when the `main` database of `db` was opened read-only.
pub(crate) fn is_read_only_database(db: *mut ffi::sqlite3) -> bool {
    unsafe { ffi::sqlite3_db_readonly(db, b"main\0".as_ptr().cast::<c_char>()) == 1 }
}

/// A compiled statement owned by the statement cache or by a single caller.
pub(crate) struct NativeStatement {
    db: *mut ffi::sqlite3,
    stmt: NonNull<ffi::sqlite3_stmt>,
}

// The statement is only touched while the owning connection's guard is held.
unsafe impl Send for NativeStatement {}

impl NativeStatement {
    /// Compiles `sql` on `db`.
    ///
    /// # Safety
    ///
    /// `db` must be an open handle that outlives the returned statement.
    pub(crate) unsafe fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<Self> {
        let len = c_int::try_from(sql.len())
            .map_err(|_| misuse_failure(ffi::SQLITE_TOOBIG, "SQL text is too long"))?;
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        let rc = ffi::sqlite3_prepare_v2(
            db,
            sql.as_ptr().cast::<c_char>(),
            len,
            &mut stmt,
            &mut tail,
        );
        if rc != ffi::SQLITE_OK {
            // prepare leaves no statement behind on failure
            return Err(error_from_code(db, rc));
        }
        match NonNull::new(stmt) {
            Some(stmt) => Ok(Self { db, stmt }),
            None => Err(misuse_failure(
                ffi::SQLITE_MISUSE,
                "SQL statement contains no instructions",
            )),
        }
    }

    pub(crate) fn db(&self) -> *mut ffi::sqlite3 {
        self.db
    }

    fn raw(&self) -> *mut ffi::sqlite3_stmt {
        self.stmt.as_ptr()
    }

    pub(crate) fn parameter_count(&self) -> usize {
        let count = unsafe { ffi::sqlite3_bind_parameter_count(self.raw()) };
        usize::try_from(count).unwrap_or(0)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        unsafe { ffi::sqlite3_stmt_readonly(self.raw()) != 0 }
    }

    /// Binds `args` to parameters `1..=args.len()`. The caller has checked the count.
    pub(crate) fn bind_all(&self, args: &[Value]) -> Result<()> {
        for (i, arg) in args.iter().enumerate() {
            let index = c_int::try_from(i + 1)
                .map_err(|_| misuse_failure(ffi::SQLITE_RANGE, "too many bind arguments"))?;
            self.bind(index, arg)?;
        }
        Ok(())
    }

    fn bind(&self, index: c_int, value: &Value) -> Result<()> {
        let stmt = self.raw();
        let rc = unsafe {
            match value {
                Value::Null => ffi::sqlite3_bind_null(stmt, index),
                Value::Integer(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
                Value::Boolean(v) => ffi::sqlite3_bind_int64(stmt, index, i64::from(*v)),
                Value::Real(v) => ffi::sqlite3_bind_double(stmt, index, *v),
                Value::Text(v) => {
                    let len = c_int::try_from(v.len())
                        .map_err(|_| misuse_failure(ffi::SQLITE_TOOBIG, "string too big"))?;
                    ffi::sqlite3_bind_text(
                        stmt,
                        index,
                        v.as_ptr().cast::<c_char>(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
                Value::Blob(v) if v.is_empty() => ffi::sqlite3_bind_zeroblob(stmt, index, 0),
                Value::Blob(v) => {
                    let len = c_int::try_from(v.len())
                        .map_err(|_| misuse_failure(ffi::SQLITE_TOOBIG, "blob too big"))?;
                    ffi::sqlite3_bind_blob(
                        stmt,
                        index,
                        v.as_ptr().cast(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
            }
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(error_from_code(self.db, rc))
        }
    }

    /// Advances one row. `Ok(true)` means a row is available.
    pub(crate) fn step(&self) -> Result<bool> {
        match unsafe { ffi::sqlite3_step(self.raw()) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            rc => Err(error_from_code(self.db, rc)),
        }
    }

    /// Runs a statement that must not return rows.
    pub(crate) fn execute_non_query(&self) -> Result<()> {
        if self.step()? {
            return Err(Error::misuse(
                "Queries can be performed using query methods only.",
            ));
        }
        Ok(())
    }

    /// Steps to the first row, failing with [`Error::NoRows`] when there is none.
    pub(crate) fn execute_one_row(&self) -> Result<()> {
        if self.step()? {
            Ok(())
        } else {
            Err(Error::NoRows)
        }
    }

    /// Resets the statement and clears its bindings so it can be reused.
    pub(crate) fn reset_and_clear_bindings(&self) -> Result<()> {
        let rc = unsafe { ffi::sqlite3_reset(self.raw()) };
        unsafe {
            ffi::sqlite3_clear_bindings(self.raw());
        }
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(error_from_code(self.db, rc))
        }
    }

    pub(crate) fn column_count(&self) -> usize {
        let count = unsafe { ffi::sqlite3_column_count(self.raw()) };
        usize::try_from(count).unwrap_or(0)
    }

    pub(crate) fn column_names(&self) -> Vec<String> {
        (0..self.column_count())
            .map(|i| {
                let name = unsafe { ffi::sqlite3_column_name(self.raw(), i as c_int) };
                if name.is_null() {
                    String::new()
                } else {
                    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
                }
            })
            .collect()
    }

    pub(crate) fn column_type(&self, column: usize) -> DataType {
        match unsafe { ffi::sqlite3_column_type(self.raw(), column as c_int) } {
            ffi::SQLITE_INTEGER => DataType::Integer,
            ffi::SQLITE_FLOAT => DataType::Real,
            ffi::SQLITE_TEXT => DataType::Text,
            ffi::SQLITE_BLOB => DataType::Blob,
            _ => DataType::Null,
        }
    }

    /// Copies the value of `column` in the current row.
    pub(crate) fn column_value(&self, column: usize) -> Value {
        let stmt = self.raw();
        let col = column as c_int;
        unsafe {
            match self.column_type(column) {
                DataType::Null => Value::Null,
                DataType::Integer => Value::Integer(ffi::sqlite3_column_int64(stmt, col)),
                DataType::Real => Value::Real(ffi::sqlite3_column_double(stmt, col)),
                DataType::Text => {
                    let text = ffi::sqlite3_column_text(stmt, col);
                    let len = usize::try_from(ffi::sqlite3_column_bytes(stmt, col)).unwrap_or(0);
                    if text.is_null() || len == 0 {
                        Value::Text(String::new())
                    } else {
                        let bytes = std::slice::from_raw_parts(text, len);
                        Value::Text(String::from_utf8_lossy(bytes).into_owned())
                    }
                }
                DataType::Blob => {
                    let blob = ffi::sqlite3_column_blob(stmt, col);
                    let len = usize::try_from(ffi::sqlite3_column_bytes(stmt, col)).unwrap_or(0);
                    if blob.is_null() || len == 0 {
                        Value::Blob(Vec::new())
                    } else {
                        Value::Blob(std::slice::from_raw_parts(blob.cast::<u8>(), len).to_vec())
                    }
                }
            }
        }
    }

    /// Integer value of `column`, converted by the engine.
    pub(crate) fn column_i64(&self, column: usize) -> i64 {
        unsafe { ffi::sqlite3_column_int64(self.raw(), column as c_int) }
    }

    /// Text value of `column`, converted by the engine. `None` for NULL.
    pub(crate) fn column_text(&self, column: usize) -> Option<String> {
        if self.column_type(column) == DataType::Null {
            return None;
        }
        let col = column as c_int;
        unsafe {
            let text = ffi::sqlite3_column_text(self.raw(), col);
            let len = usize::try_from(ffi::sqlite3_column_bytes(self.raw(), col)).unwrap_or(0);
            if text.is_null() {
                return None;
            }
            let bytes = std::slice::from_raw_parts(text, len);
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    /// Copies every column of the current row.
    pub(crate) fn row_values(&self) -> Vec<Value> {
        (0..self.column_count()).map(|i| self.column_value(i)).collect()
    }
}

impl Drop for NativeStatement {
    fn drop(&mut self) {
        unsafe {
            ffi::sqlite3_finalize(self.raw());
        }
    }
}
