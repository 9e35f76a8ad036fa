//! Windowed access to query results.
//!
//! A [`ResultCursor`] never holds a statement open between calls. It re-runs
//! its query whenever the requested row falls outside the rows currently
//! copied into its [`CursorWindow`], skipping rows before the new window start.

use std::sync::Arc;

use tracing::{debug, error};

use crate::cancel::CancellationSignal;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::native::NativeStatement;
use crate::value::{DataType, Value};

/// Bookkeeping bytes charged for every row in a window.
const ROW_SLOT_BYTES: usize = 8;
/// Bookkeeping bytes charged for every field in a window.
const FIELD_SLOT_BYTES: usize = 16;

fn field_cost(value: &Value) -> usize {
    FIELD_SLOT_BYTES
        + match value {
            Value::Text(text) => text.len() + 1,
            Value::Blob(blob) => blob.len(),
            _ => 0,
        }
}

fn row_cost(row: &[Value]) -> usize {
    ROW_SLOT_BYTES + row.iter().map(field_cost).sum::<usize>()
}

/// Where a refill for `position` should start, given the number of rows a
/// window is expected to hold. A third of the window is spent on rows before
/// `position` so that scrolling back a little does not refill again.
pub fn pick_fill_window_start_position(position: usize, capacity: usize) -> usize {
    position.saturating_sub(capacity / 3)
}

/// A page of result rows bounded by a byte budget.
#[derive(Debug, Clone)]
pub struct CursorWindow {
    name: String,
    capacity_bytes: usize,
    used_bytes: usize,
    start_position: usize,
    num_columns: usize,
    rows: Vec<Vec<Value>>,
}

impl CursorWindow {
    pub fn new(name: impl Into<String>, capacity_bytes: usize) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
            used_bytes: 0,
            start_position: 0,
            num_columns: 0,
            rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drops all rows, keeping the allocated row storage.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.used_bytes = 0;
        self.start_position = 0;
        self.num_columns = 0;
    }

    pub fn start_position(&self) -> usize {
        self.start_position
    }

    pub fn set_start_position(&mut self, position: usize) {
        self.start_position = position;
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn set_num_columns(&mut self, num_columns: usize) {
        self.num_columns = num_columns;
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// True when `position` is one of the rows held by this window.
    pub fn contains(&self, position: usize) -> bool {
        position >= self.start_position && position < self.start_position + self.rows.len()
    }

    /// Appends `row`, handing it back when the byte budget cannot take it.
    pub(crate) fn put_row(&mut self, row: Vec<Value>) -> std::result::Result<(), Vec<Value>> {
        let cost = row_cost(&row);
        if self.used_bytes + cost > self.capacity_bytes {
            return Err(row);
        }
        self.used_bytes += cost;
        self.rows.push(row);
        Ok(())
    }

    /// Value at absolute result position `position`.
    pub fn get(&self, position: usize, column: usize) -> Result<&Value> {
        let out_of_bounds = || Error::CursorIndexOutOfBounds {
            index: position as i64,
            size: (self.start_position + self.rows.len()) as i64,
        };
        let row = position
            .checked_sub(self.start_position)
            .and_then(|offset| self.rows.get(offset))
            .ok_or_else(out_of_bounds)?;
        row.get(column).ok_or(Error::CursorIndexOutOfBounds {
            index: column as i64,
            size: self.num_columns as i64,
        })
    }

    pub fn get_type(&self, position: usize, column: usize) -> Result<DataType> {
        Ok(self.get(position, column)?.data_type())
    }

    /// Integer view of a field. Text is parsed (0 when unparsable), NULL is 0.
    pub fn get_long(&self, position: usize, column: usize) -> Result<i64> {
        match self.get(position, column)? {
            Value::Null => Ok(0),
            Value::Integer(v) => Ok(*v),
            Value::Boolean(v) => Ok(i64::from(*v)),
            Value::Real(v) => Ok(*v as i64),
            Value::Text(v) => Ok(v.trim().parse().unwrap_or(0)),
            Value::Blob(_) => Err(mismatch(column, DataType::Blob, "INTEGER")),
        }
    }

    pub fn get_double(&self, position: usize, column: usize) -> Result<f64> {
        match self.get(position, column)? {
            Value::Null => Ok(0.0),
            Value::Integer(v) => Ok(*v as f64),
            Value::Boolean(v) => Ok(f64::from(u8::from(*v))),
            Value::Real(v) => Ok(*v),
            Value::Text(v) => Ok(v.trim().parse().unwrap_or(0.0)),
            Value::Blob(_) => Err(mismatch(column, DataType::Blob, "REAL")),
        }
    }

    pub fn get_string(&self, position: usize, column: usize) -> Result<Option<String>> {
        match self.get(position, column)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            Value::Integer(v) => Ok(Some(v.to_string())),
            Value::Boolean(v) => Ok(Some(i64::from(*v).to_string())),
            Value::Real(v) => Ok(Some(v.to_string())),
            Value::Blob(_) => Err(mismatch(column, DataType::Blob, "TEXT")),
        }
    }

    pub fn get_blob(&self, position: usize, column: usize) -> Result<Option<Vec<u8>>> {
        match self.get(position, column)? {
            Value::Null => Ok(None),
            Value::Blob(v) => Ok(Some(v.clone())),
            Value::Text(v) => Ok(Some(v.as_bytes().to_vec())),
            other => Err(mismatch(column, other.data_type(), "BLOB")),
        }
    }
}

fn mismatch(column: usize, actual: DataType, requested: &'static str) -> Error {
    Error::ColumnTypeMismatch {
        column,
        actual: actual.name(),
        requested,
    }
}

/// Parameters of one window fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFill {
    /// First result row to copy.
    pub start_position: usize,
    /// Row that must end up in the window.
    pub required_position: usize,
    /// Keep stepping after the window is full to count every row.
    pub count_all_rows: bool,
}

/// Steps `statement` and copies rows into `window`. Returns the number of
/// rows stepped, which is the full result size when counting all rows.
pub(crate) fn fill_window(
    statement: &NativeStatement,
    window: &mut CursorWindow,
    fill: WindowFill,
) -> Result<usize> {
    window.clear();
    window.set_num_columns(statement.column_count());
    let mut start_position = fill.start_position;
    window.set_start_position(start_position);

    let mut total_rows = 0usize;
    let mut added_rows = 0usize;
    let mut window_full = false;
    while !window_full || fill.count_all_rows {
        if !statement.step()? {
            break;
        }
        total_rows += 1;
        if total_rows <= start_position || window_full {
            continue;
        }

        let row = statement.row_values();
        let row = match window.put_row(row) {
            Ok(()) => {
                added_rows += 1;
                continue;
            }
            Err(row) => row,
        };

        if added_rows == 0 {
            return Err(Error::RowTooBig {
                position: total_rows - 1,
            });
        }
        if start_position + added_rows <= fill.required_position {
            // the required row is still ahead: restart the window at this row
            window.clear();
            window.set_num_columns(statement.column_count());
            start_position += added_rows;
            window.set_start_position(start_position);
            if window.put_row(row).is_err() {
                return Err(Error::RowTooBig {
                    position: total_rows - 1,
                });
            }
            added_rows = 1;
        } else {
            window_full = true;
        }
    }

    if start_position > total_rows {
        error!(
            start_position,
            total_rows, "cursor window start position is past the end of the result"
        );
    }
    Ok(total_rows)
}

/// Scrollable view over the result of a query.
pub struct ResultCursor {
    connection: Option<Arc<Connection>>,
    sql: String,
    bind_args: Vec<Value>,
    signal: Option<CancellationSignal>,
    column_names: Vec<String>,
    window_size: usize,
    window: Option<CursorWindow>,
    count: Option<usize>,
    window_capacity: usize,
    position: i64,
}

impl ResultCursor {
    pub(crate) fn new(
        connection: Arc<Connection>,
        sql: String,
        bind_args: Vec<Value>,
        signal: Option<CancellationSignal>,
        column_names: Vec<String>,
        window_size: usize,
    ) -> Self {
        Self {
            connection: Some(connection),
            sql,
            bind_args,
            signal,
            column_names,
            window_size,
            window: None,
            count: None,
            window_capacity: 0,
            position: -1,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    /// Index of `name`, ignoring case. A `table.` prefix is stripped first.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let name = match name.rfind('.') {
            Some(dot) => {
                error!(column = name, "requesting column name with table name");
                &name[dot + 1..]
            }
            None => name,
        };
        self.column_names
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    pub fn column_index_or_err(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            Error::misuse(format!("column '{name}' does not exist"))
        })
    }

    /// Number of result rows. The first call runs the query.
    pub fn count(&mut self) -> Result<usize> {
        match self.count {
            Some(count) => Ok(count),
            None => {
                self.fill_window(0)?;
                Ok(self.count.unwrap_or(0))
            }
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn move_to_position(&mut self, position: i64) -> Result<bool> {
        let count = self.count()? as i64;
        if position >= count {
            self.position = count;
            return Ok(false);
        }
        if position < 0 {
            self.position = -1;
            return Ok(false);
        }
        if position == self.position {
            return Ok(true);
        }

        let target = position as usize;
        let in_window = self.window.as_ref().is_some_and(|w| w.contains(target));
        if !in_window {
            if let Err(err) = self.fill_window(target) {
                self.position = -1;
                return Err(err);
            }
        }
        self.position = position;
        Ok(true)
    }

    pub fn move_by(&mut self, offset: i64) -> Result<bool> {
        self.move_to_position(self.position + offset)
    }

    pub fn move_to_first(&mut self) -> Result<bool> {
        self.move_to_position(0)
    }

    pub fn move_to_last(&mut self) -> Result<bool> {
        let count = self.count()? as i64;
        self.move_to_position(count - 1)
    }

    pub fn move_to_next(&mut self) -> Result<bool> {
        self.move_to_position(self.position + 1)
    }

    pub fn move_to_previous(&mut self) -> Result<bool> {
        self.move_to_position(self.position - 1)
    }

    pub fn is_before_first(&mut self) -> Result<bool> {
        Ok(self.count()? == 0 || self.position == -1)
    }

    pub fn is_after_last(&mut self) -> Result<bool> {
        let count = self.count()? as i64;
        Ok(count == 0 || self.position == count)
    }

    pub fn is_first(&mut self) -> Result<bool> {
        Ok(self.position == 0 && self.count()? != 0)
    }

    pub fn is_last(&mut self) -> Result<bool> {
        let count = self.count()? as i64;
        Ok(count != 0 && self.position == count - 1)
    }

    pub fn get_type(&self, column: usize) -> Result<DataType> {
        let (window, position) = self.current()?;
        window.get_type(position, column)
    }

    pub fn is_null(&self, column: usize) -> Result<bool> {
        Ok(self.get_type(column)? == DataType::Null)
    }

    pub fn get_long(&self, column: usize) -> Result<i64> {
        let (window, position) = self.current()?;
        window.get_long(position, column)
    }

    pub fn get_double(&self, column: usize) -> Result<f64> {
        let (window, position) = self.current()?;
        window.get_double(position, column)
    }

    pub fn get_string(&self, column: usize) -> Result<Option<String>> {
        let (window, position) = self.current()?;
        window.get_string(position, column)
    }

    pub fn get_blob(&self, column: usize) -> Result<Option<Vec<u8>>> {
        let (window, position) = self.current()?;
        window.get_blob(position, column)
    }

    pub fn get_value(&self, column: usize) -> Result<Value> {
        let (window, position) = self.current()?;
        window.get(position, column).cloned()
    }

    /// Start position of the current window, if one is filled.
    pub fn window_start_position(&self) -> Option<usize> {
        self.window.as_ref().map(CursorWindow::start_position)
    }

    /// Rows the first fill managed to hold; used to place later fills.
    pub fn window_capacity(&self) -> usize {
        self.window_capacity
    }

    /// Forgets the window and the row count; the next access re-runs the query.
    pub fn requery(&mut self) -> Result<()> {
        if self.connection.is_none() {
            return Err(Error::ConnectionClosed);
        }
        if let Some(window) = self.window.as_mut() {
            window.clear();
        }
        self.count = None;
        self.position = -1;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }

    /// Releases the window and the connection reference. Calling it again does nothing.
    pub fn close(&mut self) {
        self.window = None;
        self.connection = None;
        self.count = None;
        self.position = -1;
    }

    fn current(&self) -> Result<(&CursorWindow, usize)> {
        if self.connection.is_none() {
            return Err(Error::ConnectionClosed);
        }
        let count = self.count.map_or(0, |c| c as i64);
        if self.position < 0 || self.position >= count {
            return Err(Error::CursorIndexOutOfBounds {
                index: self.position,
                size: count,
            });
        }
        let window = self.window.as_ref().ok_or(Error::CursorIndexOutOfBounds {
            index: self.position,
            size: count,
        })?;
        Ok((window, self.position as usize))
    }

    fn fill_window(&mut self, required_position: usize) -> Result<()> {
        let connection = Arc::clone(self.connection.as_ref().ok_or(Error::ConnectionClosed)?);
        let mut window = self
            .window
            .take()
            .unwrap_or_else(|| CursorWindow::new(self.sql.clone(), self.window_size));
        window.clear();

        let counting = self.count.is_none();
        let capacity = if counting { 0 } else { self.window_capacity };
        let fill = WindowFill {
            start_position: pick_fill_window_start_position(required_position, capacity),
            required_position,
            count_all_rows: counting,
        };
        // on failure the window stays released
        let rows = connection.execute_for_cursor_window(
            &self.sql,
            &self.bind_args,
            &mut window,
            fill,
            self.signal.as_ref(),
        )?;

        if counting {
            self.count = Some(rows);
            self.window_capacity = window.num_rows();
            debug!(count = rows, sql = %self.sql, "received count(*) from window fill");
        }
        self.window = Some(window);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_keeps_a_third_of_the_window_behind() {
        assert_eq!(pick_fill_window_start_position(500, 300), 400);
        assert_eq!(pick_fill_window_start_position(50, 300), 0);
        assert_eq!(pick_fill_window_start_position(7, 0), 7);
    }

    #[test]
    fn window_is_bounded_by_bytes() {
        let mut window = CursorWindow::new("w", 7200);
        let mut added = 0;
        while window.put_row(vec![Value::Integer(added)]).is_ok() {
            added += 1;
        }
        assert_eq!(added, 300);
        assert_eq!(window.used_bytes(), 7200);

        let mut text_window = CursorWindow::new("t", 64);
        // 8 + 16 + 40 = 64 bytes
        assert!(text_window.put_row(vec![Value::Text("x".repeat(39))]).is_ok());
        assert!(text_window.put_row(vec![Value::Null]).is_err());
    }

    #[test]
    fn getters_convert_like_the_engine() -> Result<()> {
        let mut window = CursorWindow::new("w", 1024);
        window.set_start_position(10);
        window.set_num_columns(4);
        window
            .put_row(vec![
                Value::Integer(42),
                Value::Text("3.5".into()),
                Value::Null,
                Value::Blob(vec![1, 2]),
            ])
            .map_err(|_| Error::RowTooBig { position: 10 })?;

        assert!(window.contains(10));
        assert!(!window.contains(11));
        assert_eq!(window.get_long(10, 0)?, 42);
        assert_eq!(window.get_string(10, 0)?, Some("42".to_string()));
        assert_eq!(window.get_double(10, 1)?, 3.5);
        assert_eq!(window.get_long(10, 2)?, 0);
        assert_eq!(window.get_string(10, 2)?, None);
        assert_eq!(window.get_blob(10, 3)?, Some(vec![1, 2]));
        assert!(matches!(
            window.get_long(10, 3),
            Err(Error::ColumnTypeMismatch { .. })
        ));
        assert!(matches!(
            window.get(9, 0),
            Err(Error::CursorIndexOutOfBounds { .. })
        ));
        assert!(matches!(
            window.get(10, 4),
            Err(Error::CursorIndexOutOfBounds { .. })
        ));
        Ok(())
    }

    fn numbers(conn: &rusqlite::Connection, rows: usize) -> Result<NativeStatement> {
        conn.execute_batch("CREATE TABLE IF NOT EXISTS n(v INTEGER);")?;
        for v in 0..rows {
            conn.execute("INSERT INTO n VALUES (?1)", [v as i64])?;
        }
        unsafe { NativeStatement::prepare(conn.handle(), "SELECT v FROM n ORDER BY v") }
    }

    #[test]
    fn fill_counts_all_rows_and_keeps_the_first_page() -> Result<()> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let stmt = numbers(&conn, 1000)?;
        let mut window = CursorWindow::new("w", 240);
        let fill = WindowFill {
            start_position: 0,
            required_position: 0,
            count_all_rows: true,
        };
        assert_eq!(fill_window(&stmt, &mut window, fill)?, 1000);
        assert_eq!(window.num_rows(), 10);
        assert_eq!(window.start_position(), 0);
        Ok(())
    }

    #[test]
    fn fill_restarts_when_required_row_is_beyond_a_full_window() -> Result<()> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let stmt = numbers(&conn, 100)?;
        let mut window = CursorWindow::new("w", 240);
        let fill = WindowFill {
            start_position: 5,
            required_position: 37,
            count_all_rows: false,
        };
        fill_window(&stmt, &mut window, fill)?;
        assert!(window.contains(37));
        assert_eq!(window.start_position(), 35);
        assert_eq!(window.get_long(37, 0)?, 37);
        Ok(())
    }

    #[test]
    fn oversized_row_is_an_error() -> Result<()> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let stmt = unsafe { NativeStatement::prepare(conn.handle(), "SELECT zeroblob(4096)")? };
        let mut window = CursorWindow::new("w", 1024);
        let fill = WindowFill {
            start_position: 0,
            required_position: 0,
            count_all_rows: true,
        };
        assert!(matches!(
            fill_window(&stmt, &mut window, fill),
            Err(Error::RowTooBig { position: 0 })
        ));
        Ok(())
    }
}
