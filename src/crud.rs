//! Statement builders for the common insert, read, update and delete shapes.
//!
//! Everything built here runs through the regular [`Connection`] execute
//! methods, so it shares the statement cache, the transaction stack and the
//! operation log with hand-written SQL.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::cancel::CancellationSignal;
use crate::connection::Connection;
use crate::cursor::ResultCursor;
use crate::error::{Error, Result};
use crate::rows::RowSet;
use crate::value::Value;

/// `ON CONFLICT` behaviour for generated INSERT and UPDATE statements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictAlgorithm {
    #[default]
    None,
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
}

impl ConflictAlgorithm {
    fn sql(self) -> &'static str {
        match self {
            ConflictAlgorithm::None => "",
            ConflictAlgorithm::Rollback => " OR ROLLBACK ",
            ConflictAlgorithm::Abort => " OR ABORT ",
            ConflictAlgorithm::Fail => " OR FAIL ",
            ConflictAlgorithm::Ignore => " OR IGNORE ",
            ConflictAlgorithm::Replace => " OR REPLACE ",
        }
    }
}

/// Query operators for building WHERE clauses
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperator {
    Equal(Value),
    NotEqual(Value),
    GreaterThan(Value),
    GreaterThanOrEqual(Value),
    LessThan(Value),
    LessThanOrEqual(Value),
    Like(String),
    In(Vec<Value>),
}

/// Conjunction of conditions, rendered in the order they were added.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Query {
    pub conditions: Vec<(String, QueryOperator)>,
    /// Hand-written clause with its own `?` arguments, ANDed after the conditions.
    pub clause: Option<(String, Vec<Value>)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, field: &str, op: QueryOperator) -> Self {
        self.conditions.push((field.to_string(), op));
        self
    }

    pub fn with_clause(mut self, clause: impl Into<String>, args: Vec<Value>) -> Self {
        self.clause = Some((clause.into(), args));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.clause.as_ref().map_or(true, |(c, _)| c.trim().is_empty())
    }

    /// Renders the WHERE clause body (without `WHERE`) and its bind arguments.
    /// `None` when there is nothing to filter on.
    pub fn to_where_clause(&self) -> Option<(String, Vec<Value>)> {
        if self.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(self.conditions.len() + 1);
        let mut args = Vec::new();
        for (field, op) in &self.conditions {
            let part = match op {
                QueryOperator::Equal(Value::Null) => format!("{field} IS NULL"),
                QueryOperator::NotEqual(Value::Null) => format!("{field} IS NOT NULL"),
                QueryOperator::Equal(v) => bind_one(&mut args, format!("{field} = ?"), v),
                QueryOperator::NotEqual(v) => bind_one(&mut args, format!("{field} != ?"), v),
                QueryOperator::GreaterThan(v) => bind_one(&mut args, format!("{field} > ?"), v),
                QueryOperator::GreaterThanOrEqual(v) => {
                    bind_one(&mut args, format!("{field} >= ?"), v)
                }
                QueryOperator::LessThan(v) => bind_one(&mut args, format!("{field} < ?"), v),
                QueryOperator::LessThanOrEqual(v) => {
                    bind_one(&mut args, format!("{field} <= ?"), v)
                }
                QueryOperator::Like(pattern) => {
                    args.push(Value::Text(pattern.clone()));
                    format!("{field} LIKE ?")
                }
                QueryOperator::In(values) => {
                    let placeholders = vec!["?"; values.len()].join(", ");
                    args.extend(values.iter().cloned());
                    format!("{field} IN ({placeholders})")
                }
            };
            parts.push(part);
        }
        if let Some((clause, clause_args)) = &self.clause {
            if !clause.trim().is_empty() {
                parts.push(if parts.is_empty() {
                    clause.clone()
                } else {
                    format!("({clause})")
                });
                args.extend(clause_args.iter().cloned());
            }
        }
        Some((parts.join(" AND "), args))
    }
}

fn bind_one(args: &mut Vec<Value>, sql: String, value: &Value) -> String {
    args.push(value.clone());
    sql
}

/// A row to insert. Columns are written in name order.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOperation {
    pub table: String,
    /// Column set to NULL when `values` is empty; SQLite cannot insert a row with no columns.
    pub null_column_hack: Option<String>,
    pub values: BTreeMap<String, Value>,
    pub conflict: ConflictAlgorithm,
}

impl InsertOperation {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            null_column_hack: None,
            values: BTreeMap::new(),
            conflict: ConflictAlgorithm::None,
        }
    }

    pub fn with_value(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    pub fn with_null_column_hack(mut self, column: impl Into<String>) -> Self {
        self.null_column_hack = Some(column.into());
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictAlgorithm) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        let mut sql = format!("INSERT{} INTO {}(", self.conflict.sql(), self.table);
        if self.values.is_empty() {
            let Some(column) = &self.null_column_hack else {
                return Err(Error::InvalidArgument(format!(
                    "cannot insert an empty row into {} without a null column hack",
                    self.table
                )));
            };
            sql.push_str(column);
            sql.push_str(") VALUES (NULL)");
            return Ok((sql, Vec::new()));
        }
        let columns: Vec<&str> = self.values.keys().map(String::as_str).collect();
        sql.push_str(&columns.join(","));
        sql.push_str(") VALUES (");
        sql.push_str(&vec!["?"; columns.len()].join(","));
        sql.push(')');
        Ok((sql, self.values.values().cloned().collect()))
    }
}

/// A SELECT over one table or join expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOperation {
    pub table: String,
    pub distinct: bool,
    /// `None` or empty selects `*`.
    pub fields: Option<Vec<String>>,
    pub query: Query,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<Vec<(String, bool)>>, // (field, is_ascending)
    /// `"n"` or `"offset, n"`.
    pub limit: Option<String>,
}

impl ReadOperation {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_group_by(mut self, group_by: impl Into<String>, having: Option<String>) -> Self {
        self.group_by = Some(group_by.into());
        self.having = having;
        self
    }

    pub fn with_order_by(mut self, field: &str, ascending: bool) -> Self {
        self.order_by
            .get_or_insert_with(Vec::new)
            .push((field.to_string(), ascending));
        self
    }

    pub fn with_limit(mut self, limit: impl Into<String>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        let group_by = non_empty(&self.group_by);
        let having = non_empty(&self.having);
        let limit = non_empty(&self.limit);
        if group_by.is_none() && having.is_some() {
            return Err(Error::InvalidArgument(
                "HAVING clauses are only permitted when using a groupBy clause".to_string(),
            ));
        }
        if let Some(limit) = limit {
            if !is_valid_limit(limit) {
                return Err(Error::InvalidArgument(format!("invalid LIMIT clauses:{limit}")));
            }
        }

        let mut sql = String::with_capacity(120);
        sql.push_str("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        match self.fields.as_deref() {
            Some(fields) if !fields.is_empty() => {
                sql.push_str(&fields.join(", "));
                sql.push(' ');
            }
            _ => sql.push_str("* "),
        }
        sql.push_str("FROM ");
        sql.push_str(&self.table);

        let (where_clause, args) = self.query.to_where_clause().unzip();
        let order_by = self.order_by.as_ref().filter(|o| !o.is_empty()).map(|order| {
            order
                .iter()
                .map(|(field, ascending)| {
                    format!("{field} {}", if *ascending { "ASC" } else { "DESC" })
                })
                .collect::<Vec<_>>()
                .join(", ")
        });
        append_clause(&mut sql, " WHERE ", where_clause.as_deref());
        append_clause(&mut sql, " GROUP BY ", group_by);
        append_clause(&mut sql, " HAVING ", having);
        append_clause(&mut sql, " ORDER BY ", order_by.as_deref());
        append_clause(&mut sql, " LIMIT ", limit);
        Ok((sql, args.unwrap_or_default()))
    }
}

/// New column values for the rows matching `query`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    pub table: String,
    pub query: Query,
    pub updates: BTreeMap<String, Value>,
    pub conflict: ConflictAlgorithm,
}

impl UpdateOperation {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            query: Query::new(),
            updates: BTreeMap::new(),
            conflict: ConflictAlgorithm::None,
        }
    }

    pub fn with_update(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.updates.insert(column.to_string(), value.into());
        self
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictAlgorithm) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        if self.updates.is_empty() {
            return Err(Error::InvalidArgument("Empty values".to_string()));
        }
        let mut sql = format!("UPDATE {}{} SET ", self.conflict.sql(), self.table);
        let assignments: Vec<String> = self.updates.keys().map(|c| format!("{c}=?")).collect();
        sql.push_str(&assignments.join(","));
        let mut args: Vec<Value> = self.updates.values().cloned().collect();
        if let Some((where_clause, where_args)) = self.query.to_where_clause() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
            args.extend(where_args);
        }
        Ok((sql, args))
    }
}

/// Removes the rows matching `query`; an empty query removes every row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOperation {
    pub table: String,
    pub query: Query,
}

impl DeleteOperation {
    pub fn new(table: impl Into<String>, query: Query) -> Self {
        Self {
            table: table.into(),
            query,
        }
    }

    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self.query.to_where_clause() {
            Some((where_clause, args)) => {
                (format!("DELETE FROM {} WHERE {where_clause}", self.table), args)
            }
            None => (format!("DELETE FROM {}", self.table), Vec::new()),
        }
    }
}

fn non_empty(clause: &Option<String>) -> Option<&str> {
    clause.as_deref().filter(|c| !c.trim().is_empty())
}

fn append_clause(sql: &mut String, name: &str, clause: Option<&str>) {
    if let Some(clause) = clause.filter(|c| !c.is_empty()) {
        sql.push_str(name);
        sql.push_str(clause);
    }
}

fn is_valid_limit(limit: &str) -> bool {
    static LIMIT: OnceLock<Option<Regex>> = OnceLock::new();
    LIMIT
        .get_or_init(|| Regex::new(r"^\s*\d+\s*(,\s*\d+\s*)?$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(limit))
}

impl Connection {
    /// Inserts one row. Returns its row id, or `None` when nothing was
    /// inserted (for example under [`ConflictAlgorithm::Ignore`]).
    pub fn insert(&self, op: &InsertOperation) -> Result<Option<i64>> {
        let (sql, args) = op.to_sql()?;
        self.execute_for_last_inserted_row_id(&sql, &args, None)
    }

    /// Returns the number of rows changed.
    pub fn update(&self, op: &UpdateOperation) -> Result<usize> {
        let (sql, args) = op.to_sql()?;
        self.execute_for_changed_row_count(&sql, &args, None)
    }

    /// Returns the number of rows removed.
    pub fn delete(&self, op: &DeleteOperation) -> Result<usize> {
        let (sql, args) = op.to_sql();
        self.execute_for_changed_row_count(&sql, &args, None)
    }

    /// Opens a windowed cursor over the rows `op` selects.
    pub fn read(
        self: &Arc<Self>,
        op: &ReadOperation,
        signal: Option<&CancellationSignal>,
    ) -> Result<ResultCursor> {
        let (sql, args) = op.to_sql()?;
        self.query(&sql, &args, signal)
    }

    /// Materializes every row `op` selects.
    pub fn read_all(&self, op: &ReadOperation, signal: Option<&CancellationSignal>) -> Result<RowSet> {
        let (sql, args) = op.to_sql()?;
        self.execute_for_rows(&sql, &args, signal)?
            .ok_or_else(|| Error::misuse("a SELECT was routed as a transaction statement"))
    }
}
