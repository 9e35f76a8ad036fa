use crate::error::{Error, Result};
use crate::native::NativeStatement;
use crate::value::{DataType, Value};

/// Fully materialized query result.
///
/// Each column has a single storage class. `NULL` may appear in any column;
/// a column whose values are all `NULL` reports [`DataType::Null`].
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    column_names: Vec<String>,
    column_types: Vec<DataType>,
    rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Steps `statement` to completion, copying every row.
    pub(crate) fn collect(statement: &NativeStatement) -> Result<Self> {
        let column_names = statement.column_names();
        let mut column_types = vec![DataType::Null; column_names.len()];
        let mut rows = Vec::new();

        while statement.step()? {
            let row = statement.row_values();
            for (column, value) in row.iter().enumerate() {
                let kind = value.data_type();
                match column_types[column] {
                    _ if kind == DataType::Null => {}
                    DataType::Null => column_types[column] = kind,
                    current if current == kind => {}
                    _ => {
                        return Err(Error::MixedColumnTypes {
                            column,
                            name: column_names[column].clone(),
                        })
                    }
                }
            }
            rows.push(row);
        }

        Ok(Self {
            column_names,
            column_types,
            rows,
        })
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn column_types(&self) -> &[DataType] {
        &self.column_types
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn get(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row)?.get(column)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }
}
