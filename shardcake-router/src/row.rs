use std::sync::Arc;

use crate::value::{FromValue, Value, ValueError};

#[derive(Debug, Clone, PartialEq)]
/// A single row returned by a pool.
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from its column names and values.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    #[inline]
    /// The column names of the row.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[inline]
    /// The raw values of the row.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Gets the value at the given column index converted to `T`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, ValueError> {
        let value = self
            .values
            .get(index)
            .ok_or(ValueError::ColumnOutOfRange {
                index,
                len: self.values.len(),
            })?;
        T::from_value(value)
    }

    /// Gets the value of the given named column converted to `T`.
    pub fn get_named<T: FromValue>(&self, column: &str) -> Result<T, ValueError> {
        let index = self
            .columns
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| ValueError::UnknownColumn(column.to_string()))?;
        self.get(index)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// A fully materialised set of rows returned by a pool query.
pub struct RowSet {
    pub columns: Arc<[String]>,
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn new(columns: Arc<[String]>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }
}

/// A helper trait for converting between a [Row] reference and the given type.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, ValueError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, ValueError> {
        Ok(row.clone())
    }
}
