//! Columnar tabular results.
//!
//! A [`Table`] is what a query returns for one entity and what the cache
//! hands back to chart code. Columns are typed and every value is nullable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

/// A single cell, used for row-wise access and building.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Type of a non-null value.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(ColumnType::Text),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Values of one column, stored contiguously by type. `None` is null.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Text(Vec<Option<String>>),
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
}

macro_rules! dispatch {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Text($v) => $body,
            ColumnData::Integer($v) => $body,
            ColumnData::Float($v) => $body,
            ColumnData::Boolean($v) => $body,
            ColumnData::Timestamp($v) => $body,
        }
    };
}

impl ColumnData {
    pub fn empty(column_type: ColumnType) -> Self {
        Self::with_capacity(column_type, 0)
    }

    pub fn with_capacity(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Text => ColumnData::Text(Vec::with_capacity(capacity)),
            ColumnType::Integer => ColumnData::Integer(Vec::with_capacity(capacity)),
            ColumnType::Float => ColumnData::Float(Vec::with_capacity(capacity)),
            ColumnType::Boolean => ColumnData::Boolean(Vec::with_capacity(capacity)),
            ColumnType::Timestamp => ColumnData::Timestamp(Vec::with_capacity(capacity)),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Text(_) => ColumnType::Text,
            ColumnData::Integer(_) => ColumnType::Integer,
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Boolean(_) => ColumnType::Boolean,
            ColumnData::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_count(&self) -> usize {
        dispatch!(self, v => v.iter().filter(|x| x.is_none()).count())
    }

    /// Cell at `row`; `None` when out of bounds.
    pub fn get(&self, row: usize) -> Option<Value> {
        match self {
            ColumnData::Text(v) => v.get(row).map(|x| x.clone().into()),
            ColumnData::Integer(v) => v.get(row).map(|x| (*x).into()),
            ColumnData::Float(v) => v.get(row).map(|x| (*x).into()),
            ColumnData::Boolean(v) => v.get(row).map(|x| (*x).into()),
            ColumnData::Timestamp(v) => v.get(row).map(|x| (*x).into()),
        }
    }

    /// Append one cell. Nulls are accepted by every column type.
    pub fn push(&mut self, value: Value) -> Result<(), ColumnType> {
        match (self, value) {
            (ColumnData::Text(v), Value::Null) => v.push(None),
            (ColumnData::Integer(v), Value::Null) => v.push(None),
            (ColumnData::Float(v), Value::Null) => v.push(None),
            (ColumnData::Boolean(v), Value::Null) => v.push(None),
            (ColumnData::Timestamp(v), Value::Null) => v.push(None),
            (ColumnData::Text(v), Value::Text(x)) => v.push(Some(x)),
            (ColumnData::Integer(v), Value::Integer(x)) => v.push(Some(x)),
            (ColumnData::Float(v), Value::Float(x)) => v.push(Some(x)),
            (ColumnData::Boolean(v), Value::Boolean(x)) => v.push(Some(x)),
            (ColumnData::Timestamp(v), Value::Timestamp(x)) => v.push(Some(x)),
            (_, other) => {
                // Null was handled above, so a type is always present here.
                return Err(other.column_type().unwrap_or(ColumnType::Text));
            }
        }
        Ok(())
    }

    /// Append all cells of `other`, which must have the same type.
    fn extend_from(&mut self, other: ColumnData) -> Result<(), ColumnType> {
        match (self, other) {
            (ColumnData::Text(a), ColumnData::Text(b)) => a.extend(b),
            (ColumnData::Integer(a), ColumnData::Integer(b)) => a.extend(b),
            (ColumnData::Float(a), ColumnData::Float(b)) => a.extend(b),
            (ColumnData::Boolean(a), ColumnData::Boolean(b)) => a.extend(b),
            (ColumnData::Timestamp(a), ColumnData::Timestamp(b)) => a.extend(b),
            (_, other) => return Err(other.column_type()),
        }
        Ok(())
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    pub fn into_data(self) -> ColumnData {
        self.data
    }

    pub fn column_type(&self) -> ColumnType {
        self.data.column_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An immutable table: named, typed, equally long columns.
///
/// The row count is stored explicitly so a table without columns can still
/// carry rows (e.g. a `SELECT` with no projected columns).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    /// A table with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table, taking the row count from the first column.
    pub fn new(columns: Vec<Column>) -> CoreResult<Self> {
        let row_count = columns.first().map_or(0, Column::len);
        Self::with_row_count(columns, row_count)
    }

    /// Build a table with an explicit row count.
    pub fn with_row_count(columns: Vec<Column>, row_count: usize) -> CoreResult<Self> {
        for (i, column) in columns.iter().enumerate() {
            if column.len() != row_count {
                return Err(CoreError::LengthMismatch {
                    column: column.name.clone(),
                    expected: row_count,
                    found: column.len(),
                });
            }
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(CoreError::validation(format!(
                    "duplicate column name `{}`",
                    column.name
                )));
            }
        }
        Ok(Self { columns, row_count })
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `(name, type)` pairs in column order.
    pub fn schema(&self) -> Vec<(&str, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.name(), c.column_type()))
            .collect()
    }

    pub fn same_schema(&self, other: &Table) -> bool {
        self.schema() == other.schema()
    }

    /// One row as values, in column order.
    pub fn row(&self, index: usize) -> Option<Vec<Value>> {
        if index >= self.row_count {
            return None;
        }
        self.columns.iter().map(|c| c.data.get(index)).collect()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<Value> {
        self.column(column).and_then(|c| c.data.get(row))
    }

    /// Append a text column holding `origin` on every row.
    pub fn with_origin(mut self, column: &str, origin: &str) -> CoreResult<Self> {
        if self.column(column).is_some() {
            return Err(CoreError::validation(format!(
                "column `{column}` already exists"
            )));
        }
        let values = vec![Some(origin.to_string()); self.row_count];
        self.columns
            .push(Column::new(column, ColumnData::Text(values)));
        Ok(self)
    }

    /// Concatenate tables row-wise, preserving input order.
    ///
    /// Tables without columns and rows (nothing was returned at all) are
    /// skipped; every other table must share the first one's schema.
    pub fn concat(tables: impl IntoIterator<Item = Table>) -> CoreResult<Table> {
        let mut out: Option<Table> = None;
        for table in tables {
            if table.columns.is_empty() && table.row_count == 0 {
                continue;
            }
            let Some(acc) = out.as_mut() else {
                out = Some(table);
                continue;
            };
            if !acc.same_schema(&table) {
                return Err(CoreError::schema_mismatch(format!(
                    "{:?} vs {:?}",
                    acc.schema(),
                    table.schema()
                )));
            }
            acc.row_count += table.row_count;
            for (dst, src) in acc.columns.iter_mut().zip(table.columns) {
                let name = dst.name.clone();
                dst.data
                    .extend_from(src.data)
                    .map_err(|found| CoreError::TypeMismatch {
                        column: name,
                        expected: dst.column_type(),
                        found,
                    })?;
            }
        }
        Ok(out.unwrap_or_default())
    }
}

/// Row-wise builder for [`Table`]. Declare every column before pushing rows.
#[derive(Debug, Default)]
pub struct TableBuilder {
    columns: Vec<Column>,
    rows: usize,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns
            .push(Column::new(name, ColumnData::empty(column_type)));
        self
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> CoreResult<()> {
        if row.len() != self.columns.len() {
            return Err(CoreError::validation(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            let expected = column.column_type();
            column
                .data
                .push(value)
                .map_err(|found| CoreError::TypeMismatch {
                    column: column.name.clone(),
                    expected,
                    found,
                })?;
        }
        self.rows += 1;
        Ok(())
    }

    pub fn build(self) -> CoreResult<Table> {
        Table::with_row_count(self.columns, self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn commits(repo: i64, hashes: &[&str]) -> Table {
        let mut builder = TableBuilder::new()
            .column("repo_id", ColumnType::Integer)
            .column("commit_hash", ColumnType::Text)
            .column("author_timestamp", ColumnType::Timestamp);
        for (i, h) in hashes.iter().enumerate() {
            let ts = Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap();
            builder
                .push_row(vec![repo.into(), (*h).into(), ts.into()])
                .unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn builder_rejects_wrong_types() {
        let mut builder = TableBuilder::new().column("n", ColumnType::Integer);
        let err = builder.push_row(vec![Value::from("x")]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::TypeMismatch {
                expected: ColumnType::Integer,
                found: ColumnType::Text,
                ..
            }
        ));
        builder.push_row(vec![Value::Null]).unwrap();
        let table = builder.build().unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.value(0, "n"), Some(Value::Null));
    }

    #[test]
    fn new_rejects_ragged_columns() {
        let err = Table::new(vec![
            Column::new("a", ColumnData::Integer(vec![Some(1), Some(2)])),
            Column::new("b", ColumnData::Integer(vec![Some(1)])),
        ])
        .unwrap_err();
        assert!(matches!(err, CoreError::LengthMismatch { .. }));
    }

    #[test]
    fn new_rejects_duplicate_names() {
        let err = Table::new(vec![
            Column::new("a", ColumnData::Integer(vec![])),
            Column::new("a", ColumnData::Text(vec![])),
        ])
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn concat_preserves_order() {
        let combined = Table::concat([commits(1, &["a", "b"]), commits(2, &["c"])]).unwrap();
        assert_eq!(combined.row_count(), 3);
        assert_eq!(combined.value(0, "commit_hash"), Some("a".into()));
        assert_eq!(combined.value(2, "commit_hash"), Some("c".into()));
        assert_eq!(combined.value(2, "repo_id"), Some(2_i64.into()));
    }

    #[test]
    fn concat_skips_shapeless_tables() {
        let combined = Table::concat([Table::empty(), commits(1, &["a"])]).unwrap();
        assert_eq!(combined.row_count(), 1);
        assert_eq!(Table::concat(Vec::new()).unwrap(), Table::empty());
    }

    #[test]
    fn concat_rejects_schema_mismatch() {
        let other = TableBuilder::new()
            .column("repo_id", ColumnType::Text)
            .build()
            .unwrap();
        let err = Table::concat([commits(1, &["a"]), other]).unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch(_)));
    }

    #[test]
    fn with_origin_tags_every_row() {
        let table = commits(7, &["a", "b"]).with_origin("entity_id", "repoA").unwrap();
        assert_eq!(table.column_count(), 4);
        assert_eq!(table.value(1, "entity_id"), Some("repoA".into()));
        assert!(table.with_origin("entity_id", "x").is_err());
    }

    #[test]
    fn row_access() {
        let table = commits(3, &["z"]);
        let row = table.row(0).unwrap();
        assert_eq!(row[0], Value::Integer(3));
        assert!(table.row(1).is_none());
    }
}
