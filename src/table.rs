// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory tabular data read from a spreadsheet, before serialization

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone};
use derive_builder::Builder;
use snafu::ensure;

use crate::{error, Result};

/// A fully materialized sheet: ordered column names plus ordered rows
#[derive(Debug, Clone, Default, PartialEq, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct Table {
    /// Column names in sheet order
    #[builder(default)]
    columns: Vec<String>,
    /// Data rows, each holding one value per column
    #[builder(default)]
    rows: Vec<Row>,
}

impl TableBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        let columns = self.columns.as_deref().unwrap_or_default();
        check_columns(columns).map_err(|e| e.to_string())?;
        for row in self.rows.iter().flatten() {
            check_width(columns.len(), row).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

fn check_columns(columns: &[String]) -> Result<()> {
    let mut seen = HashSet::with_capacity(columns.len());
    for column in columns {
        ensure!(
            seen.insert(column.as_str()),
            error::DuplicateColumnSnafu { column }
        );
    }
    Ok(())
}

fn check_width(expected: usize, row: &Row) -> Result<()> {
    ensure!(
        row.len() == expected,
        error::InvalidColumnCountSnafu {
            expected,
            actual: row.len(),
        }
    );
    Ok(())
}

impl Table {
    /// Create a new table builder
    pub fn builder() -> TableBuilder {
        TableBuilder::default()
    }

    /// Create an empty table with the given columns
    pub fn new<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        check_columns(&columns)?;
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Append a row; it must carry exactly one value per column
    pub fn push_row(&mut self, row: Row) -> Result<()> {
        check_width(self.columns.len(), &row)?;
        self.rows.push(row);
        Ok(())
    }

    /// Build a table from JSON objects, taking column order from first appearance.
    ///
    /// Keys missing from a record become nulls. Nested arrays and objects cannot
    /// be represented as cells and are rejected.
    pub fn from_json_records(records: &[serde_json::Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for record in records {
            let object = record.as_object().ok_or_else(|| {
                error::UnsupportedValueSnafu {
                    column: "<record>",
                    type_name: json_type_name(record),
                }
                .build()
            })?;
            for key in object.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }

        let mut table = Self::new(columns)?;
        for record in records {
            // Non-objects were rejected above.
            let Some(object) = record.as_object() else {
                continue;
            };
            let mut row = Row::with_capacity(table.columns.len());
            for column in &table.columns {
                let value = match object.get(column) {
                    Some(v) => CellValue::from_json(column, v)?,
                    None => CellValue::Null,
                };
                row = row.add_value(value);
            }
            table.rows.push(row);
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// A table with zero rows is rejected before ingestion
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Borrow row `index` together with the column names
    pub fn row(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|row| RowRef {
            columns: &self.columns,
            values: &row.values,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(|row| RowRef {
            columns: &self.columns,
            values: &row.values,
        })
    }

    /// Set every cell of `name` from `f(row_index)`, appending the column when
    /// it does not exist yet. Returns `true` if an existing column was overwritten.
    pub fn set_column<F>(&mut self, name: &str, mut f: F) -> bool
    where
        F: FnMut(usize) -> CellValue,
    {
        match self.column_index(name) {
            Some(index) => {
                for (i, row) in self.rows.iter_mut().enumerate() {
                    row.values[index] = f(i);
                }
                true
            }
            None => {
                self.columns.push(name.to_string());
                for (i, row) in self.rows.iter_mut().enumerate() {
                    row.values.push(f(i));
                }
                false
            }
        }
    }
}

/// One data row, values positionally aligned with the table's columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<CellValue>,
}

impl Row {
    /// Create a new empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new row with pre-allocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    /// Create a row directly from values
    pub fn from_values(values: Vec<CellValue>) -> Self {
        Self { values }
    }

    /// Add a value to the row
    pub fn add_value(mut self, value: impl Into<CellValue>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A row borrowed from its table, addressable by column name
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [CellValue],
}

impl<'a> RowRef<'a> {
    pub fn columns(&self) -> &'a [String] {
        self.columns
    }

    pub fn get(&self, column: &str) -> Option<&'a CellValue> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)
    }

    /// `(column, value)` pairs in column order
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a CellValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// A dynamically typed spreadsheet cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Missing value
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Duration(TimeDelta),
}

impl CellValue {
    /// Name of the runtime type, as recorded in a document's `dtypes`.
    ///
    /// Names follow the spreadsheet tooling the bronze consumers already know:
    /// a missing cell is a float NaN there, so it reports `float`. That holds for
    /// gaps in date and duration columns too, which that tooling would mark as
    /// `NaTType`; a cell carries no column kind to tell them apart.
    pub fn type_name(&self) -> &'static str {
        match self {
            CellValue::Null => "float",
            CellValue::Bool(_) => "bool",
            CellValue::Int(_) => "int",
            CellValue::Float(_) => "float",
            CellValue::String(_) => "str",
            CellValue::DateTime(_) => "Timestamp",
            CellValue::Date(_) => "date",
            CellValue::Duration(_) => "Timedelta",
        }
    }

    /// Missing, or a float with no JSON representation
    pub fn is_missing(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Float(v) => !v.is_finite(),
            _ => false,
        }
    }

    /// Classify a JSON value from `column`, rejecting nested structures
    pub fn from_json(column: &str, value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(CellValue::Null),
            Value::Bool(v) => Ok(CellValue::Bool(*v)),
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Ok(CellValue::Int(v))
                } else {
                    // u64 beyond i64::MAX or a real number
                    Ok(CellValue::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Value::String(v) => Ok(CellValue::String(v.clone())),
            Value::Array(_) | Value::Object(_) => error::UnsupportedValueSnafu {
                column,
                type_name: json_type_name(value),
            }
            .fail(),
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "str",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "dict",
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for CellValue {
                fn from(v: $ty) -> Self {
                    CellValue::Int(i64::from(v))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for CellValue {
    fn from(v: f32) -> Self {
        CellValue::Float(f64::from(v))
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::String(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::String(v.to_string())
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(v: NaiveDateTime) -> Self {
        CellValue::DateTime(v)
    }
}

/// Zoned timestamps keep the instant but not the zone: the cell holds the UTC
/// wall clock and serializes without an offset marker.
impl<Tz: TimeZone> From<DateTime<Tz>> for CellValue {
    fn from(v: DateTime<Tz>) -> Self {
        CellValue::DateTime(v.naive_utc())
    }
}

impl From<NaiveDate> for CellValue {
    fn from(v: NaiveDate) -> Self {
        CellValue::Date(v)
    }
}

impl From<TimeDelta> for CellValue {
    fn from(v: TimeDelta) -> Self {
        CellValue::Duration(v)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(CellValue::Null, Into::into)
    }
}
