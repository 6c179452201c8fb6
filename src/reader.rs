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

//! Reading spreadsheet workbooks into a [`Table`]

use std::collections::{HashMap, HashSet};
use std::path::Path;

use calamine::{open_workbook_auto, Data, DataType, Range, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use snafu::{ensure, OptionExt, ResultExt};
use tracing::debug;

use crate::table::{CellValue, Row, Table};
use crate::{error, Result};

pub const SUPPORTED_EXTENSIONS: [&str; 2] = [".xlsx", ".xls"];

/// Check that `path` is an existing file with a supported extension
pub fn validate_file(path: &Path) -> Result<()> {
    ensure!(
        path.is_file(),
        error::FileNotFoundSnafu {
            path: path.to_path_buf(),
        }
    );

    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    ensure!(
        SUPPORTED_EXTENSIONS.contains(&extension.as_str()),
        error::UnsupportedExtensionSnafu {
            extension,
            supported: SUPPORTED_EXTENSIONS.join(", "),
        }
    );
    Ok(())
}

pub struct WorkbookReader;

impl WorkbookReader {
    /// Read `sheet` (or the first sheet) of the workbook at `path`.
    ///
    /// The first row is the header; every following row becomes a table row.
    pub fn read(path: &Path, sheet: Option<&str>) -> Result<Table> {
        validate_file(path)?;

        let mut workbook = open_workbook_auto(path).context(error::ReadWorkbookSnafu { path })?;
        let sheet_names = workbook.sheet_names();
        let sheet_name = match sheet {
            Some(name) => {
                ensure!(
                    sheet_names.iter().any(|s| s == name),
                    error::MissingSheetSnafu { path, sheet: name }
                );
                name.to_string()
            }
            None => sheet_names
                .first()
                .cloned()
                .context(error::MissingSheetSnafu {
                    path,
                    sheet: "<first>",
                })?,
        };

        let range = workbook
            .worksheet_range(&sheet_name)
            .context(error::ReadWorkbookSnafu { path })?;
        let table = table_from_range(&range)?;
        debug!(
            path = %path.display(),
            sheet = %sheet_name,
            rows = table.len(),
            columns = table.columns().len(),
            "Read worksheet"
        );
        Ok(table)
    }
}

/// Build a table from a sheet range whose first row is the header
pub fn table_from_range(range: &Range<Data>) -> Result<Table> {
    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Table::default());
    };
    let columns = normalize_headers(header);

    let mut values: Vec<Vec<CellValue>> = rows
        .map(|row| row.iter().map(convert_cell).collect())
        .collect();
    while values
        .last()
        .is_some_and(|row| row.iter().all(|v| *v == CellValue::Null))
    {
        values.pop();
    }
    coerce_numeric_columns(columns.len(), &mut values);

    Table::builder()
        .columns(columns)
        .rows(values.into_iter().map(Row::from_values).collect::<Vec<_>>())
        .build()
        .context(error::BuildTableSnafu)
}

/// Blank headers become `Unnamed: {i}`; repeats get `.1`, `.2`, ... suffixes
pub fn normalize_headers(header: &[Data]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(header.len());
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut columns = Vec::with_capacity(header.len());

    for (i, cell) in header.iter().enumerate() {
        let name = match cell {
            Data::Empty => String::new(),
            other => other.to_string().trim().to_string(),
        };
        let name = if name.is_empty() {
            format!("Unnamed: {i}")
        } else {
            name
        };

        let mut candidate = name.clone();
        while seen.contains(&candidate) {
            let count = counts.entry(name.clone()).or_insert(0);
            *count += 1;
            candidate = format!("{name}.{count}");
        }
        seen.insert(candidate.clone());
        columns.push(candidate);
    }
    columns
}

/// Map one spreadsheet cell to a [`CellValue`]
pub fn convert_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Null,
        Data::Bool(b) => CellValue::Bool(*b),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => float_cell(*f),
        Data::String(s) => CellValue::String(s.clone()),
        Data::DateTime(dt) if dt.is_duration() => cell
            .as_duration()
            .map_or(CellValue::Float(dt.as_f64()), CellValue::Duration),
        Data::DateTime(dt) => cell
            .as_datetime()
            .map_or(CellValue::Float(dt.as_f64()), CellValue::DateTime),
        Data::DateTimeIso(s) => parse_iso(s),
        Data::DurationIso(s) => cell
            .as_duration()
            .map_or_else(|| CellValue::String(s.clone()), CellValue::Duration),
    }
}

// Spreadsheets store every number as a float.
fn float_cell(value: f64) -> CellValue {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        CellValue::Int(value as i64)
    } else {
        CellValue::Float(value)
    }
}

fn parse_iso(literal: &str) -> CellValue {
    if let Ok(dt) = literal.parse::<NaiveDateTime>() {
        CellValue::DateTime(dt)
    } else if let Ok(date) = literal.parse::<NaiveDate>() {
        CellValue::Date(date)
    } else {
        CellValue::String(literal.to_string())
    }
}

/// A column of numbers that holds any float or any gap is a float column.
///
/// Columns that also hold non-numeric values are left untouched.
fn coerce_numeric_columns(width: usize, rows: &mut [Vec<CellValue>]) {
    for col in 0..width {
        let mut has_int = false;
        let mut has_float_or_null = false;
        let mut numeric = true;
        for value in rows.iter().filter_map(|row| row.get(col)) {
            match value {
                CellValue::Int(_) => has_int = true,
                CellValue::Float(_) | CellValue::Null => has_float_or_null = true,
                _ => numeric = false,
            }
        }
        if !(numeric && has_int && has_float_or_null) {
            continue;
        }
        for value in rows.iter_mut().filter_map(|row| row.get_mut(col)) {
            if let CellValue::Int(i) = *value {
                *value = CellValue::Float(i as f64);
            }
        }
    }
}
