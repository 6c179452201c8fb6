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

//! Row serialization for the bronze table
//!
//! Every row becomes a self-describing JSON document:
//!
//! ```json
//! {
//!   "metadata": {
//!     "column_names": ["name", "amount", "id"],
//!     "dtypes": {"name": "str", "amount": "float", "id": "str"}
//!   },
//!   "data": {"name": "widget", "amount": null, "id": "1"}
//! }
//! ```
//!
//! `dtypes` names the type of each cell *before* conversion, while `data` holds
//! the converted, JSON-safe value.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::warn;

use crate::table::{CellValue, RowRef, Table};
use crate::{error, Result};

/// Name of the column stamped with each row's positional index
pub const ROW_ID_COLUMN: &str = "id";

const NANOS_PER_SEC: i128 = 1_000_000_000;
const NANOS_PER_MINUTE: i128 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: i128 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: i128 = 24 * NANOS_PER_HOUR;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMetadata {
    pub column_names: Vec<String>,
    pub dtypes: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDocument {
    pub metadata: RowMetadata,
    pub data: IndexMap<String, JsonValue>,
}

/// One row ready for the bronze table: `(id, filename, raw_data)`.
/// `uploaded_at` is filled in by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedRecord {
    pub row_id: String,
    pub filename: String,
    pub document: String,
}

impl SerializedRecord {
    /// Parse the stored document back
    pub fn parse_document(&self) -> Result<RowDocument> {
        serde_json::from_str(&self.document).context(error::SerdeJsonSnafu)
    }
}

/// Converts rows into [`RowDocument`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RowSerializer;

impl RowSerializer {
    /// Convert one cell to its JSON-safe form
    pub fn convert_value(value: &CellValue) -> JsonValue {
        match value {
            CellValue::Null => JsonValue::Null,
            // NaN and infinities have no JSON form
            CellValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            CellValue::DateTime(v) => JsonValue::String(format_datetime(v)),
            CellValue::Date(v) => JsonValue::String(format_date(v)),
            CellValue::Duration(v) => JsonValue::String(format_duration(v)),
            CellValue::Bool(v) => JsonValue::Bool(*v),
            CellValue::Int(v) => JsonValue::from(*v),
            CellValue::String(v) => JsonValue::String(v.clone()),
        }
    }

    pub fn serialize_row(row: RowRef<'_>) -> RowDocument {
        let column_names: Vec<String> = row.columns().to_vec();
        let mut dtypes = IndexMap::with_capacity(column_names.len());
        let mut data = IndexMap::with_capacity(column_names.len());
        for (column, value) in row.iter() {
            dtypes.insert(column.to_string(), value.type_name().to_string());
            data.insert(column.to_string(), Self::convert_value(value));
        }

        RowDocument {
            metadata: RowMetadata {
                column_names,
                dtypes,
            },
            data,
        }
    }

    /// Serialize a row straight to its JSON text
    pub fn row_to_json(row: RowRef<'_>) -> Result<String> {
        serde_json::to_string(&Self::serialize_row(row)).context(error::SerdeJsonSnafu)
    }

    /// Serialize every row of `table`, in order
    pub fn serialize_table(table: &Table) -> Result<Vec<String>> {
        table.iter().map(Self::row_to_json).collect()
    }
}

/// Stamp the `id` column with each row's zero-based position, as a string.
///
/// An existing `id` column is overwritten in place; otherwise `id` becomes the
/// last column.
pub fn stamp_row_ids(table: &mut Table) {
    let overwritten = table.set_column(ROW_ID_COLUMN, |i| CellValue::String(i.to_string()));
    if overwritten {
        warn!(
            column = ROW_ID_COLUMN,
            "Table already has an id column, overwriting it with row positions"
        );
    }
}

/// Stamp row ids and serialize the whole table into records for `filename`.
///
/// Serialization finishes for every row before anything is returned, so a bad
/// cell never leaves a partially serialized file behind.
pub fn prepare_records(mut table: Table, filename: &str) -> Result<Vec<SerializedRecord>> {
    stamp_row_ids(&mut table);
    let documents = RowSerializer::serialize_table(&table)?;

    Ok(documents
        .into_iter()
        .enumerate()
        .map(|(index, document)| SerializedRecord {
            row_id: index.to_string(),
            filename: filename.to_string(),
            document,
        })
        .collect())
}

/// ISO-8601, fractional seconds only when non-zero: `2024-03-15T10:30:00`
pub fn format_datetime(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

pub fn format_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

/// Render a duration as `"{days} days HH:MM:SS[.fraction]"`.
///
/// Days are floor-divided so the clock part is never negative:
/// minus one second is `"-1 days +23:59:59"`.
pub fn format_duration(value: &TimeDelta) -> String {
    let total = i128::from(value.num_seconds()) * NANOS_PER_SEC
        + i128::from(value.subsec_nanos());
    let days = total.div_euclid(NANOS_PER_DAY);
    let rem = total.rem_euclid(NANOS_PER_DAY);

    let hours = rem / NANOS_PER_HOUR;
    let minutes = (rem % NANOS_PER_HOUR) / NANOS_PER_MINUTE;
    let seconds = (rem % NANOS_PER_MINUTE) / NANOS_PER_SEC;
    let nanos = rem % NANOS_PER_SEC;

    let sign = if days < 0 { "+" } else { "" };
    let fraction = if nanos == 0 {
        String::new()
    } else if nanos % 1_000 == 0 {
        format!(".{:06}", nanos / 1_000)
    } else {
        format!(".{nanos:09}")
    };

    format!("{days} days {sign}{hours:02}:{minutes:02}:{seconds:02}{fraction}")
}

/// Inverse of [`format_duration`]
pub fn parse_duration(literal: &str) -> Result<TimeDelta> {
    let invalid = || error::InvalidDurationSnafu { literal }.build();

    let (days, clock) = literal.trim().split_once(" days ").ok_or_else(invalid)?;
    let days: i128 = days.parse().map_err(|_| invalid())?;
    let clock = clock.strip_prefix('+').unwrap_or(clock);

    let mut parts = clock.splitn(3, ':');
    let (Some(hours), Some(minutes), Some(seconds)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let (seconds, fraction) = match seconds.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (seconds, None),
    };

    let parse_field = |field: &str, max: i128| -> Result<i128> {
        ensure!(
            field.len() == 2 && field.bytes().all(|b| b.is_ascii_digit()),
            error::InvalidDurationSnafu { literal }
        );
        let value: i128 = field.parse().map_err(|_| invalid())?;
        ensure!(value < max, error::InvalidDurationSnafu { literal });
        Ok(value)
    };
    let hours = parse_field(hours, 24)?;
    let minutes = parse_field(minutes, 60)?;
    let seconds = parse_field(seconds, 60)?;

    let nanos = match fraction {
        None => 0,
        Some(f) => {
            ensure!(
                (1..=9).contains(&f.len()) && f.bytes().all(|b| b.is_ascii_digit()),
                error::InvalidDurationSnafu { literal }
            );
            let padded = format!("{f:0<9}");
            padded.parse::<i128>().map_err(|_| invalid())?
        }
    };

    let total = days * NANOS_PER_DAY
        + hours * NANOS_PER_HOUR
        + minutes * NANOS_PER_MINUTE
        + seconds * NANOS_PER_SEC
        + nanos;

    let secs = i64::try_from(total.div_euclid(NANOS_PER_SEC)).map_err(|_| invalid())?;
    let subsec = u32::try_from(total.rem_euclid(NANOS_PER_SEC)).map_err(|_| invalid())?;
    TimeDelta::new(secs, subsec).context(error::InvalidDurationSnafu { literal })
}
