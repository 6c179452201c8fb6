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

use std::io;
use std::path::PathBuf;

use snafu::{Location, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("File does not exist: {}", path.display()))]
    FileNotFound {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Unsupported file extension: {:?}. Supported: {}",
        extension,
        supported
    ))]
    UnsupportedExtension {
        extension: String,
        supported: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to read workbook {}", path.display()))]
    ReadWorkbook {
        path: PathBuf,
        source: calamine::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Workbook {} has no sheet {}", path.display(), sheet))]
    MissingSheet {
        path: PathBuf,
        sheet: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Table is empty"))]
    EmptyTable {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid column count: expected {}, got {}", expected, actual))]
    InvalidColumnCount {
        expected: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid table shape"))]
    BuildTable {
        source: crate::table::TableBuilderError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Duplicate column name: {}", column))]
    DuplicateColumn {
        column: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Cannot convert value of type {} in column {} to JSON",
        type_name,
        column
    ))]
    UnsupportedValue {
        column: String,
        type_name: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid duration literal: {}", literal))]
    InvalidDuration {
        literal: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to serde Json"))]
    SerdeJson {
        #[snafu(source)]
        error: serde_json::error::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Batch size must be positive"))]
    InvalidBatchSize {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid table name: {:?}", table))]
    InvalidTableName {
        table: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Warehouse {} failed", operation))]
    Warehouse {
        operation: String,
        source: sqlx::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Sink unavailable: {}", msg))]
    SinkUnavailable {
        msg: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Batch {}/{} failed after {} batches ({} rows) were committed",
        batch_index,
        total_batches,
        batches_committed,
        rows_committed
    ))]
    BatchFailed {
        batch_index: usize,
        total_batches: usize,
        batches_committed: usize,
        rows_committed: usize,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Load cancelled after {} batches ({} rows) were committed",
        batches_committed,
        rows_committed
    ))]
    Cancelled {
        batches_committed: usize,
        rows_committed: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to read config file {}", path.display()))]
    ReadConfig {
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to parse config file {}", path.display()))]
    ParseConfig {
        path: PathBuf,
        source: serde_yaml::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid config, {}", msg))]
    InvalidConfig {
        msg: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to ingest {}: {}", filename, source))]
    Ingest {
        filename: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by callers to decide what to do
/// with a failed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input file or table was rejected before serialization began.
    Validation,
    /// A cell could not be turned into JSON.
    Serialization,
    /// A batch transaction failed or the load was cancelled.
    Load,
    /// Configuration could not be loaded.
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound { .. }
            | Self::UnsupportedExtension { .. }
            | Self::ReadWorkbook { .. }
            | Self::MissingSheet { .. }
            | Self::EmptyTable { .. }
            | Self::InvalidColumnCount { .. }
            | Self::BuildTable { .. }
            | Self::DuplicateColumn { .. } => ErrorKind::Validation,
            Self::UnsupportedValue { .. }
            | Self::InvalidDuration { .. }
            | Self::SerdeJson { .. } => ErrorKind::Serialization,
            Self::InvalidBatchSize { .. }
            | Self::InvalidTableName { .. }
            | Self::ReadConfig { .. }
            | Self::ParseConfig { .. }
            | Self::InvalidConfig { .. } => ErrorKind::Config,
            Self::Warehouse { .. }
            | Self::SinkUnavailable { .. }
            | Self::BatchFailed { .. }
            | Self::Cancelled { .. } => ErrorKind::Load,
            Self::Ingest { source, .. } => source.kind(),
        }
    }

    /// Indicate if the error is retriable
    ///
    /// Only connectivity failures against the sink qualify. Retrying is left to
    /// the caller; note that retrying a whole file after a partial load
    /// duplicates the batches that were already committed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::SinkUnavailable { .. } => true,
            Self::Warehouse { source, .. } => matches!(
                source,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Self::BatchFailed { source, .. } | Self::Ingest { source, .. } => {
                source.is_retriable()
            }
            _ => false,
        }
    }

    /// The 1-based index of the batch that failed, if this error came from a
    /// batch transaction.
    pub fn failed_batch(&self) -> Option<usize> {
        match self {
            Self::BatchFailed { batch_index, .. } => Some(*batch_index),
            Self::Ingest { source, .. } => source.failed_batch(),
            _ => None,
        }
    }

    /// Rows committed before the run stopped, when the run got as far as loading.
    pub fn rows_committed(&self) -> Option<usize> {
        match self {
            Self::BatchFailed { rows_committed, .. } | Self::Cancelled { rows_committed, .. } => {
                Some(*rows_committed)
            }
            Self::Ingest { source, .. } => source.rows_committed(),
            _ => None,
        }
    }
}
