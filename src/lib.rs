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

//! Spreadsheet ingestion into an append-only bronze table.
//!
//! Each row of a sheet is serialized into a self-describing JSON document and
//! loaded as `(id, filename, uploaded_at, raw_data)` in fixed-size batches,
//! one transaction per batch.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use bronze_ingester::{Database, Ingestor, LoadOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> bronze_ingester::Result<()> {
//! let connector = Arc::new(Database::new_with_url("postgres://localhost/warehouse"));
//! let ingestor = Ingestor::new(connector, LoadOptions::default().with_table("bronze.raw_rows"))?;
//! let loaded = ingestor
//!     .ingest_file(Path::new("sales.xlsx"), None, None, &CancellationToken::new())
//!     .await?;
//! println!("{} rows in {} batches", loaded.rows_committed, loaded.batches_committed);
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod config;
pub mod database;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod reader;
pub mod serializer;
pub mod sink;
pub mod table;

pub use bulk::{BatchLoader, LoadOptions, LoadResult};
pub use config::IngestConfig;
pub use database::Database;
pub use error::{Error, ErrorKind, Result};
pub use ingest::{FileOutcome, Ingestor};
pub use serializer::{RowSerializer, SerializedRecord};
pub use table::{CellValue, Row, Table};
