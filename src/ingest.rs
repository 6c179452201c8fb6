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

//! Per-file ingestion: read, serialize, load

use std::path::{Path, PathBuf};
use std::sync::Arc;

use snafu::{ensure, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bulk::{BatchLoader, LoadOptions, LoadResult};
use crate::error::{CancelledSnafu, EmptyTableSnafu, IngestSnafu};
use crate::reader::WorkbookReader;
use crate::serializer::prepare_records;
use crate::sink::Connector;
use crate::table::Table;
use crate::Result;

/// Result of ingesting one file
#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub filename: String,
    pub result: Result<LoadResult>,
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs whole files through the serializer and the batch loader
#[derive(Clone)]
pub struct Ingestor {
    loader: BatchLoader,
    connector: Arc<dyn Connector>,
}

impl Ingestor {
    pub fn new(connector: Arc<dyn Connector>, options: LoadOptions) -> Result<Self> {
        Ok(Self {
            loader: BatchLoader::new(options)?,
            connector,
        })
    }

    pub fn options(&self) -> &LoadOptions {
        self.loader.options()
    }

    /// Ingest one workbook.
    ///
    /// Rows are tagged with `original_filename` when given, otherwise with the
    /// file name of `path`. Any failure comes back as [`crate::Error::Ingest`].
    pub async fn ingest_file(
        &self,
        path: &Path,
        original_filename: Option<&str>,
        sheet: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LoadResult> {
        let filename = original_filename
            .map(str::to_string)
            .unwrap_or_else(|| display_name(path));

        let result = match WorkbookReader::read(path, sheet) {
            Ok(table) => {
                info!(filename = %filename, rows = table.len(), "Read {} rows", table.len());
                self.run(table, &filename, cancel).await
            }
            Err(e) => Err(e),
        };
        self.finish(&filename, result)
    }

    /// Ingest an already materialized table under `filename`
    pub async fn ingest_table(
        &self,
        table: Table,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<LoadResult> {
        let result = self.run(table, filename, cancel).await;
        self.finish(filename, result)
    }

    /// Ingest `paths` one after another.
    ///
    /// A failed file never stops the ones after it. Files not yet started when
    /// `cancel` fires are reported as cancelled without being read.
    pub async fn ingest_files(
        &self,
        paths: &[PathBuf],
        sheet: Option<&str>,
        cancel: &CancellationToken,
    ) -> Vec<FileOutcome> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            let filename = display_name(path);
            let result = if cancel.is_cancelled() {
                warn!(filename = %filename, "Skipping file, ingestion was cancelled");
                CancelledSnafu {
                    batches_committed: 0usize,
                    rows_committed: 0usize,
                }
                .fail()
                .context(IngestSnafu {
                    filename: filename.clone(),
                })
            } else {
                self.ingest_file(path, None, sheet, cancel).await
            };
            outcomes.push(FileOutcome {
                path: path.clone(),
                filename,
                result,
            });
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(
            files = outcomes.len(),
            failed, "Processed {} files, {} failed",
            outcomes.len(),
            failed
        );
        outcomes
    }

    async fn run(
        &self,
        table: Table,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<LoadResult> {
        ensure!(!table.is_empty(), EmptyTableSnafu);
        let records = prepare_records(table, filename)?;
        self.loader
            .load(self.connector.as_ref(), &records, cancel)
            .await
    }

    fn finish(&self, filename: &str, result: Result<LoadResult>) -> Result<LoadResult> {
        match &result {
            Ok(loaded) => info!(
                filename = %filename,
                rows = loaded.rows_committed,
                batches = loaded.batches_committed,
                "Ingested {} rows from {}",
                loaded.rows_committed,
                filename
            ),
            Err(e) => error!(
                filename = %filename,
                kind = ?e.kind(),
                rows_committed = e.rows_committed().unwrap_or(0),
                "Failed to ingest {}: {}",
                filename,
                e
            ),
        }
        result.context(IngestSnafu { filename })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
