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

//! Batched loading of serialized rows into the bronze table
//!
//! Records are split into consecutive batches of at most `batch_size` rows and
//! written strictly in order, one transaction per batch. The first failing batch
//! stops the run; batches committed before it stay committed.

use std::ops::Range;

use snafu::{ensure, IntoError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{self, BatchFailedSnafu};
use crate::serializer::SerializedRecord;
use crate::sink::{BronzeSink, Connector};
use crate::Result;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_BRONZE_TABLE: &str = "bronze_table";

/// Configuration options for a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub table: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            table: DEFAULT_BRONZE_TABLE.to_string(),
        }
    }
}

impl LoadOptions {
    /// Set the maximum number of rows per transaction
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the destination table
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, error::InvalidBatchSizeSnafu);
        validate_table_name(&self.table)
    }
}

/// Accept `table` or `schema.table` where every part is a plain SQL identifier.
///
/// The table name is spliced into the insert statement, so nothing else passes.
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    ensure!(valid, error::InvalidTableNameSnafu { table });
    Ok(())
}

/// Outcome of a load that ran to completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub batches_committed: usize,
    pub rows_committed: usize,
}

pub fn total_batches(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size)
}

/// Consecutive index ranges covering `0..len`, each at most `batch_size` long.
///
/// `batch_size` must be positive.
pub fn batch_ranges(len: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    (0..len)
        .step_by(batch_size)
        .map(move |start| start..(start + batch_size).min(len))
}

/// Drives serialized records through a sink, one transaction per batch
#[derive(Debug, Clone)]
pub struct BatchLoader {
    options: LoadOptions,
}

impl BatchLoader {
    pub fn new(options: LoadOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Acquire a sink from `connector`, load every record and release the sink.
    ///
    /// The sink is closed on every exit path. Nothing is connected when there
    /// are no records.
    pub async fn load(
        &self,
        connector: &dyn Connector,
        records: &[SerializedRecord],
        cancel: &CancellationToken,
    ) -> Result<LoadResult> {
        if records.is_empty() {
            return Ok(LoadResult::default());
        }

        let mut sink = connector.connect().await?;
        let result = self.load_into(&mut *sink, records, cancel).await;
        if let Err(e) = sink.close().await {
            warn!(error = %e, "Failed to close warehouse connection");
        }
        result
    }

    /// Load every record through an already open sink.
    ///
    /// Cancellation is only observed between batches.
    pub async fn load_into(
        &self,
        sink: &mut dyn BronzeSink,
        records: &[SerializedRecord],
        cancel: &CancellationToken,
    ) -> Result<LoadResult> {
        let total = total_batches(records.len(), self.options.batch_size);
        let mut progress = LoadResult::default();

        for (i, range) in batch_ranges(records.len(), self.options.batch_size).enumerate() {
            let batch_index = i + 1;
            ensure!(
                !cancel.is_cancelled(),
                error::CancelledSnafu {
                    batches_committed: progress.batches_committed,
                    rows_committed: progress.rows_committed,
                }
            );

            let batch = &records[range];
            if let Err(e) = self.write_batch(sink, batch).await {
                return Err(BatchFailedSnafu {
                    batch_index,
                    total_batches: total,
                    batches_committed: progress.batches_committed,
                    rows_committed: progress.rows_committed,
                }
                .into_error(e));
            }

            progress.batches_committed += 1;
            progress.rows_committed += batch.len();
            info!(
                batch = batch_index,
                total_batches = total,
                rows = batch.len(),
                "Inserted batch {}/{} with {} rows",
                batch_index,
                total,
                batch.len()
            );
        }

        debug!(
            table = %self.options.table,
            rows = progress.rows_committed,
            "Load finished"
        );
        Ok(progress)
    }

    async fn write_batch(&self, sink: &mut dyn BronzeSink, batch: &[SerializedRecord]) -> Result<()> {
        let mut tx = sink.begin_batch().await?;
        tx.insert_rows(&self.options.table, batch).await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rand::Rng;

    use super::*;
    use crate::error::ErrorKind;
    use crate::sink::memory::{FailAt, MemoryWarehouse};
    use crate::sink::SinkTransaction;
    use crate::Error;

    const TABLE: &str = "bronze.raw_rows";

    fn records(n: usize) -> Vec<SerializedRecord> {
        (0..n)
            .map(|i| SerializedRecord {
                row_id: i.to_string(),
                filename: "sales.xlsx".to_string(),
                document: format!(r#"{{"data":{{"id":"{i}"}}}}"#),
            })
            .collect()
    }

    fn loader(batch_size: usize) -> BatchLoader {
        BatchLoader::new(
            LoadOptions::default()
                .with_batch_size(batch_size)
                .with_table(TABLE),
        )
        .expect("Failed to create loader")
    }

    #[test]
    fn test_load_options_validation() {
        assert!(LoadOptions::default().validate().is_ok());
        assert!(matches!(
            LoadOptions::default().with_batch_size(0).validate(),
            Err(Error::InvalidBatchSize { .. })
        ));

        for table in ["bronze_table", "bronze.raw_rows", "_t1"] {
            assert!(validate_table_name(table).is_ok(), "{table}");
        }
        for table in ["", "1table", "bronze.", "a b", "t; DROP TABLE x", "\"quoted\""] {
            assert!(validate_table_name(table).is_err(), "{table}");
        }
    }

    #[test]
    fn test_batch_ranges() {
        let ranges: Vec<_> = batch_ranges(25_000, 10_000).collect();
        assert_eq!(ranges, vec![0..10_000, 10_000..20_000, 20_000..25_000]);
        assert_eq!(total_batches(25_000, 10_000), 3);

        assert_eq!(batch_ranges(0, 10).count(), 0);
        assert_eq!(total_batches(0, 10), 0);
        assert_eq!(batch_ranges(10, 10).collect::<Vec<_>>(), vec![0..10]);
    }

    #[test]
    fn test_batch_ranges_partition_randomized() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let len = rng.random_range(0..5_000);
            let batch_size = rng.random_range(1..700);
            let ranges: Vec<_> = batch_ranges(len, batch_size).collect();

            assert_eq!(ranges.len(), total_batches(len, batch_size));
            let mut next = 0;
            for range in &ranges {
                assert_eq!(range.start, next);
                assert!(!range.is_empty());
                assert!(range.len() <= batch_size);
                next = range.end;
            }
            assert_eq!(next, len);
        }
    }

    #[tokio::test]
    async fn test_load_in_batches() {
        let warehouse = MemoryWarehouse::new();
        let records = records(25_000);

        let result = loader(10_000)
            .load(&warehouse, &records, &CancellationToken::new())
            .await
            .expect("Failed to load");

        assert_eq!(
            result,
            LoadResult {
                batches_committed: 3,
                rows_committed: 25_000,
            }
        );
        assert_eq!(warehouse.batch_sizes(), vec![10_000, 10_000, 5_000]);
        let stored = warehouse.rows(TABLE);
        assert_eq!(stored.len(), 25_000);
        assert!(stored
            .iter()
            .enumerate()
            .all(|(i, row)| row.id == i.to_string() && row.filename == "sales.xlsx"));
        assert_eq!(warehouse.connections_opened(), 1);
        assert_eq!(warehouse.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_stops_the_run() {
        let warehouse = MemoryWarehouse::new();
        warehouse.fail_batch(2, FailAt::Insert);
        let records = records(25_000);

        let err = loader(10_000)
            .load(&warehouse, &records, &CancellationToken::new())
            .await
            .expect_err("Load should fail on batch 2");

        assert_eq!(err.kind(), ErrorKind::Load);
        assert_eq!(err.failed_batch(), Some(2));
        assert_eq!(err.rows_committed(), Some(10_000));
        assert!(err.to_string().contains("Batch 2/3"));

        assert_eq!(warehouse.row_count(TABLE), 10_000);
        assert_eq!(warehouse.batches_begun(), 2);
        assert_eq!(warehouse.batches_committed(), 1);
        assert_eq!(warehouse.batches_rolled_back(), 1);
        assert_eq!(warehouse.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_failure_at_any_stage_is_contained() {
        for at in [FailAt::Begin, FailAt::Insert, FailAt::Commit] {
            let warehouse = MemoryWarehouse::new();
            warehouse.fail_batch(3, at);

            let err = loader(4)
                .load(&warehouse, &records(20), &CancellationToken::new())
                .await
                .expect_err("Load should fail on batch 3");

            assert_eq!(err.failed_batch(), Some(3), "{at:?}");
            assert_eq!(warehouse.row_count(TABLE), 8, "{at:?}");
            assert_eq!(warehouse.batches_begun(), 3, "{at:?}");
            assert_eq!(warehouse.connections_closed(), 1, "{at:?}");
        }
    }

    #[tokio::test]
    async fn test_randomized_loads_keep_order_and_bound() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let len = rng.random_range(1..2_000);
            let batch_size = rng.random_range(1..300);
            let warehouse = MemoryWarehouse::new();

            let result = loader(batch_size)
                .load(&warehouse, &records(len), &CancellationToken::new())
                .await
                .expect("Failed to load");

            assert_eq!(result.rows_committed, len);
            assert_eq!(result.batches_committed, total_batches(len, batch_size));
            assert!(warehouse.batch_sizes().iter().all(|&n| n <= batch_size));
            let ids: Vec<_> = warehouse.rows(TABLE).into_iter().map(|r| r.id).collect();
            let expected: Vec<_> = (0..len).map(|i| i.to_string()).collect();
            assert_eq!(ids, expected);
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let warehouse = MemoryWarehouse::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = loader(10)
            .load(&warehouse, &records(30), &cancel)
            .await
            .expect_err("Load should be cancelled");

        assert!(matches!(
            err,
            Error::Cancelled {
                batches_committed: 0,
                rows_committed: 0,
                ..
            }
        ));
        assert_eq!(warehouse.batches_begun(), 0);
        assert_eq!(warehouse.connections_closed(), 1);
    }

    /// Cancels `cancel` once `after` batches have committed
    struct CancelOnCommit {
        inner: Box<dyn BronzeSink>,
        cancel: CancellationToken,
        after: usize,
        committed: usize,
    }

    struct CancellingTransaction<'a> {
        inner: Box<dyn SinkTransaction + 'a>,
        committed: &'a mut usize,
        after: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl BronzeSink for CancelOnCommit {
        async fn begin_batch<'a>(&'a mut self) -> Result<Box<dyn SinkTransaction + 'a>> {
            let inner = self.inner.begin_batch().await?;
            Ok(Box::new(CancellingTransaction {
                inner,
                committed: &mut self.committed,
                after: self.after,
                cancel: self.cancel.clone(),
            }))
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.inner.close().await
        }
    }

    #[async_trait]
    impl SinkTransaction for CancellingTransaction<'_> {
        async fn insert_rows(&mut self, table: &str, rows: &[SerializedRecord]) -> Result<()> {
            self.inner.insert_rows(table, rows).await
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            let CancellingTransaction {
                inner,
                committed,
                after,
                cancel,
            } = *self;
            inner.commit().await?;
            *committed += 1;
            if *committed == after {
                cancel.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_after_committed_batches() {
        let warehouse = MemoryWarehouse::new();
        let cancel = CancellationToken::new();
        let mut sink = CancelOnCommit {
            inner: warehouse.connect().await.expect("Failed to connect"),
            cancel: cancel.clone(),
            after: 2,
            committed: 0,
        };

        let err = loader(10)
            .load_into(&mut sink, &records(50), &cancel)
            .await
            .expect_err("Load should be cancelled");

        assert!(matches!(
            err,
            Error::Cancelled {
                batches_committed: 2,
                rows_committed: 20,
                ..
            }
        ));
        assert_eq!(warehouse.batches_begun(), 2);
        assert_eq!(warehouse.row_count(TABLE), 20);
        Box::new(sink).close().await.expect("Failed to close sink");
        assert_eq!(warehouse.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_empty_load_does_not_connect() {
        let warehouse = MemoryWarehouse::new();
        warehouse.fail_connect();

        let result = loader(10)
            .load(&warehouse, &[], &CancellationToken::new())
            .await
            .expect("Failed to load");

        assert_eq!(result, LoadResult::default());
        assert_eq!(warehouse.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_a_batch_failure() {
        let warehouse = MemoryWarehouse::new();
        warehouse.fail_connect();

        let err = loader(10)
            .load(&warehouse, &records(5), &CancellationToken::new())
            .await
            .expect_err("Connect should fail");

        assert_eq!(err.kind(), ErrorKind::Load);
        assert_eq!(err.failed_batch(), None);
        assert!(err.is_retriable());
    }
}
