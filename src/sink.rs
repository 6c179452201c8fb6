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

//! Write contract between the batch loader and the bronze table
//!
//! A [`Connector`] hands out one [`BronzeSink`] per ingestion run. The sink
//! opens a [`SinkTransaction`] per batch; dropping a transaction without
//! calling [`SinkTransaction::commit`] rolls it back.

pub mod memory;

use async_trait::async_trait;

use crate::serializer::SerializedRecord;
use crate::Result;

/// Acquires a sink connection for one ingestion run
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BronzeSink>>;
}

/// A connection to the warehouse, held for every batch of one run
#[async_trait]
pub trait BronzeSink: Send {
    /// Open the transaction for the next batch
    async fn begin_batch<'a>(&'a mut self) -> Result<Box<dyn SinkTransaction + 'a>>;

    /// Release the connection
    async fn close(self: Box<Self>) -> Result<()>;
}

/// One open batch transaction
#[async_trait]
pub trait SinkTransaction: Send {
    /// Insert `(id, filename, uploaded_at, raw_data)` rows into `table`.
    ///
    /// `uploaded_at` is assigned by the sink's own clock, never by the caller.
    async fn insert_rows(&mut self, table: &str, rows: &[SerializedRecord]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
