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

//! In-process warehouse with the same transactional contract as the real one.
//! Used for dry runs and tests; supports injecting a failure into a chosen batch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error;
use crate::serializer::SerializedRecord;
use crate::sink::{BronzeSink, Connector, SinkTransaction};
use crate::Result;

/// A committed bronze row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub raw_data: String,
}

/// Where an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Begin,
    Insert,
    Commit,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Vec<StoredRow>>,
    last_uploaded_at: Option<DateTime<Utc>>,
    connections_opened: usize,
    connections_closed: usize,
    batches_begun: usize,
    batches_committed: usize,
    batches_rolled_back: usize,
    batch_sizes: Vec<usize>,
    fail_connect: bool,
    // 1-based batch number counted across the warehouse's lifetime
    fail_batch: Option<(usize, FailAt)>,
}

impl State {
    fn should_fail(&self, batch: usize, at: FailAt) -> bool {
        self.fail_batch == Some((batch, at))
    }

    // Commit timestamps never go backwards, even if the wall clock does.
    fn next_uploaded_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_uploaded_at {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_uploaded_at = Some(ts);
        ts
    }
}

/// Shared in-memory store; cloning yields another handle to the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `batch`-th transaction (1-based) fail at `at`
    pub fn fail_batch(&self, batch: usize, at: FailAt) {
        self.state.lock().fail_batch = Some((batch, at));
    }

    /// Make every subsequent connect attempt fail
    pub fn fail_connect(&self) {
        self.state.lock().fail_connect = true;
    }

    /// Committed rows of `table`, in commit order
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, Vec::len)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.state.lock().connections_closed
    }

    pub fn batches_begun(&self) -> usize {
        self.state.lock().batches_begun
    }

    pub fn batches_committed(&self) -> usize {
        self.state.lock().batches_committed
    }

    pub fn batches_rolled_back(&self) -> usize {
        self.state.lock().batches_rolled_back
    }

    /// Row counts of committed batches, in commit order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }
}

#[async_trait]
impl Connector for MemoryWarehouse {
    async fn connect(&self) -> Result<Box<dyn BronzeSink>> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return error::SinkUnavailableSnafu {
                msg: "connection refused",
            }
            .fail();
        }
        state.connections_opened += 1;
        Ok(Box::new(MemorySink {
            state: self.state.clone(),
        }))
    }
}

pub struct MemorySink {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BronzeSink for MemorySink {
    async fn begin_batch<'a>(&'a mut self) -> Result<Box<dyn SinkTransaction + 'a>> {
        let mut state = self.state.lock();
        state.batches_begun += 1;
        let batch = state.batches_begun;
        if state.should_fail(batch, FailAt::Begin) {
            return error::SinkUnavailableSnafu {
                msg: format!("failed to begin batch {batch}"),
            }
            .fail();
        }
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            batch,
            pending: Vec::new(),
            committed: false,
        }))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.state.lock().connections_closed += 1;
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    batch: usize,
    pending: Vec<(String, SerializedRecord)>,
    committed: bool,
}

#[async_trait]
impl SinkTransaction for MemoryTransaction {
    async fn insert_rows(&mut self, table: &str, rows: &[SerializedRecord]) -> Result<()> {
        if self.state.lock().should_fail(self.batch, FailAt::Insert) {
            return error::SinkUnavailableSnafu {
                msg: format!("connection lost while inserting batch {}", self.batch),
            }
            .fail();
        }
        self.pending
            .extend(rows.iter().map(|r| (table.to_string(), r.clone())));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let mut state = this.state.lock();
        if state.should_fail(this.batch, FailAt::Commit) {
            return error::SinkUnavailableSnafu {
                msg: format!("failed to commit batch {}", this.batch),
            }
            .fail();
        }

        let uploaded_at = state.next_uploaded_at();
        let pending = std::mem::take(&mut this.pending);
        state.batch_sizes.push(pending.len());
        for (table, record) in pending {
            state.tables.entry(table).or_default().push(StoredRow {
                id: record.row_id,
                filename: record.filename,
                uploaded_at,
                raw_data: record.document,
            });
        }
        state.batches_committed += 1;
        drop(state);

        this.committed = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.committed {
            self.state.lock().batches_rolled_back += 1;
        }
    }
}
