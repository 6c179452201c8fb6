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

// End-to-end ingestion tests.
// The PostgreSQL tests only run when BRONZE_TEST_DATABASE_URL points at a database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bronze_ingester::reader::WorkbookReader;
use bronze_ingester::serializer::RowDocument;
use bronze_ingester::sink::memory::{FailAt, MemoryWarehouse};
use bronze_ingester::{
    CellValue, Database, Error, ErrorKind, Ingestor, LoadOptions, Result, Row, Table,
};
use serde_json::json;
use sqlx::{Connection, PgConnection};
use tokio_util::sync::CancellationToken;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn memory_ingestor(warehouse: &MemoryWarehouse, options: LoadOptions) -> Ingestor {
    Ingestor::new(Arc::new(warehouse.clone()), options).expect("Failed to create ingestor")
}

fn parse(raw_data: &str) -> RowDocument {
    serde_json::from_str(raw_data).expect("Failed to parse raw_data")
}

#[test]
fn test_read_fixture_workbook() -> Result<()> {
    let table = WorkbookReader::read(&fixture("sales.xlsx"), None)?;
    assert_eq!(table.columns(), ["name", "amount", "sold_at"]);
    assert_eq!(table.len(), 3);

    let second = table.row(1).expect("row 1");
    assert_eq!(second.get("amount"), Some(&CellValue::Null));
    let third = table.row(2).expect("row 2");
    assert_eq!(third.get("amount"), Some(&CellValue::Float(3.0)));

    let notes = WorkbookReader::read(&fixture("sales.xlsx"), Some("Notes"))?;
    assert_eq!(notes.columns(), ["note"]);
    assert_eq!(notes.len(), 1);

    let err = WorkbookReader::read(&fixture("sales.xlsx"), Some("Missing"))
        .expect_err("Unknown sheet should fail");
    assert!(matches!(err, Error::MissingSheet { .. }));
    Ok(())
}

#[tokio::test]
async fn test_ingest_fixture_into_memory() -> Result<()> {
    let warehouse = MemoryWarehouse::new();
    let ingestor = memory_ingestor(&warehouse, LoadOptions::default().with_batch_size(2));

    let loaded = ingestor
        .ingest_file(
            &fixture("sales.xlsx"),
            Some("Q1 sales.xlsx"),
            None,
            &CancellationToken::new(),
        )
        .await?;
    assert_eq!(loaded.rows_committed, 3);
    assert_eq!(loaded.batches_committed, 2);
    assert_eq!(warehouse.batch_sizes(), vec![2, 1]);

    let rows = warehouse.rows("bronze_table");
    let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["0", "1", "2"]);
    assert!(rows.iter().all(|r| r.filename == "Q1 sales.xlsx"));

    let first = parse(&rows[0].raw_data);
    assert_eq!(
        first.metadata.column_names,
        ["name", "amount", "sold_at", "id"]
    );
    assert_eq!(first.metadata.dtypes["amount"], "float");
    assert_eq!(first.metadata.dtypes["sold_at"], "Timestamp");
    assert_eq!(first.data["sold_at"], json!("2024-03-15T10:30:00"));
    assert_eq!(first.data["id"], json!("0"));

    let second = parse(&rows[1].raw_data);
    assert_eq!(second.data["amount"], json!(null));
    assert_eq!(second.metadata.dtypes["amount"], "float");
    assert_eq!(second.data["sold_at"], json!("2024-03-16T00:00:00"));
    Ok(())
}

#[tokio::test]
async fn test_partial_load_is_kept() {
    let warehouse = MemoryWarehouse::new();
    warehouse.fail_batch(2, FailAt::Insert);
    let ingestor = memory_ingestor(&warehouse, LoadOptions::default().with_batch_size(2));

    let err = ingestor
        .ingest_file(&fixture("sales.xlsx"), None, None, &CancellationToken::new())
        .await
        .expect_err("Second batch should fail");

    assert_eq!(err.kind(), ErrorKind::Load);
    assert_eq!(err.failed_batch(), Some(2));
    assert!(err.to_string().contains("sales.xlsx"));
    assert_eq!(warehouse.row_count("bronze_table"), 2);
    assert_eq!(warehouse.connections_closed(), 1);
}

#[tokio::test]
async fn test_reingesting_duplicates_rows() -> Result<()> {
    let warehouse = MemoryWarehouse::new();
    let ingestor = memory_ingestor(&warehouse, LoadOptions::default());
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        ingestor
            .ingest_file(&fixture("sales.xlsx"), None, None, &cancel)
            .await?;
    }
    assert_eq!(warehouse.row_count("bronze_table"), 6);
    assert_eq!(warehouse.connections_opened(), 2);
    Ok(())
}

#[tokio::test]
async fn test_ingest_files_reports_each_file() {
    let warehouse = MemoryWarehouse::new();
    let ingestor = memory_ingestor(&warehouse, LoadOptions::default());

    let outcomes = ingestor
        .ingest_files(
            &[fixture("sales.xlsx"), fixture("missing.xlsx"), fixture("sales.xlsx")],
            None,
            &CancellationToken::new(),
        )
        .await;

    let succeeded: Vec<_> = outcomes.iter().map(|o| o.is_success()).collect();
    assert_eq!(succeeded, [true, false, true]);
    assert_eq!(warehouse.row_count("bronze_table"), 6);
}

fn database_url() -> Option<String> {
    std::env::var("BRONZE_TEST_DATABASE_URL").ok()
}

fn unique_table_name(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{prefix}_{timestamp}")
}

async fn create_bronze_table(url: &str, table: &str) -> PgConnection {
    let mut conn = PgConnection::connect(url)
        .await
        .expect("Failed to connect to test database");
    sqlx::query(&format!(
        "CREATE TABLE {table} (id TEXT, filename TEXT, uploaded_at TIMESTAMPTZ, raw_data TEXT)"
    ))
    .execute(&mut conn)
    .await
    .expect("Failed to create table");
    conn
}

async fn drop_table(conn: &mut PgConnection, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(&mut *conn)
        .await
        .expect("Failed to drop table");
}

#[tokio::test]
async fn test_postgres_load_in_batches() -> Result<()> {
    let Some(url) = database_url() else {
        return Ok(());
    };
    let table_name = unique_table_name("bronze_batches");
    let mut conn = create_bronze_table(&url, &table_name).await;

    let mut table = Table::new(["name", "amount"])?;
    for i in 0..25 {
        table.push_row(Row::new().add_value(format!("item-{i}")).add_value(i))?;
    }

    let ingestor = Ingestor::new(
        Arc::new(Database::new_with_url(&url)),
        LoadOptions::default()
            .with_batch_size(10)
            .with_table(&table_name),
    )?;
    let loaded = ingestor
        .ingest_table(table, "items.xlsx", &CancellationToken::new())
        .await?;
    assert_eq!(loaded.rows_committed, 25);
    assert_eq!(loaded.batches_committed, 3);

    let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
        "SELECT id, filename, raw_data FROM {table_name} ORDER BY id::int"
    ))
    .fetch_all(&mut conn)
    .await
    .expect("Failed to query rows");
    assert_eq!(rows.len(), 25);
    assert_eq!(rows[24].0, "24");
    assert_eq!(rows[24].1, "items.xlsx");
    assert_eq!(parse(&rows[24].2).data["amount"], json!(24));

    let missing_timestamps: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {table_name} WHERE uploaded_at IS NULL"
    ))
    .fetch_one(&mut conn)
    .await
    .expect("Failed to count rows");
    assert_eq!(missing_timestamps, 0);

    drop_table(&mut conn, &table_name).await;
    Ok(())
}

#[tokio::test]
async fn test_postgres_missing_table_fails_first_batch() {
    let Some(url) = database_url() else {
        return;
    };
    let ingestor = Ingestor::new(
        Arc::new(Database::new_with_url(&url)),
        LoadOptions::default().with_table(unique_table_name("absent")),
    )
    .expect("Failed to create ingestor");

    let err = ingestor
        .ingest_file(&fixture("sales.xlsx"), None, None, &CancellationToken::new())
        .await
        .expect_err("Insert into a missing table should fail");
    assert_eq!(err.failed_batch(), Some(1));
    assert_eq!(err.rows_committed(), Some(0));
    assert!(!err.is_retriable());
}
