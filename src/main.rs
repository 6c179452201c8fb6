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

//! bronze-ingest: load spreadsheet files into the bronze table.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bronze_ingester::logging::init_tracing;
use bronze_ingester::sink::memory::MemoryWarehouse;
use bronze_ingester::sink::Connector;
use bronze_ingester::{Database, FileOutcome, IngestConfig, Ingestor};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Spreadsheet to bronze table ingestion.
#[derive(Parser, Debug)]
#[command(name = "bronze-ingest")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workbooks to ingest (.xlsx or .xls).
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Logical filename recorded on every row; only with a single file.
    #[arg(long)]
    filename: Option<String>,

    /// Sheet to read; defaults to the first sheet.
    #[arg(long)]
    sheet: Option<String>,

    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load into an in-memory table instead of the warehouse.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match IngestConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.application.log_level);

    if args.filename.is_some() && args.files.len() > 1 {
        error!("--filename can only be used with a single file");
        return ExitCode::FAILURE;
    }

    let connector: Arc<dyn Connector> = if args.dry_run {
        info!("Dry run, rows are loaded into memory only");
        Arc::new(MemoryWarehouse::new())
    } else {
        match config.warehouse.url.as_deref() {
            Some(url) => Arc::new(Database::new_with_url(url)),
            None => {
                error!("No warehouse configured; set DATABASE_URL or warehouse.url");
                return ExitCode::FAILURE;
            }
        }
    };

    let ingestor = match Ingestor::new(connector, config.load_options()) {
        Ok(ingestor) => ingestor,
        Err(e) => {
            error!(error = %e, "Invalid load options");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current batch");
                cancel.cancel();
            }
        }
    });

    let outcomes = match args.filename.as_deref() {
        Some(filename) => {
            let path = &args.files[0];
            let result = ingestor
                .ingest_file(path, Some(filename), args.sheet.as_deref(), &cancel)
                .await;
            vec![FileOutcome {
                path: path.clone(),
                filename: filename.to_string(),
                result,
            }]
        }
        None => {
            ingestor
                .ingest_files(&args.files, args.sheet.as_deref(), &cancel)
                .await
        }
    };

    if outcomes.iter().all(FileOutcome::is_success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
