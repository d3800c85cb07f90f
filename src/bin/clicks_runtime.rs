//! Click Runtime - ingestion, periodic flush and graceful drain
//!
//! Reads click events as JSON lines from stdin, counts them per banner and
//! UTC minute, and flushes the counts to SQLite on a fixed interval. On
//! CTRL+C or end of input the aggregator is stopped and drained.
//!
//! Usage:
//!   producer | cargo run --release --bin clicks_runtime
//!
//! Environment variables:
//!   CLICKS_DB_PATH - SQLite database path (default: data/clicks.db)
//!   FLUSH_INTERVAL_MS - Flush interval (default: 1000)
//!   SHARDS - Counter shards (default: 64)
//!   SHUTDOWN_WAIT_MS - Drain deadline (default: 5000)
//!   RUST_LOG - Logging level (default: info)

use clickflow::pipeline::{
    cancel_on_signal, ingest_clicks, ClickAggregator, FlushOutcome, PipelineConfig,
    SqliteClickStore,
};
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run());

    // A blocked stdin read cannot be cancelled; don't wait on it
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::from_env()?;

    info!("Starting click runtime");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Shards: {}", config.shards);
    info!("   ├─ Flush interval: {}ms", config.flush_interval_ms);
    info!("   └─ Shutdown wait: {}ms", config.shutdown_wait_ms);

    let store = Arc::new(SqliteClickStore::open(&config.db_path)?);
    let aggregator = ClickAggregator::from_config(store, &config);

    let shutdown = CancellationToken::new();
    aggregator.start(shutdown.child_token())?;

    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    let stdin = BufReader::new(tokio::io::stdin());
    match ingest_clicks(stdin, &aggregator, shutdown.clone()).await {
        Ok(summary) => info!(
            "Ingested {} clicks ({} rejected lines)",
            summary.accepted, summary.rejected
        ),
        Err(e) => error!("Click stream read failed: {}", e),
    }
    shutdown.cancel();

    match aggregator.stop(config.shutdown_wait()).await {
        Ok(FlushOutcome::Committed { rows, clicks }) => {
            info!("Final flush wrote {} rows ({} clicks)", rows, clicks)
        }
        Ok(FlushOutcome::Empty) => info!("Final flush: nothing pending"),
        Err(e) => warn!("Final flush incomplete: {}", e),
    }

    let stats = aggregator.stats();
    info!(
        "Click runtime stopped: {} flushes committed, {} failed, {} clicks written",
        stats.committed(),
        stats.failed(),
        stats.clicks_written()
    );
    Ok(())
}
