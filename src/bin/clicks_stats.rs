//! Click Stats - minute-level counts for one banner over a time range
//!
//! Prints `{"stats":[{"ts":"...","v":n},...]}` for committed aggregates with
//! `from <= ts < to`. Counts still pending in a running aggregator are not
//! included.
//!
//! Usage:
//!   cargo run --bin clicks_stats -- <banner_id> <from> <to>
//!
//! `from` / `to` accept RFC 3339 or `YYYY-MM-DDTHH:MM:SS` (UTC).
//!
//! Environment variables:
//!   CLICKS_DB_PATH - SQLite database path (default: data/clicks.db)
//!   READ_MAX_RANGE_DAYS - Longest accepted range (default: 90, 0 = unlimited)

use clickflow::pipeline::{PipelineConfig, RangeQuery, SqliteClickStore, StatsRequest};
use dotenv::dotenv;
use std::env;

const USAGE: &str = "usage: clicks_stats <banner_id> <from> <to>";

fn parse_args() -> Result<(i64, StatsRequest), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.as_slice() {
        [banner_id, from, to] => {
            let banner_id = banner_id
                .parse()
                .map_err(|_| format!("invalid banner id: {:?}", banner_id))?;
            Ok((
                banner_id,
                StatsRequest {
                    from: from.clone(),
                    to: to.clone(),
                },
            ))
        }
        _ => Err(USAGE.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = PipelineConfig::from_env()?;
    let (banner_id, request) = parse_args()?;
    let query = RangeQuery::new(banner_id, &request, config.read_max_range_days)?;

    log::debug!(
        "Querying banner {} from {} to {}",
        query.banner_id,
        query.from,
        query.to
    );

    let store = SqliteClickStore::open(&config.db_path)?;
    let response = query.execute(&store).await?;

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}
