//! # Click Aggregation Pipeline
//!
//! Counts banner clicks per UTC minute in memory and periodically commits the
//! counts to durable storage.
//!
//! ## Architecture
//!
//! 1. Clicks arrive through `ClickAggregator::increment` (see `ingestion`)
//! 2. Each click lands in one shard of the `CounterStore`, keyed by
//!    `(banner_id, minute)`
//! 3. The flush scheduler snapshots all shards on a fixed interval and hands
//!    the batch to an `AggregateWriter`
//! 4. Only after the writer accepts the batch are the snapshotted counts
//!    subtracted from the live shards
//! 5. On shutdown `ClickAggregator::stop` drains whatever is left, bounded by
//!    a deadline
//!
//! Reads never touch memory: `stats` queries the store through `StatsReader`.
//!
//! ## Module Organization
//!
//! - `types` - Keys, aggregate rows, stat points, minute bucketing
//! - `shard` - Shard router and sharded counter store
//! - `engine` - Snapshot/commit protocol and lifecycle controller
//! - `scheduler` - Periodic flush task
//! - `db` - Writer/reader traits and the SQLite adapter
//! - `sqlite_pragma` - Connection tuning
//! - `stats` - Range request validation for the read path
//! - `ingestion` - JSONL click stream reader
//! - `config` - Environment configuration

pub mod config;
pub mod db;
pub mod engine;
pub mod ingestion;
pub mod scheduler;
pub mod shard;
pub mod sqlite_pragma;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig};
pub use db::{AggregateWriter, SqliteClickStore, StatsReader, StoreError};
pub use engine::{AggregatorCore, ClickAggregator, EngineError, FlushOutcome, FlushStats, LifecycleState};
pub use ingestion::{cancel_on_signal, ingest_clicks, ClickEvent, IngestSummary};
pub use scheduler::SchedulerExit;
pub use shard::{shard_index, CounterStore, StoreSnapshot};
pub use stats::{RangeQuery, StatsError, StatsRequest, StatsResponse};
pub use types::{AggregateRow, ClickKey, StatPoint};
