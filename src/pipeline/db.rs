//! Durable aggregate storage
//!
//! The engine only sees the two narrow traits below. `SqliteClickStore` is the
//! production adapter: one row per `(banner_id, minute)`, merged additively so
//! repeated partial flushes accumulate instead of overwriting.

use super::sqlite_pragma::apply_optimized_pragmas;
use super::types::{AggregateRow, StatPoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    /// Count does not fit the store's signed 64-bit column
    CountOverflow { banner_id: i64, count: u64 },
    /// Blocking database task panicked or was cancelled
    TaskJoin(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::CountOverflow { banner_id, count } => {
                write!(f, "Count {} for banner {} exceeds store range", count, banner_id)
            }
            StoreError::TaskJoin(e) => write!(f, "Store task failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Sink for flushed aggregates
///
/// Implementations MUST merge additively on `(banner_id, ts)`:
/// `cnt = existing + incoming`. A write either applies the whole batch or
/// reports failure; the engine retries the same counts on the next cycle.
#[async_trait]
pub trait AggregateWriter: Send + Sync {
    async fn upsert_aggregates(&self, rows: &[AggregateRow]) -> Result<(), StoreError>;
}

/// Source for committed aggregates
#[async_trait]
pub trait StatsReader: Send + Sync {
    /// Points for `banner_id` with `from <= ts < to`, ordered by `ts`
    async fn query_range(
        &self,
        banner_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatPoint>, StoreError>;
}

/// SQLite-backed click store
pub struct SqliteClickStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteClickStore {
    /// Open (or create) the database at `db_path` and ensure the schema exists
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        init_schema(&conn)?;

        log::info!("SQLite click store ready: {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS banner_clicks (
            banner_id   INTEGER NOT NULL,
            ts          INTEGER NOT NULL,
            cnt         INTEGER NOT NULL,
            PRIMARY KEY (banner_id, ts)
        );
        "#,
    )
}

#[async_trait]
impl AggregateWriter for SqliteClickStore {
    /// Additive upsert of the whole batch in one transaction
    async fn upsert_aggregates(&self, rows: &[AggregateRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        // Reject before touching the database so a batch is all-or-nothing
        let values = rows
            .iter()
            .map(|row| {
                i64::try_from(row.count)
                    .map(|cnt| (row.banner_id, row.ts.timestamp(), cnt))
                    .map_err(|_| StoreError::CountOverflow {
                        banner_id: row.banner_id,
                        count: row.count,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO banner_clicks (banner_id, ts, cnt) VALUES (?1, ?2, ?3)
                     ON CONFLICT(banner_id, ts) DO UPDATE SET cnt = banner_clicks.cnt + excluded.cnt",
                )?;
                for (banner_id, ts, cnt) in &values {
                    stmt.execute(params![banner_id, ts, cnt])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl StatsReader for SqliteClickStore {
    async fn query_range(
        &self,
        banner_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatPoint>, StoreError> {
        let (from, to) = (from.timestamp(), to.timestamp());

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ts, cnt FROM banner_clicks
                 WHERE banner_id = ?1 AND ts >= ?2 AND ts < ?3
                 ORDER BY ts",
            )?;

            let points = stmt
                .query_map(params![banner_id, from, to], |row| {
                    let secs: i64 = row.get(0)?;
                    let ts = DateTime::<Utc>::from_timestamp(secs, 0)
                        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, secs))?;
                    Ok(StatPoint { ts, v: row.get(1)? })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(points)
        })
        .await
    }
}
