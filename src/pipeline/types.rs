//! Core data types shared by the engine and the storage adapter
//!
//! A click is counted against a `ClickKey`: the banner id plus the UTC minute
//! the click fell into. Aggregates leave the engine as `AggregateRow`s and come
//! back out of the store as `StatPoint`s.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds per aggregation bucket
pub const BUCKET_SECS: i64 = 60;

/// Counter key: one banner, one UTC minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClickKey {
    pub banner_id: i64,

    /// Minutes since the unix epoch (UTC)
    pub minute: i64,
}

impl ClickKey {
    /// Build the key for a click at `ts`
    ///
    /// Any timezone is accepted; the bucket is always computed on the UTC
    /// instant, so two clicks in the same UTC minute collapse to one key.
    pub fn new<Tz: TimeZone>(banner_id: i64, ts: &DateTime<Tz>) -> Self {
        Self {
            banner_id,
            minute: minute_bucket(ts),
        }
    }

    /// Start of the bucket as a UTC timestamp
    pub fn bucket_start(&self) -> DateTime<Utc> {
        bucket_start(self.minute)
    }
}

/// Minutes since the epoch for `ts`, floored (pre-epoch instants round down)
pub fn minute_bucket<Tz: TimeZone>(ts: &DateTime<Tz>) -> i64 {
    ts.timestamp().div_euclid(BUCKET_SECS)
}

/// UTC timestamp of the first second of `minute`
pub fn bucket_start(minute: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(minute.saturating_mul(BUCKET_SECS), 0)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Truncate a timestamp to the start of its UTC minute
pub fn truncate_to_minute<Tz: TimeZone>(ts: &DateTime<Tz>) -> DateTime<Utc> {
    bucket_start(minute_bucket(ts))
}

/// One aggregate handed to the durable store at flush time
///
/// The store must merge additively on `(banner_id, ts)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRow {
    pub banner_id: i64,

    /// Bucket start, minute-aligned UTC
    pub ts: DateTime<Utc>,

    pub count: u64,
}

impl AggregateRow {
    pub fn from_key(key: &ClickKey, count: u64) -> Self {
        Self {
            banner_id: key.banner_id,
            ts: key.bucket_start(),
            count,
        }
    }
}

/// One point of a range query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatPoint {
    pub ts: DateTime<Utc>,
    pub v: i64,
}
