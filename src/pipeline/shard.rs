//! Sharded in-memory click counters
//!
//! A fixed array of independently locked maps. Each key routes to exactly one
//! shard for the lifetime of the store, so an increment only ever contends
//! with increments to the same shard or a snapshot copy of it.
//!
//! Shards hold no I/O and never call out while locked; every lock is held for
//! one map operation or one map copy.

use super::types::{AggregateRow, ClickKey};
use chrono::{DateTime, TimeZone};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Odd multiplier mixed into the banner id before reduction
const SHARD_MULTIPLIER: u64 = 1_315_423_911;

/// Route a key to a shard in `[0, shard_count)`
///
/// Pure function of the key: the same key always lands on the same shard for a
/// given shard count. The bucket is XORed in so a single hot banner spreads
/// across shards from one minute to the next.
#[inline]
pub fn shard_index(key: &ClickKey, shard_count: usize) -> usize {
    let mixed = (key.banner_id as u64).wrapping_mul(SHARD_MULTIPLIER) ^ (key.minute as u64);
    (mixed % shard_count.max(1) as u64) as usize
}

type ShardMap = HashMap<ClickKey, u64>;

/// Point-in-time copy of every shard's pending counts
///
/// Per-shard layout is kept so the commit step can revisit exactly the shard
/// each key was copied from.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    shards: Vec<ShardMap>,
}

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Number of distinct keys in the snapshot
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Sum of all snapshotted counts
    pub fn total_clicks(&self) -> u64 {
        self.shards
            .iter()
            .flat_map(|s| s.values())
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Flatten into aggregate rows, one per key
    pub fn to_rows(&self) -> Vec<AggregateRow> {
        let mut rows = Vec::with_capacity(self.len());
        for shard in self.shards.iter().filter(|s| !s.is_empty()) {
            rows.extend(shard.iter().map(|(key, count)| AggregateRow::from_key(key, *count)));
        }
        rows
    }
}

/// Fixed-size set of lock-guarded counter maps
pub struct CounterStore {
    shards: Box<[Mutex<ShardMap>]>,
}

impl CounterStore {
    /// Create a store with `shard_count` shards (at least one)
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::with_capacity(1024)))
            .collect();

        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `key`
    #[inline]
    pub fn shard_for(&self, key: &ClickKey) -> usize {
        shard_index(key, self.shards.len())
    }

    /// Count one click for `banner_id` at `ts`
    pub fn increment_at<Tz: TimeZone>(&self, banner_id: i64, ts: &DateTime<Tz>) {
        self.increment(ClickKey::new(banner_id, ts));
    }

    /// Count one click against `key`
    ///
    /// Locks only the owning shard; never fails.
    pub fn increment(&self, key: ClickKey) {
        let mut shard = self.lock_shard(self.shard_for(&key));
        let count = shard.entry(key).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Copy every shard's pending counts, one shard lock at a time
    pub fn snapshot(&self) -> StoreSnapshot {
        let shards = (0..self.shards.len())
            .map(|idx| {
                let shard = self.lock_shard(idx);
                if shard.is_empty() {
                    ShardMap::new()
                } else {
                    shard.clone()
                }
            })
            .collect();

        StoreSnapshot { shards }
    }

    /// Remove the snapshotted quantities from the live shards
    ///
    /// Each live entry is reduced by its snapshotted count and removed only
    /// when it reaches zero. Anything added after the snapshot was taken stays
    /// behind for the next cycle.
    pub fn clear_matching(&self, snapshot: &StoreSnapshot) {
        for (idx, taken) in snapshot.shards.iter().enumerate() {
            if taken.is_empty() {
                continue;
            }

            let mut shard = self.lock_shard(idx);
            for (key, flushed) in taken {
                let remaining = match shard.get(key) {
                    Some(live) => live.saturating_sub(*flushed),
                    None => continue,
                };
                if remaining == 0 {
                    shard.remove(key);
                } else {
                    shard.insert(*key, remaining);
                }
            }
        }
    }

    /// Current pending count for `key`
    pub fn get(&self, key: &ClickKey) -> Option<u64> {
        self.lock_shard(self.shard_for(key)).get(key).copied()
    }

    /// Number of keys waiting to be flushed
    pub fn pending_keys(&self) -> usize {
        (0..self.shards.len()).map(|idx| self.lock_shard(idx).len()).sum()
    }

    fn lock_shard(&self, idx: usize) -> MutexGuard<'_, ShardMap> {
        // Shard maps stay consistent across a panicking holder: every critical
        // section is a single map operation.
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn hold_shard(&self, idx: usize) -> MutexGuard<'_, ShardMap> {
        self.lock_shard(idx)
    }
}
