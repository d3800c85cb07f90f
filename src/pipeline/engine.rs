//! Click aggregation engine
//!
//! ```text
//! increment() ──► CounterStore (sharded, in memory)
//!                      │
//!     timer / stop ──► flush_once(): snapshot ─► AggregateWriter ─► clear_matching
//! ```
//!
//! `AggregatorCore` owns the counters and the snapshot/commit protocol.
//! `ClickAggregator` wraps it with the lifecycle: `Idle → Running → Draining →
//! Stopped`, a background flush scheduler, and a bounded final drain.
//!
//! Delivery to the store is at-least-once. If a writer reports failure after it
//! actually committed, the retry adds the same counts a second time.

use super::config::PipelineConfig;
use super::db::{AggregateWriter, StoreError};
use super::scheduler::{flush_scheduler_task, SchedulerExit};
use super::shard::CounterStore;
use chrono::{DateTime, TimeZone};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Flush interval used when the configured one is zero
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Result of one snapshot/commit cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending; the writer was not called
    Empty,
    /// Writer accepted the batch and the counts were removed from memory
    Committed { rows: usize, clicks: u64 },
}

#[derive(Debug)]
pub enum EngineError {
    /// Writer rejected the batch; counts stay in memory
    Write(StoreError),
    /// Final drain did not finish in time
    DeadlineElapsed(Duration),
    InvalidTransition {
        from: LifecycleState,
        action: &'static str,
    },
    /// `start` was called outside a tokio runtime
    NoRuntime,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Write(err)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Write(e) => write!(f, "Aggregate write failed: {}", e),
            EngineError::DeadlineElapsed(d) => write!(f, "Drain deadline of {:?} elapsed", d),
            EngineError::InvalidTransition { from, action } => {
                write!(f, "Cannot {} aggregator in state {:?}", action, from)
            }
            EngineError::NoRuntime => write!(f, "No tokio runtime to run the flush scheduler"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Write(e) => Some(e),
            _ => None,
        }
    }
}

/// Running totals of flush activity
#[derive(Debug, Default)]
pub struct FlushStats {
    committed: AtomicU64,
    failed: AtomicU64,
    rows_written: AtomicU64,
    clicks_written: AtomicU64,
}

impl FlushStats {
    fn record_commit(&self, rows: usize, clicks: u64) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows as u64, Ordering::Relaxed);
        self.clicks_written.fetch_add(clicks, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Cycles whose batch the writer accepted
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Cycles whose batch the writer rejected
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn clicks_written(&self) -> u64 {
        self.clicks_written.load(Ordering::Relaxed)
    }
}

/// Counters plus the snapshot/commit protocol
///
/// Shared between request handlers (`increment`) and the flush scheduler.
pub struct AggregatorCore {
    counters: CounterStore,
    writer: Arc<dyn AggregateWriter>,

    /// Serializes flush cycles so two cycles never write the same snapshot
    flush_lock: tokio::sync::Mutex<()>,

    stats: FlushStats,
}

impl AggregatorCore {
    pub fn new(writer: Arc<dyn AggregateWriter>, shards: usize) -> Self {
        Self {
            counters: CounterStore::new(shards),
            writer,
            flush_lock: tokio::sync::Mutex::new(()),
            stats: FlushStats::default(),
        }
    }

    /// Count one click; never blocks on I/O and never fails
    pub fn increment<Tz: TimeZone>(&self, banner_id: i64, ts: &DateTime<Tz>) {
        self.counters.increment_at(banner_id, ts);
    }

    /// Run one snapshot/commit cycle
    ///
    /// 1. Copy every shard under its own lock.
    /// 2. Hand the flattened batch to the writer (no shard lock held).
    /// 3. On success subtract exactly the snapshotted counts; on failure leave
    ///    the shards untouched so the next cycle picks the counts up again.
    ///
    /// Dropping the returned future mid-write leaves the counts in memory.
    pub async fn flush_once(&self) -> Result<FlushOutcome, EngineError> {
        let _cycle = self.flush_lock.lock().await;

        let snapshot = self.counters.snapshot();
        if snapshot.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let rows = snapshot.to_rows();
        let clicks = snapshot.total_clicks();

        if let Err(e) = self.writer.upsert_aggregates(&rows).await {
            self.stats.record_failure();
            return Err(EngineError::Write(e));
        }

        self.counters.clear_matching(&snapshot);
        self.stats.record_commit(rows.len(), clicks);

        Ok(FlushOutcome::Committed {
            rows: rows.len(),
            clicks,
        })
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }
}

/// Public engine surface: increment, start, stop
pub struct ClickAggregator {
    core: Arc<AggregatorCore>,
    flush_interval: Duration,

    /// Shared with the scheduler task, which moves it to `Draining` on cancellation
    state: Arc<Mutex<LifecycleState>>,

    /// Internal stop signal for the scheduler, separate from the caller's token
    stop_token: CancellationToken,

    /// Set by the first `stop`; later calls are rejected
    stop_requested: AtomicBool,

    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl ClickAggregator {
    /// Create an idle aggregator
    ///
    /// `shards == 0` is corrected to 1 and a zero interval to
    /// [`DEFAULT_FLUSH_INTERVAL`] so construction always succeeds.
    pub fn new(writer: Arc<dyn AggregateWriter>, shards: usize, flush_interval: Duration) -> Self {
        let shards = if shards == 0 {
            log::warn!("Shard count 0 is invalid, using 1");
            1
        } else {
            shards
        };

        let flush_interval = if flush_interval.is_zero() {
            log::warn!(
                "Flush interval 0 is invalid, using {}ms",
                DEFAULT_FLUSH_INTERVAL.as_millis()
            );
            DEFAULT_FLUSH_INTERVAL
        } else {
            flush_interval
        };

        Self {
            core: Arc::new(AggregatorCore::new(writer, shards)),
            flush_interval,
            state: Arc::new(Mutex::new(LifecycleState::Idle)),
            stop_token: CancellationToken::new(),
            stop_requested: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        }
    }

    pub fn from_config(writer: Arc<dyn AggregateWriter>, config: &PipelineConfig) -> Self {
        Self::new(writer, config.shards, config.flush_interval())
    }

    /// Count one click for `banner_id` at `ts`
    ///
    /// Valid in every lifecycle state. Clicks counted after the final drain
    /// are not flushed.
    pub fn increment<Tz: TimeZone>(&self, banner_id: i64, ts: &DateTime<Tz>) {
        self.core.increment(banner_id, ts);
    }

    /// Launch the flush scheduler and return immediately
    ///
    /// `cancel` ends the periodic loop without a final flush and moves the
    /// aggregator to `Draining`; call [`stop`](Self::stop) to drain. Fails
    /// with [`EngineError::NoRuntime`] outside a tokio runtime.
    pub fn start(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        if *state != LifecycleState::Idle {
            return Err(EngineError::InvalidTransition {
                from: *state,
                action: "start",
            });
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let scheduler = flush_scheduler_task(
            self.core.clone(),
            self.flush_interval,
            cancel,
            self.stop_token.clone(),
        );
        let shared_state = self.state.clone();
        let handle = runtime.spawn(async move {
            if scheduler.await == SchedulerExit::Cancelled {
                let mut state = lock(&shared_state);
                if *state == LifecycleState::Running {
                    *state = LifecycleState::Draining;
                    log::info!("Click aggregator cancelled, waiting for stop to drain");
                }
            }
        });
        *lock(&self.scheduler) = Some(handle);
        *state = LifecycleState::Running;

        log::info!(
            "Click aggregator started ({} shards, flush every {}ms)",
            self.core.counters().shard_count(),
            self.flush_interval.as_millis()
        );
        Ok(())
    }

    /// Stop the scheduler and drain pending counts
    ///
    /// Valid once, from `Idle`, `Running`, or `Draining` after cancellation. A
    /// periodic write already in flight finishes first; `deadline` bounds only
    /// the drain. The aggregator ends in `Stopped` whatever the drain result is.
    pub async fn stop(&self, deadline: Duration) -> Result<FlushOutcome, EngineError> {
        {
            let mut state = lock(&self.state);
            if self.stop_requested.swap(true, Ordering::SeqCst) {
                return Err(EngineError::InvalidTransition {
                    from: *state,
                    action: "stop",
                });
            }
            *state = LifecycleState::Draining;
        }

        self.stop_token.cancel();
        let scheduler = lock(&self.scheduler).take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                log::warn!("Flush scheduler ended abnormally: {}", e);
            }
        }

        log::info!("Draining click aggregator (deadline {}ms)", deadline.as_millis());

        let result = match tokio::time::timeout(deadline, self.core.flush_once()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DeadlineElapsed(deadline)),
        };

        *lock(&self.state) = LifecycleState::Stopped;

        match &result {
            Ok(FlushOutcome::Empty) => log::info!("Drain complete: nothing pending"),
            Ok(FlushOutcome::Committed { rows, clicks }) => {
                log::info!("Drain complete: {} rows, {} clicks", rows, clicks)
            }
            Err(e) => log::error!("Drain failed, pending clicks dropped: {}", e),
        }

        result
    }

    /// Run one flush cycle outside the schedule
    pub async fn flush_once(&self) -> Result<FlushOutcome, EngineError> {
        self.core.flush_once().await
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn core(&self) -> &AggregatorCore {
        &self.core
    }

    pub fn stats(&self) -> &FlushStats {
        self.core.stats()
    }
}

impl Drop for ClickAggregator {
    fn drop(&mut self) {
        self.stop_token.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
