//! Periodic flush scheduler
//!
//! One background task per aggregator. Each tick runs a full snapshot/commit
//! cycle; a failed cycle is logged and retried on the next tick. The final
//! drain belongs to `ClickAggregator::stop`, not to this loop.

use super::engine::{AggregatorCore, FlushOutcome, DEFAULT_FLUSH_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Which signal ended the scheduler loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// Caller's cancellation token fired
    Cancelled,
    /// Aggregator's stop signal fired
    Stopped,
}

/// Flush scheduler task - periodically snapshot and commit pending counts
///
/// Arguments:
/// - `core`: shared counters and flush protocol
/// - `flush_interval`: time between cycles (zero falls back to the default)
/// - `cancel`: caller's cancellation signal
/// - `stop`: aggregator's internal stop signal
///
/// Returns as soon as either signal fires. A cycle already writing is allowed
/// to finish first; no new cycle starts after a signal is observed.
pub async fn flush_scheduler_task(
    core: Arc<AggregatorCore>,
    flush_interval: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
) -> SchedulerExit {
    let period = if flush_interval.is_zero() {
        DEFAULT_FLUSH_INTERVAL
    } else {
        flush_interval
    };

    log::info!("Starting flush scheduler (interval: {}ms)", period.as_millis());

    // First cycle one full period after start
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!("Flush scheduler cancelled");
                return SchedulerExit::Cancelled;
            }
            _ = stop.cancelled() => {
                log::info!("Flush scheduler stopped");
                return SchedulerExit::Stopped;
            }
            _ = timer.tick() => {
                let flush_start = std::time::Instant::now();
                match core.flush_once().await {
                    Ok(FlushOutcome::Empty) => {}
                    Ok(FlushOutcome::Committed { rows, clicks }) => {
                        log::debug!(
                            "Flushed {} rows ({} clicks) in {}ms",
                            rows,
                            clicks,
                            flush_start.elapsed().as_millis()
                        );
                    }
                    Err(e) => {
                        log::warn!(
                            "Flush failed, {} keys kept for next cycle: {}",
                            core.counters().pending_keys(),
                            e
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::{AggregateWriter, StoreError};
    use crate::pipeline::types::AggregateRow;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    #[derive(Default)]
    struct CountingWriter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AggregateWriter for CountingWriter {
        async fn upsert_aggregates(&self, _rows: &[AggregateRow]) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spawn_scheduler(
        core: Arc<AggregatorCore>,
        cancel: &CancellationToken,
        stop: &CancellationToken,
    ) -> tokio::task::JoinHandle<SchedulerExit> {
        tokio::spawn(flush_scheduler_task(
            core,
            Duration::from_millis(10),
            cancel.clone(),
            stop.clone(),
        ))
    }

    // Paused clock: each sleep auto-advances past exactly one 10ms tick
    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_each_tick() {
        let writer = Arc::new(CountingWriter::default());
        let core = Arc::new(AggregatorCore::new(writer.clone(), 4));
        let (cancel, stop) = (CancellationToken::new(), CancellationToken::new());
        let ts = Utc.with_ymd_and_hms(2025, 10, 19, 0, 29, 0).unwrap();

        let handle = spawn_scheduler(core.clone(), &cancel, &stop);

        core.increment(1, &ts);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);

        core.increment(1, &ts);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(core.stats().clicks_written(), 2);

        // Idle ticks do not call the writer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer.calls.load(Ordering::SeqCst), 2);

        stop.cancel();
        let exit = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(exit, SchedulerExit::Stopped);
    }

    #[tokio::test]
    async fn test_returns_on_stop_signal() {
        let core = Arc::new(AggregatorCore::new(Arc::new(CountingWriter::default()), 1));
        let (cancel, stop) = (CancellationToken::new(), CancellationToken::new());

        let handle = spawn_scheduler(core, &cancel, &stop);
        stop.cancel();

        let exit = timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler ignored stop")
            .unwrap();
        assert_eq!(exit, SchedulerExit::Stopped);
    }

    #[tokio::test]
    async fn test_returns_on_cancellation_without_flush() {
        let writer = Arc::new(CountingWriter::default());
        let core = Arc::new(AggregatorCore::new(writer.clone(), 1));
        let (cancel, stop) = (CancellationToken::new(), CancellationToken::new());
        core.increment(1, &Utc::now());

        cancel.cancel();
        let handle = spawn_scheduler(core.clone(), &cancel, &stop);

        let exit = timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler ignored cancellation")
            .unwrap();
        assert_eq!(exit, SchedulerExit::Cancelled);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(core.counters().pending_keys(), 1);
    }
}
