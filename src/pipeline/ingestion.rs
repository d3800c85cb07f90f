//! Click ingestion from a JSONL stream
//!
//! One event per line:
//!
//! ```text
//! {"banner_id": 42}
//! {"banner_id": 42, "ts": "2025-10-19T00:29:42Z"}
//! ```
//!
//! A missing `ts` stamps the click with the receive time. Bad lines are
//! counted and skipped; ingestion only ends on EOF, a read error or
//! cancellation.

use super::engine::ClickAggregator;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickEvent {
    pub banner_id: i64,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
}

/// Totals for one ingestion run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: u64,
    pub rejected: u64,
}

/// Parse one line into a click, rejecting non-positive banner ids
pub fn parse_click(line: &str) -> Result<ClickEvent, String> {
    let event: ClickEvent = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if event.banner_id <= 0 {
        return Err(format!("invalid banner_id {}", event.banner_id));
    }
    Ok(event)
}

/// Feed every click read from `reader` into `aggregator`
pub async fn ingest_clicks<R>(
    reader: R,
    aggregator: &ClickAggregator,
    cancel: CancellationToken,
) -> std::io::Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IngestSummary::default();

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Ingestion cancelled");
                break;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            log::info!("Click stream closed");
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_click(line) {
            Ok(event) => {
                let ts = event.ts.unwrap_or_else(Utc::now);
                aggregator.increment(event.banner_id, &ts);
                summary.accepted += 1;
            }
            Err(e) => {
                log::debug!("Rejected click line {:?}: {}", line, e);
                summary.rejected += 1;
            }
        }
    }

    log::info!(
        "Ingestion finished: {} accepted, {} rejected",
        summary.accepted,
        summary.rejected
    );
    Ok(summary)
}

/// Cancel `shutdown` once `signal` fires
///
/// A signal that fails to register leaves `shutdown` alone, so the process
/// keeps running until end of input.
pub async fn cancel_on_signal<S>(signal: S, shutdown: CancellationToken)
where
    S: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = signal.await {
        log::error!("Failed to listen for shutdown signal, running until end of input: {}", err);
        return;
    }
    log::info!("Received shutdown signal, shutting down...");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::{AggregateWriter, StoreError};
    use crate::pipeline::types::{AggregateRow, ClickKey};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};

    struct NullWriter;

    #[async_trait]
    impl AggregateWriter for NullWriter {
        async fn upsert_aggregates(&self, _rows: &[AggregateRow]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn aggregator() -> ClickAggregator {
        ClickAggregator::new(Arc::new(NullWriter), 4, Duration::from_secs(3600))
    }

    #[test]
    fn test_parse_click() {
        let event = parse_click(r#"{"banner_id":42,"ts":"2025-10-19T00:29:42Z"}"#).unwrap();
        assert_eq!(event.banner_id, 42);
        assert_eq!(event.ts, Some(Utc.with_ymd_and_hms(2025, 10, 19, 0, 29, 42).unwrap()));

        assert_eq!(parse_click(r#"{"banner_id":7}"#).unwrap().ts, None);
        assert!(parse_click(r#"{"banner_id":0}"#).is_err());
        assert!(parse_click(r#"{"banner_id":"x"}"#).is_err());
        assert!(parse_click(r#"{"banner_id":1,"other":true}"#).is_err());
        assert!(parse_click("not json").is_err());
    }

    #[tokio::test]
    async fn test_ingest_counts_and_skips_bad_lines() {
        let input = concat!(
            "{\"banner_id\":42,\"ts\":\"2025-10-19T00:29:10Z\"}\n",
            "\n",
            "garbage\n",
            "{\"banner_id\":42,\"ts\":\"2025-10-19T00:29:50Z\"}\n",
            "{\"banner_id\":-1}\n",
            "{\"banner_id\":43,\"ts\":\"2025-10-19T00:30:00Z\"}",
        );
        let aggregator = aggregator();

        let summary = ingest_clicks(input.as_bytes(), &aggregator, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary, IngestSummary { accepted: 3, rejected: 2 });
        let m = Utc.with_ymd_and_hms(2025, 10, 19, 0, 29, 0).unwrap();
        let counters = aggregator.core().counters();
        assert_eq!(counters.get(&ClickKey::new(42, &m)), Some(2));
        assert_eq!(counters.pending_keys(), 2);
    }

    #[tokio::test]
    async fn test_ingest_stops_on_cancel() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut write_half, read_half) = (client, BufReader::new(server));
        let aggregator = Arc::new(aggregator());
        let cancel = CancellationToken::new();

        let task = {
            let aggregator = aggregator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingest_clicks(read_half, &aggregator, cancel).await })
        };

        write_half.write_all(b"{\"banner_id\":5}\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("ingestion ignored cancellation")
            .unwrap()
            .unwrap();
        assert_eq!(summary.accepted, 1);
    }

    #[tokio::test]
    async fn test_signal_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(async { Ok::<(), std::io::Error>(()) }, shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_signal_registration_keeps_running() {
        let shutdown = CancellationToken::new();
        let failing = async {
            Err::<(), _>(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no signal handler",
            ))
        };

        cancel_on_signal(failing, shutdown.clone()).await;
        assert!(!shutdown.is_cancelled());
    }
}
