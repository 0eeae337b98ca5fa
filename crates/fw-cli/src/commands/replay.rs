//! Replay command: feed recorded telemetry through the live pipeline.
//!
//! Replaying the same file twice converges on the same sessions and fills,
//! so a replay can backfill a gap or rebuild after a schema reset.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fw_db::SqliteStore;
use fw_ingest::{FeedSummary, IngestStatsSnapshot, feed_lines};
use serde::Serialize;
use tokio::io::{AsyncBufRead, BufReader};

use super::run::{gateway, log_failures};
use super::util::runtime;
use crate::Config;

#[derive(Debug, Serialize)]
struct ReplayReport {
    #[serde(flatten)]
    feed: FeedSummary,
    stats: IngestStatsSnapshot,
}

pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    store: SqliteStore,
    input: &Path,
    json: bool,
) -> Result<()> {
    let store = Arc::new(store);
    let report = runtime()?.block_on(async {
        if input == Path::new("-") {
            replay(config, store, BufReader::new(tokio::io::stdin())).await
        } else {
            let file = tokio::fs::File::open(input)
                .await
                .with_context(|| format!("failed to open {}", input.display()))?;
            replay(config, store, BufReader::new(file)).await
        }
    })?;

    if json {
        serde_json::to_writer_pretty(&mut *writer, &report)?;
        writeln!(writer)?;
        return Ok(());
    }

    let stats = report.stats;
    writeln!(
        writer,
        "Replayed {} lines ({} malformed)",
        report.feed.lines, report.feed.malformed
    )?;
    writeln!(
        writer,
        "Processed {} messages ({} duplicates, {} late) across {} plates",
        stats.processed, stats.duplicates, stats.late, stats.workers
    )?;
    writeln!(
        writer,
        "Writes: {} ok, {} retried, {} rejected, {} dropped",
        stats.writes_ok, stats.write_retries, stats.writes_rejected, stats.writes_dropped
    )?;
    Ok(())
}

async fn replay<R>(config: &Config, store: Arc<SqliteStore>, reader: R) -> Result<ReplayReport>
where
    R: AsyncBufRead + Unpin,
{
    let mut gateway = gateway(config, store);
    let failures = gateway.take_failures().map(log_failures);

    let feed = feed_lines(reader, &mut gateway).await;
    // Drain whatever was routed even if reading stopped early.
    let stats = gateway.shutdown().await;
    if let Some(failures) = failures {
        failures.await.context("failure logger panicked")?;
    }
    let feed = feed.context("failed to read telemetry input")?;
    tracing::info!(lines = feed.lines, malformed = feed.malformed, "replay finished");

    Ok(ReplayReport { feed, stats })
}
