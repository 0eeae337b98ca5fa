//! Run command: consume the live telemetry feed.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use fw_db::SqliteStore;
use fw_ingest::{Gateway, WriteFailure, run_websocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::util::runtime;
use crate::Config;

/// Builds a gateway writing through `store` with the configured policy and
/// cost codes. Must be called inside the runtime.
pub(crate) fn gateway(config: &Config, store: Arc<SqliteStore>) -> Gateway {
    Gateway::new(
        store,
        Arc::new(config.policy.clone()),
        Arc::new(config.directory()),
        config.ingest.clone(),
    )
}

/// Logs every write the pipeline gave up on or is still retrying.
pub(crate) fn log_failures(mut failures: mpsc::Receiver<WriteFailure>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            if failure.queued {
                tracing::warn!(
                    plate = %failure.plate,
                    operation = failure.operation,
                    error = %failure.error,
                    "write delayed; will retry"
                );
            } else {
                tracing::error!(
                    plate = %failure.plate,
                    operation = failure.operation,
                    error = %failure.error,
                    "write failed"
                );
            }
        }
    })
}

pub fn run(config: &Config, store: SqliteStore, url: Option<&str>) -> Result<()> {
    let Some(url) = url.or(config.ingest.websocket_url.as_deref()) else {
        bail!("no feed URL: pass --url or set ingest.websocket_url");
    };
    let store = Arc::new(store);

    runtime()?.block_on(async {
        let mut gateway = gateway(config, store);
        let failures = gateway.take_failures().map(log_failures);

        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("interrupt received; shutting down");
        };
        run_websocket(url, &mut gateway, &config.ingest.reconnect, shutdown)
            .await
            .context("telemetry feed failed")?;

        let stats = gateway.shutdown().await;
        if let Some(failures) = failures {
            failures.await.context("failure logger panicked")?;
        }
        tracing::info!(
            processed = stats.processed,
            malformed = stats.malformed,
            writes_dropped = stats.writes_dropped,
            "feed consumer stopped"
        );
        Ok(())
    })
}
