//! Telemetry ingest gateway.
//!
//! Normalizes raw messages and routes them to the worker owning their plate.
//! Workers are spawned lazily on the first message for a plate and live
//! until [`Gateway::shutdown`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use fw_core::{CostCodeDirectory, Plate, Policy, SessionStore, TelemetryMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::stats::{IngestStats, IngestStatsSnapshot};
use crate::worker::{PlateWorker, WorkerContext};
use crate::writer::WriteFailure;

/// What happened to one raw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Routed,
    Malformed,
}

struct WorkerHandle {
    tx: mpsc::Sender<TelemetryMessage>,
    join: JoinHandle<()>,
}

pub struct Gateway {
    ctx: WorkerContext,
    workers: HashMap<Plate, WorkerHandle>,
    failures: Option<mpsc::Receiver<WriteFailure>>,
}

impl Gateway {
    /// Must be called from within a tokio runtime; workers are spawned on
    /// first use.
    pub fn new(
        store: Arc<dyn SessionStore>,
        policy: Arc<Policy>,
        directory: Arc<dyn CostCodeDirectory>,
        config: IngestConfig,
    ) -> Self {
        let (failures_tx, failures_rx) = mpsc::channel(config.failure_channel_capacity.max(1));
        Self {
            ctx: WorkerContext {
                store,
                policy,
                directory,
                config: Arc::new(config),
                stats: Arc::new(IngestStats::default()),
                failures: failures_tx,
            },
            workers: HashMap::new(),
            failures: Some(failures_rx),
        }
    }

    /// Receiver for writes the pipeline could not complete. Can be taken
    /// once; failures are dropped when nobody listens.
    pub fn take_failures(&mut self) -> Option<mpsc::Receiver<WriteFailure>> {
        self.failures.take()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.ctx.stats)
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Parses one raw JSON message and routes it. Malformed input is logged
    /// and counted, never returned as an error.
    pub async fn dispatch_raw(&mut self, json: &str) -> Dispatch {
        self.ctx.stats.add_received(1);
        match TelemetryMessage::from_json(json) {
            Ok(msg) => {
                self.route(msg).await;
                Dispatch::Routed
            }
            Err(err) => {
                self.ctx.stats.add_malformed(1);
                warn!(error = %err, "dropping malformed telemetry message");
                Dispatch::Malformed
            }
        }
    }

    /// Routes an already normalized message.
    pub async fn dispatch(&mut self, msg: TelemetryMessage) {
        self.ctx.stats.add_received(1);
        self.route(msg).await;
    }

    /// Counts input rejected before it could be parsed, such as non-UTF-8
    /// frames.
    pub fn record_malformed(&self) {
        self.ctx.stats.add_received(1);
        self.ctx.stats.add_malformed(1);
    }

    async fn route(&mut self, msg: TelemetryMessage) {
        let plate = msg.plate.clone();
        let tx = self.sender(&plate);
        let Err(mpsc::error::SendError(msg)) = tx.send(msg).await else {
            return;
        };

        // The worker only stops on its own if it panicked.
        if let Some(dead) = self.workers.remove(&plate) {
            match dead.join.await {
                Err(err) if err.is_panic() => error!(%plate, "worker panicked; restarting"),
                _ => error!(%plate, "worker stopped unexpectedly; restarting"),
            }
        }
        let tx = self.sender(&plate);
        if tx.send(msg).await.is_err() {
            error!(%plate, "worker unavailable; message dropped");
        }
    }

    fn sender(&mut self, plate: &Plate) -> mpsc::Sender<TelemetryMessage> {
        let ctx = &self.ctx;
        self.workers
            .entry(plate.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(ctx.config.channel_capacity.max(1));
                let worker = PlateWorker::new(plate.clone(), rx, ctx);
                ctx.stats.add_workers(1);
                debug!(%plate, "spawning plate worker");
                WorkerHandle {
                    tx,
                    join: tokio::spawn(worker.run()),
                }
            })
            .tx
            .clone()
    }

    /// Closes every worker's channel and waits for them to drain buffered
    /// messages, finalize open fills and flush pending writes.
    pub async fn shutdown(self) -> IngestStatsSnapshot {
        let Self { ctx, workers, .. } = self;
        let mut handles: Vec<(Plate, JoinHandle<()>)> = workers
            .into_iter()
            .map(|(plate, handle)| {
                drop(handle.tx);
                (plate, handle.join)
            })
            .collect();
        info!(workers = handles.len(), "shutting down ingest workers");

        // Workers bound their own drain by the shutdown timeout; the extra
        // write timeout covers a store call still in flight.
        let limit = ctx.config.shutdown_timeout() + ctx.config.write_timeout();
        let joined =
            tokio::time::timeout(limit, join_all(handles.iter_mut().map(|(_, join)| join))).await;
        match joined {
            Ok(results) => {
                for ((plate, _), result) in handles.iter().zip(results) {
                    if let Err(err) = result {
                        error!(%plate, error = %err, "worker failed during shutdown");
                    }
                }
            }
            Err(_) => {
                for (plate, join) in &handles {
                    if !join.is_finished() {
                        error!(%plate, "worker did not stop in time; aborting");
                        join.abort();
                    }
                }
            }
        }

        let stats = ctx.stats.snapshot();
        info!(
            received = stats.received,
            malformed = stats.malformed,
            processed = stats.processed,
            writes_ok = stats.writes_ok,
            writes_dropped = stats.writes_dropped,
            "ingest stopped"
        );
        stats
    }
}
