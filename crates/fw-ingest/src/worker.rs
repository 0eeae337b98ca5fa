//! Per-plate actor.
//!
//! Each plate gets one task that owns its reordering buffer, state machine
//! and write queue, so vehicle state is never shared or locked. The task
//! keeps reading its channel while a store write is in flight, so a slow
//! store never backs up the gateway.

use std::sync::Arc;

use fw_core::{
    Admission, CostCodeDirectory, Effect, Plate, Policy, ReorderBuffer, SessionStore,
    TelemetryMessage, VehicleStateMachine,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::retry::with_retry;
use crate::stats::IngestStats;
use crate::writer::{Adoption, SessionWriter, WriteFailure};

/// Shared handles every worker is built from.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) policy: Arc<Policy>,
    pub(crate) directory: Arc<dyn CostCodeDirectory>,
    pub(crate) config: Arc<IngestConfig>,
    pub(crate) stats: Arc<IngestStats>,
    pub(crate) failures: mpsc::Sender<WriteFailure>,
}

/// Ordering and session tracking for one plate. Effects collect here until
/// the write queue is free to take them.
struct Intake {
    plate: Plate,
    buffer: ReorderBuffer,
    machine: VehicleStateMachine,
    stats: Arc<IngestStats>,
    effects: Vec<Effect>,
}

impl Intake {
    fn admit(&mut self, msg: TelemetryMessage) {
        let device_time = msg.device_time;
        match self.buffer.push(msg, Instant::now().into_std()) {
            Admission::Buffered => {}
            Admission::Duplicate => {
                debug!(plate = %self.plate, %device_time, "duplicate message dropped");
                self.stats.add_duplicates(1);
            }
            Admission::Late => {
                warn!(
                    plate = %self.plate,
                    %device_time,
                    watermark = ?self.buffer.watermark(),
                    "message arrived after its window closed; dropped"
                );
                self.stats.add_late(1);
            }
        }
    }

    /// Runs every message whose reorder window has ended through the
    /// state machine.
    fn release(&mut self) {
        let ready = self.buffer.drain_ready(Instant::now().into_std());
        self.process(ready);
    }

    fn process(&mut self, messages: Vec<TelemetryMessage>) {
        for msg in messages {
            let effects = self.machine.handle(&msg);
            self.stats.add_processed(1);
            self.effects.extend(effects);
        }
    }

    fn adopt(&mut self, adoption: &Adoption) {
        let effects = self.machine.adopt_session(&adoption.from, &adoption.existing);
        self.stats.add_adoptions(1);
        self.effects.extend(effects);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.buffer.next_deadline().map(Instant::from_std)
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

pub(crate) struct PlateWorker {
    rx: mpsc::Receiver<TelemetryMessage>,
    closed: bool,
    intake: Intake,
    writer: SessionWriter,
    store: Arc<dyn SessionStore>,
    config: Arc<IngestConfig>,
}

impl PlateWorker {
    pub(crate) fn new(
        plate: Plate,
        rx: mpsc::Receiver<TelemetryMessage>,
        ctx: &WorkerContext,
    ) -> Self {
        Self {
            intake: Intake {
                buffer: ReorderBuffer::new(ctx.policy.reorder.clone()),
                machine: VehicleStateMachine::new(
                    plate.clone(),
                    Arc::clone(&ctx.policy),
                    Arc::clone(&ctx.directory),
                ),
                stats: Arc::clone(&ctx.stats),
                effects: Vec::new(),
                plate: plate.clone(),
            },
            writer: SessionWriter::new(
                plate,
                Arc::clone(&ctx.store),
                Arc::clone(&ctx.config),
                Arc::clone(&ctx.policy),
                Arc::clone(&ctx.stats),
                ctx.failures.clone(),
            ),
            store: Arc::clone(&ctx.store),
            config: Arc::clone(&ctx.config),
            closed: false,
            rx,
        }
    }

    /// Runs until the gateway closes the channel, then drains.
    pub(crate) async fn run(mut self) {
        debug!(plate = %self.intake.plate, "worker started");
        self.resume().await;

        while !self.closed {
            let timer = sleep_until_some(earliest(
                self.intake.next_deadline(),
                self.writer.retry_at(),
            ));
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.intake.admit(msg),
                    None => self.closed = true,
                },
                () = timer => {}
            }
            self.intake.release();
            self.flush(false).await;
        }

        self.shutdown().await;
    }

    /// Picks up a session left ONGOING by an earlier run. Messages that
    /// arrive during the lookup are buffered but not processed.
    async fn resume(&mut self) {
        let plate = self.intake.plate.clone();
        let Self {
            rx,
            closed,
            intake,
            store,
            config,
            ..
        } = self;
        let lookup = with_retry(
            store,
            &config.retry,
            config.write_timeout(),
            "ongoing_session",
            move |store| store.ongoing_session(&plate),
        );
        tokio::pin!(lookup);
        let outcome = loop {
            tokio::select! {
                outcome = &mut lookup => break outcome,
                msg = rx.recv(), if !*closed => match msg {
                    Some(msg) => intake.admit(msg),
                    None => *closed = true,
                },
            }
        };

        match outcome.result {
            Ok(Some(session)) => {
                if intake.machine.resume(&session) {
                    info!(plate = %intake.plate, session = %session.id, "resumed ONGOING session");
                    intake.stats.add_resumed(1);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(
                plate = %intake.plate,
                error = %err,
                "could not load ONGOING session; starting idle"
            ),
        }
    }

    /// Writes collected effects until the queue is empty or paused.
    async fn flush(&mut self, force: bool) {
        let mut force = force;
        loop {
            self.writer.enqueue(self.intake.take_effects());
            if self.writer.is_empty() || (!force && self.writer.is_paused()) {
                return;
            }
            let adoptions = self.write_while_receiving(force).await;
            // Effects produced during the write predate any adoption it found.
            self.writer.enqueue(self.intake.take_effects());
            if adoptions.is_empty() {
                if self.writer.is_paused() {
                    return;
                }
                force = false;
                continue;
            }
            for adoption in &adoptions {
                self.intake.adopt(adoption);
            }
            // Write the adoption records straight away.
            force = true;
        }
    }

    /// Flushes the write queue while still admitting and releasing
    /// messages. Their effects wait in the intake until the flush returns.
    async fn write_while_receiving(&mut self, force: bool) -> Vec<Adoption> {
        let Self {
            rx,
            closed,
            intake,
            writer,
            ..
        } = self;
        let flush = writer.flush(force);
        tokio::pin!(flush);
        loop {
            let timer = sleep_until_some(intake.next_deadline());
            tokio::select! {
                adoptions = &mut flush => return adoptions,
                msg = rx.recv(), if !*closed => match msg {
                    Some(msg) => intake.admit(msg),
                    None => *closed = true,
                },
                () = timer => {}
            }
            intake.release();
        }
    }

    async fn shutdown(mut self) {
        let remaining = self.intake.buffer.drain_all();
        self.intake.process(remaining);
        let effects = self.intake.machine.finish();
        self.intake.effects.extend(effects);

        let deadline = Instant::now() + self.config.shutdown_timeout();
        loop {
            self.flush(true).await;
            if self.writer.is_empty() || Instant::now() >= deadline {
                break;
            }
            let next_try = Instant::now() + self.config.retry.cooldown();
            sleep_until(next_try.min(deadline)).await;
        }
        if !self.writer.is_empty() {
            warn!(
                plate = %self.intake.plate,
                pending = self.writer.len(),
                "shutdown deadline reached with writes pending"
            );
        }
        self.writer.discard();

        let reorder = self.intake.buffer.stats();
        debug!(
            plate = %self.intake.plate,
            buffered = reorder.buffered,
            released = reorder.released,
            "worker stopped"
        );
    }
}

async fn sleep_until_some(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
