//! Per-plate ordered write queue.
//!
//! Effects are written strictly in the order the state machine produced
//! them. A transient failure that outlasts the retry budget leaves the
//! failed write at the head of the queue and pauses the queue for the
//! cooldown; message processing continues meanwhile.
//!
//! Once a locally opened session is adopted, every write for it, whether
//! already queued or enqueued later, is pointed at the stored session.

use std::collections::VecDeque;
use std::sync::Arc;

use fw_core::machine::expected_status;
use fw_core::{
    Effect, OperatingSession, Plate, Policy, SessionId, SessionStatus, SessionStore, StoreError,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::retry::{Retried, with_retry};
use crate::stats::IngestStats;

/// A write the pipeline gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub plate: Plate,
    pub operation: &'static str,
    pub error: String,
    /// Whether the write is still queued for another attempt.
    pub queued: bool,
}

/// A locally opened session that lost the create race to `existing`.
#[derive(Debug, Clone)]
pub(crate) struct Adoption {
    pub(crate) from: SessionId,
    pub(crate) existing: OperatingSession,
}

pub(crate) struct SessionWriter {
    plate: Plate,
    store: Arc<dyn SessionStore>,
    config: Arc<IngestConfig>,
    policy: Arc<Policy>,
    stats: Arc<IngestStats>,
    failures: mpsc::Sender<WriteFailure>,
    queue: VecDeque<Effect>,
    retry_at: Option<Instant>,
    adopted: Vec<Adoption>,
}

impl SessionWriter {
    pub(crate) fn new(
        plate: Plate,
        store: Arc<dyn SessionStore>,
        config: Arc<IngestConfig>,
        policy: Arc<Policy>,
        stats: Arc<IngestStats>,
        failures: mpsc::Sender<WriteFailure>,
    ) -> Self {
        Self {
            plate,
            store,
            config,
            policy,
            stats,
            failures,
            queue: VecDeque::new(),
            retry_at: None,
            adopted: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// When a paused queue may be tried again.
    pub(crate) fn retry_at(&self) -> Option<Instant> {
        self.retry_at.filter(|_| !self.queue.is_empty())
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.retry_at().is_some_and(|at| Instant::now() < at)
    }

    /// Queues effects, dropping the oldest once the queue is full.
    pub(crate) fn enqueue(&mut self, effects: impl IntoIterator<Item = Effect>) {
        for mut effect in effects {
            for adoption in &self.adopted {
                retarget(&mut effect, adoption, &self.policy);
            }
            self.queue.push_back(effect);
        }
        let max = self.config.max_pending_writes.max(1);
        while self.queue.len() > max {
            if let Some(dropped) = self.queue.pop_front() {
                error!(
                    plate = %self.plate,
                    operation = operation(&dropped),
                    max_pending_writes = max,
                    "pending write queue full, dropping oldest write"
                );
                self.stats.add_writes_dropped(1);
                self.publish(operation(&dropped), "pending write queue full".to_string(), false);
            }
        }
    }

    /// Writes queued effects in order.
    ///
    /// Unless `force` is set, a queue paused by an earlier failure stays
    /// paused until its cooldown ends. Returns the sessions that must be
    /// adopted because another ONGOING session already held the plate.
    pub(crate) async fn flush(&mut self, force: bool) -> Vec<Adoption> {
        let mut adoptions = Vec::new();
        if !force && self.retry_at.is_some_and(|at| Instant::now() < at) {
            return adoptions;
        }
        self.retry_at = None;

        let mut conflict_retried = false;
        while let Some(effect) = self.queue.front().cloned() {
            let Retried { result, retries } = self.write(&effect).await;
            self.stats.add_write_retries(u64::from(retries));

            match result {
                Ok(()) => {
                    self.queue.pop_front();
                    self.stats.add_writes_ok(1);
                    conflict_retried = false;
                }
                Err(StoreError::Conflict { existing, .. }) if !conflict_retried => {
                    let Effect::OpenSession(opened) = &effect else {
                        self.reject(&effect, &StoreError::Conflict {
                            plate: self.plate.clone(),
                            existing,
                        });
                        continue;
                    };
                    match self.load_ongoing().await {
                        Ok(Some(row)) => {
                            info!(
                                plate = %self.plate,
                                local = %opened.id,
                                existing = %row.id,
                                "plate already has an ONGOING session; adopting it"
                            );
                            let adoption = Adoption {
                                from: opened.id.clone(),
                                existing: row,
                            };
                            self.queue.pop_front();
                            for queued in &mut self.queue {
                                retarget(queued, &adoption, &self.policy);
                            }
                            self.adopted.push(adoption.clone());
                            adoptions.push(adoption);
                        }
                        // The conflicting row closed in the meantime; try the
                        // create once more.
                        Ok(None) => conflict_retried = true,
                        Err(err) => {
                            self.pause(&effect, &err);
                            break;
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    self.pause(&effect, &err);
                    break;
                }
                Err(err) => {
                    self.reject(&effect, &err);
                    conflict_retried = false;
                }
            }
        }
        adoptions
    }

    /// Discards whatever is still queued. Used when shutdown runs out of
    /// time.
    pub(crate) fn discard(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let count = self.queue.len();
        error!(
            plate = %self.plate,
            count,
            "discarding pending writes at shutdown"
        );
        self.stats
            .add_writes_dropped(u64::try_from(count).unwrap_or(u64::MAX));
        self.publish("shutdown", format!("{count} pending writes discarded"), false);
        self.queue.clear();
    }

    async fn write(&self, effect: &Effect) -> Retried<()> {
        let retry = &self.config.retry;
        let timeout = self.config.write_timeout();
        let expected = expected_status(effect).unwrap_or(SessionStatus::Ongoing);
        let op = operation(effect);
        match effect.clone() {
            Effect::OpenSession(session) => {
                with_retry(&self.store, retry, timeout, op, move |store| {
                    store.create_session(&session).map(|_| ())
                })
                .await
            }
            Effect::UpdateSession { id, patch } => {
                with_retry(&self.store, retry, timeout, op, move |store| {
                    store.update_session(&id, expected, &patch)
                })
                .await
            }
            Effect::CloseSession(close) => {
                let patch = close.patch();
                with_retry(&self.store, retry, timeout, op, move |store| {
                    store.update_session(&close.id, expected, &patch)
                })
                .await
            }
            Effect::RecordFill(fill) => {
                with_retry(&self.store, retry, timeout, op, move |store| {
                    store.upsert_fill_event(&fill)
                })
                .await
            }
            Effect::Activity(entry) => {
                with_retry(&self.store, retry, timeout, op, move |store| {
                    store.append_activity(&entry)
                })
                .await
            }
        }
    }

    async fn load_ongoing(&self) -> Result<Option<OperatingSession>, StoreError> {
        let plate = self.plate.clone();
        with_retry(
            &self.store,
            &self.config.retry,
            self.config.write_timeout(),
            "ongoing_session",
            move |store| store.ongoing_session(&plate),
        )
        .await
        .result
    }

    fn pause(&mut self, effect: &Effect, err: &StoreError) {
        let cooldown = self.config.retry.cooldown();
        error!(
            plate = %self.plate,
            operation = operation(effect),
            pending = self.queue.len(),
            cooldown_ms = self.config.retry.cooldown_ms,
            error = %err,
            "store write failed after retries; queue paused"
        );
        self.retry_at = Some(Instant::now() + cooldown);
        self.publish(operation(effect), err.to_string(), true);
    }

    fn reject(&mut self, effect: &Effect, err: &StoreError) {
        warn!(
            plate = %self.plate,
            operation = operation(effect),
            error = %err,
            "store rejected write; dropping it"
        );
        self.queue.pop_front();
        self.stats.add_writes_rejected(1);
        self.publish(operation(effect), err.to_string(), false);
    }

    fn publish(&self, operation: &'static str, error: String, queued: bool) {
        let failure = WriteFailure {
            plate: self.plate.clone(),
            operation,
            error,
            queued,
        };
        if self.failures.try_send(failure).is_err() {
            debug!(plate = %self.plate, "failure channel full or closed");
        }
    }
}

/// Points a write for the adopted local session at the stored one.
fn retarget(effect: &mut Effect, adoption: &Adoption, policy: &Policy) {
    let Adoption { from, existing } = adoption;
    match effect {
        Effect::UpdateSession { id, patch } if id == from => {
            id.clone_from(&existing.id);
            patch.fuel_filled_liters = patch
                .fuel_filled_liters
                .map(|filled| filled + existing.fuel_filled_liters);
        }
        Effect::CloseSession(close) if &close.id == from => {
            close.retarget(existing, &policy.session);
        }
        _ => {}
    }
}

const fn operation(effect: &Effect) -> &'static str {
    match effect {
        Effect::OpenSession(_) => "create_session",
        Effect::UpdateSession { .. } => "update_session",
        Effect::CloseSession(_) => "close_session",
        Effect::RecordFill(_) => "upsert_fill_event",
        Effect::Activity(_) => "append_activity",
    }
}
