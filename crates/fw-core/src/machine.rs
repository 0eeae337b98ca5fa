//! Per-plate vehicle session state machine.
//!
//! The machine is pure: it consumes ordered [`TelemetryMessage`]s and returns
//! [`Effect`]s for the caller to persist. State lives on two independent
//! axes. The engine axis is the optional active session; the fill axis is
//! owned by the [`FuelFillDetector`]. Either may outlive the other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::fill::{FillTransition, FuelFillDetector, OpenFill};
use crate::policy::Policy;
use crate::session::{
    ActivityKind, ActivityLogEntry, CostCodeDirectory, FuelFillEvent, OperatingSession,
    SessionClose, SessionPatch,
};
use crate::status_token::StatusToken;
use crate::telemetry::TelemetryMessage;
use crate::types::{Plate, SessionId, SessionStatus};

/// A write the caller must perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenSession(OperatingSession),
    /// Progress on a still-ONGOING session (fills recorded so far).
    UpdateSession {
        id: SessionId,
        patch: SessionPatch,
    },
    CloseSession(SessionClose),
    RecordFill(FuelFillEvent),
    Activity(ActivityLogEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAxis {
    Idle,
    Active,
}

/// Read-only view of a plate's in-memory state.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleStateView {
    pub plate: Plate,
    pub engine: EngineAxis,
    pub session_id: Option<SessionId>,
    pub session_start: Option<DateTime<Utc>>,
    pub awaiting_closing_fuel: bool,
    pub open_fill: Option<OpenFill>,
    pub lowest_fuel: Option<f64>,
    pub last_fuel: Option<f64>,
    pub last_message_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ActiveSession {
    id: SessionId,
    start_time: DateTime<Utc>,
    /// `None` until a reading arrives; the create write waits for it.
    opening_fuel: Option<f64>,
    fuel_filled: f64,
}

#[derive(Debug, Clone)]
struct PendingClose {
    session: ActiveSession,
    end_time: DateTime<Utc>,
}

pub struct VehicleStateMachine {
    plate: Plate,
    policy: Arc<Policy>,
    directory: Arc<dyn CostCodeDirectory>,
    session: Option<ActiveSession>,
    pending_close: Option<PendingClose>,
    fill: FuelFillDetector,
    /// Part of the open fill already accounted for, either credited to a
    /// closed session or contained in the active session's opening reading.
    fill_credit: f64,
    last_fuel: Option<f64>,
    last_message_time: Option<DateTime<Utc>>,
}

impl VehicleStateMachine {
    pub fn new(plate: Plate, policy: Arc<Policy>, directory: Arc<dyn CostCodeDirectory>) -> Self {
        let fill = FuelFillDetector::new(plate.clone(), policy.fill.clone());
        Self {
            plate,
            policy,
            directory,
            session: None,
            pending_close: None,
            fill,
            fill_credit: 0.0,
            last_fuel: None,
            last_message_time: None,
        }
    }

    pub const fn plate(&self) -> &Plate {
        &self.plate
    }

    /// Processes one message. Messages must arrive in device-time order.
    pub fn handle(&mut self, msg: &TelemetryMessage) -> Vec<Effect> {
        let mut effects = Vec::new();
        let time = msg.device_time;
        let fuel = msg.fuel_volume_liters;

        self.resolve_pending_close(msg, &mut effects);
        self.resolve_pending_opening(msg, &mut effects);

        for transition in self.fill.observe(time, msg.status, fuel) {
            self.apply_fill_transition(transition, &mut effects);
        }

        match msg.status {
            StatusToken::EngineOn => self.engine_on(msg, &mut effects),
            StatusToken::EngineOff => self.engine_off(msg, &mut effects),
            StatusToken::PossibleFill | StatusToken::Unknown => {}
        }

        if fuel.is_some() {
            self.last_fuel = fuel;
        }
        self.last_message_time = Some(time);
        effects
    }

    /// Resolves everything still waiting on future input. Called when the
    /// worker stops; an active session stays ONGOING.
    pub fn finish(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let at = self.last_message_time.unwrap_or_else(Utc::now);

        if let Some(session) = &mut self.session {
            if session.opening_fuel.is_none() {
                let opening = self.last_fuel.unwrap_or_default();
                session.opening_fuel = Some(opening);
                let session = session.clone();
                effects.push(self.open_effect(&session, opening));
                effects.push(self.activity(ActivityKind::SessionOpened, session.start_time, None));
            }
        }
        if let Some(transition) = self.fill.finish() {
            self.apply_fill_transition(transition, &mut effects);
        }
        if let Some(pending) = self.pending_close.take() {
            let closing = self.fallback_closing(&pending.session);
            self.close(pending.session, pending.end_time, closing, &mut effects);
        }
        debug!(plate = %self.plate, effects = effects.len(), %at, "state machine finished");
        effects
    }

    /// Adopts a session already ONGOING in storage after a restart.
    ///
    /// Returns false if the machine already tracks a session.
    pub fn resume(&mut self, stored: &OperatingSession) -> bool {
        if self.session.is_some() || self.pending_close.is_some() {
            return false;
        }
        self.session = Some(ActiveSession {
            id: stored.id.clone(),
            start_time: stored.start_time,
            opening_fuel: Some(stored.opening_fuel),
            fuel_filled: stored.fuel_filled_liters,
        });
        if self.last_fuel.is_none() {
            self.last_fuel = Some(stored.opening_fuel);
        }
        true
    }

    /// Replaces a locally opened session that lost the create race with the
    /// session that won it. Fills credited locally carry over.
    ///
    /// The adoption is always recorded; in-memory state only changes while
    /// the machine still tracks `from`.
    pub fn adopt_session(&mut self, from: &SessionId, existing: &OperatingSession) -> Vec<Effect> {
        let target = if self.session.as_ref().is_some_and(|s| &s.id == from) {
            self.session.as_mut()
        } else {
            self.pending_close
                .as_mut()
                .map(|pending| &mut pending.session)
                .filter(|session| &session.id == from)
        };
        if let Some(target) = target {
            target.id = existing.id.clone();
            target.start_time = existing.start_time;
            target.opening_fuel = Some(existing.opening_fuel);
            target.fuel_filled += existing.fuel_filled_liters;
        }

        vec![Effect::Activity(
            ActivityLogEntry::new(
                self.plate.clone(),
                ActivityKind::SessionAdopted,
                self.last_message_time.unwrap_or(existing.start_time),
            )
            .with_detail(format!("{from} -> {}", existing.id)),
        )]
    }

    pub fn snapshot(&self) -> VehicleStateView {
        let tracked = self
            .session
            .as_ref()
            .or(self.pending_close.as_ref().map(|p| &p.session));
        VehicleStateView {
            plate: self.plate.clone(),
            engine: if self.session.is_some() {
                EngineAxis::Active
            } else {
                EngineAxis::Idle
            },
            session_id: tracked.map(|s| s.id.clone()),
            session_start: tracked.map(|s| s.start_time),
            awaiting_closing_fuel: self.pending_close.is_some(),
            open_fill: self.fill.open_fill(),
            lowest_fuel: self.fill.lowest(),
            last_fuel: self.last_fuel,
            last_message_time: self.last_message_time,
        }
    }

    fn engine_on(&mut self, msg: &TelemetryMessage, effects: &mut Vec<Effect>) {
        if let Some(session) = &self.session {
            debug!(plate = %self.plate, session = %session.id, "engine on while already active");
            return;
        }
        let session = ActiveSession {
            id: SessionId::derive(&self.plate, msg.device_time),
            start_time: msg.device_time,
            opening_fuel: msg.fuel_volume_liters,
            fuel_filled: 0.0,
        };
        effects.push(self.activity(
            ActivityKind::EngineOn,
            msg.device_time,
            Some(msg.raw_status.clone()),
        ));
        if let Some(opening) = session.opening_fuel {
            self.absorb_open_fill(opening);
            effects.push(self.open_effect(&session, opening));
            effects.push(self.activity(ActivityKind::SessionOpened, msg.device_time, None));
        }
        self.session = Some(session);
    }

    fn engine_off(&mut self, msg: &TelemetryMessage, effects: &mut Vec<Effect>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        effects.push(self.activity(
            ActivityKind::EngineOff,
            msg.device_time,
            Some(msg.raw_status.clone()),
        ));
        if session.opening_fuel.is_none() {
            let opening = msg
                .fuel_volume_liters
                .or(self.last_fuel)
                .unwrap_or_default();
            session.opening_fuel = Some(opening);
            self.absorb_open_fill(opening);
            effects.push(self.open_effect(&session, opening));
            effects.push(self.activity(ActivityKind::SessionOpened, session.start_time, None));
        }
        match msg.fuel_volume_liters {
            Some(closing) => self.close(session, msg.device_time, closing, effects),
            None => {
                self.pending_close = Some(PendingClose {
                    session,
                    end_time: msg.device_time,
                });
            }
        }
    }

    fn resolve_pending_close(&mut self, msg: &TelemetryMessage, effects: &mut Vec<Effect>) {
        let Some(pending) = self.pending_close.take() else {
            return;
        };
        let within_grace =
            msg.device_time - pending.end_time <= self.policy.session.closing_grace();
        match msg.fuel_volume_liters {
            Some(closing) if within_grace => {
                self.close(pending.session, pending.end_time, closing, effects);
            }
            _ if !within_grace || msg.status == StatusToken::EngineOn => {
                let closing = self.fallback_closing(&pending.session);
                self.close(pending.session, pending.end_time, closing, effects);
            }
            _ => self.pending_close = Some(pending),
        }
    }

    fn resolve_pending_opening(&mut self, msg: &TelemetryMessage, effects: &mut Vec<Effect>) {
        let grace = self.policy.session.opening_grace();
        let last_fuel = self.last_fuel;
        let Some(session) = &mut self.session else {
            return;
        };
        if session.opening_fuel.is_some() {
            return;
        }
        let opening = match msg.fuel_volume_liters {
            Some(fuel) => fuel,
            None if msg.device_time - session.start_time > grace => last_fuel.unwrap_or_default(),
            None => return,
        };
        session.opening_fuel = Some(opening);
        let session = session.clone();
        self.absorb_open_fill(opening);
        effects.push(self.open_effect(&session, opening));
        effects.push(self.activity(ActivityKind::SessionOpened, session.start_time, None));
    }

    fn apply_fill_transition(&mut self, transition: FillTransition, effects: &mut Vec<Effect>) {
        match transition {
            FillTransition::Started {
                method,
                at,
                fuel_before,
            } => {
                effects.push(self.activity(
                    ActivityKind::FillStarted,
                    at,
                    Some(format!("{method} from {fuel_before:.1} L")),
                ));
            }
            FillTransition::Completed(fill) => {
                let credit = (fill.fill_amount - self.fill_credit).max(0.0);
                self.fill_credit = 0.0;
                if let Some(session) = &mut self.session {
                    session.fuel_filled += credit;
                    if session.opening_fuel.is_some() {
                        effects.push(Effect::UpdateSession {
                            id: session.id.clone(),
                            patch: SessionPatch {
                                fuel_filled_liters: Some(session.fuel_filled),
                                ..SessionPatch::default()
                            },
                        });
                    }
                } else if let Some(pending) = &mut self.pending_close {
                    pending.session.fuel_filled += credit;
                }
                effects.push(self.activity(
                    ActivityKind::FillCompleted,
                    fill.fill_end_time,
                    Some(format!(
                        "{} {:.1} L ({:.1} -> {:.1})",
                        fill.detection_method, fill.fill_amount, fill.fuel_before, fill.fuel_after
                    )),
                ));
                effects.push(Effect::RecordFill(fill));
            }
            FillTransition::Discarded { method, at, amount } => {
                self.fill_credit = 0.0;
                effects.push(self.activity(
                    ActivityKind::FillDiscarded,
                    at,
                    Some(format!("{method} {amount:.1} L below noise threshold")),
                ));
            }
        }
    }

    fn close(
        &mut self,
        session: ActiveSession,
        end_time: DateTime<Utc>,
        closing_fuel: f64,
        effects: &mut Vec<Effect>,
    ) {
        // A fill still open at close counts towards this session now; only
        // the remainder is credited when it completes.
        let provisional = self.fill.provisional_amount().unwrap_or_default();
        let extra = (provisional - self.fill_credit).max(0.0);
        self.fill_credit += extra;

        let close = SessionClose::compute(
            session.id,
            self.plate.clone(),
            session.start_time,
            end_time,
            session.opening_fuel.unwrap_or(closing_fuel),
            closing_fuel,
            session.fuel_filled + extra,
            &self.policy.session,
        );
        effects.push(self.activity(
            ActivityKind::SessionClosed,
            end_time,
            Some(format!(
                "used {:.1} L, filled {:.1} L over {:.3} h",
                close.fuel_used_liters, close.fuel_filled_liters, close.operating_hours
            )),
        ));
        effects.push(Effect::CloseSession(close));
    }

    /// Fuel an open fill added before the session started is already part of
    /// the opening reading and must not be credited again.
    fn absorb_open_fill(&mut self, opening: f64) {
        if let Some(open) = self.fill.open_fill() {
            let before_start = (opening - open.fuel_before).max(0.0);
            self.fill_credit = self.fill_credit.max(before_start);
        }
    }

    fn fallback_closing(&self, session: &ActiveSession) -> f64 {
        self.last_fuel
            .or(session.opening_fuel)
            .unwrap_or_default()
    }

    fn open_effect(&self, session: &ActiveSession, opening: f64) -> Effect {
        let assignment = self.directory.assign(&self.plate, &self.policy.session);
        let mut row = OperatingSession::open(
            session.id.clone(),
            self.plate.clone(),
            session.start_time,
            opening,
            assignment,
        );
        row.fuel_filled_liters = session.fuel_filled;
        Effect::OpenSession(row)
    }

    fn activity(&self, kind: ActivityKind, at: DateTime<Utc>, detail: Option<String>) -> Effect {
        let entry = ActivityLogEntry::new(self.plate.clone(), kind, at);
        Effect::Activity(match detail {
            Some(detail) => entry.with_detail(detail),
            None => entry,
        })
    }
}

impl std::fmt::Debug for VehicleStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VehicleStateMachine")
            .field("plate", &self.plate)
            .field("session", &self.session)
            .field("pending_close", &self.pending_close)
            .field("fill", &self.fill)
            .finish_non_exhaustive()
    }
}

/// Status a session row is expected to have when `effect` is written.
pub const fn expected_status(effect: &Effect) -> Option<SessionStatus> {
    match effect {
        Effect::UpdateSession { .. } | Effect::CloseSession(_) => Some(SessionStatus::Ongoing),
        Effect::OpenSession(_) | Effect::RecordFill(_) | Effect::Activity(_) => None,
    }
}
