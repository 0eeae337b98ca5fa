//! Persisted business records: operating sessions, fuel fills and the
//! activity audit trail.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::{SessionPolicy, duration_to_hours};
use crate::types::{DetectionMethod, FillId, Plate, SessionId, SessionStatus, ValidationError};

/// Tolerance used when checking derived fuel and hour figures.
pub const FLOAT_TOLERANCE: f64 = 1e-3;

/// An engine-on to engine-off span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingSession {
    pub id: SessionId,
    pub plate: Plate,
    pub company: String,
    pub cost_code: String,
    /// True when the plate had no reference mapping at open time.
    #[serde(default)]
    pub unmapped: bool,
    pub session_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub opening_fuel: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_fuel: Option<f64>,
    pub operating_hours: f64,
    pub fuel_used_liters: f64,
    pub fuel_filled_liters: f64,
    pub cost: f64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl OperatingSession {
    /// Builds a new ONGOING session.
    pub fn open(
        id: SessionId,
        plate: Plate,
        start_time: DateTime<Utc>,
        opening_fuel: f64,
        assignment: CostAssignment,
    ) -> Self {
        Self {
            id,
            plate,
            company: assignment.company,
            cost_code: assignment.cost_code,
            unmapped: assignment.unmapped,
            session_date: start_time.date_naive(),
            start_time,
            end_time: None,
            opening_fuel,
            closing_fuel: None,
            operating_hours: 0.0,
            fuel_used_liters: 0.0,
            fuel_filled_liters: 0.0,
            cost: 0.0,
            status: SessionStatus::Ongoing,
            notes: None,
        }
    }

    /// Elapsed span in hours, if the session has ended.
    pub fn span_hours(&self) -> Option<f64> {
        self.end_time
            .map(|end| duration_to_hours(end - self.start_time))
    }

    /// Checks the record-level invariants every stored session must hold.
    pub fn check_invariants(&self) -> Result<(), String> {
        match (self.status, self.end_time) {
            (SessionStatus::Ongoing, Some(_)) => {
                return Err(format!("{}: ONGOING session has an end_time", self.id));
            }
            (SessionStatus::Completed | SessionStatus::FuelFillCompleted, None) => {
                return Err(format!("{}: closed session has no end_time", self.id));
            }
            _ => {}
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(format!("{}: end_time precedes start_time", self.id));
            }
        }
        if self.fuel_used_liters < 0.0 {
            return Err(format!("{}: negative fuel_used_liters", self.id));
        }
        if let Some(span) = self.span_hours() {
            if (span - self.operating_hours).abs() > FLOAT_TOLERANCE {
                return Err(format!(
                    "{}: operating_hours {} does not match span {span}",
                    self.id, self.operating_hours
                ));
            }
        }
        Ok(())
    }
}

/// Partial update applied to a stored session.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub opening_fuel: Option<f64>,
    pub closing_fuel: Option<f64>,
    pub operating_hours: Option<f64>,
    pub fuel_used_liters: Option<f64>,
    pub fuel_filled_liters: Option<f64>,
    pub cost: Option<f64>,
    pub status: Option<SessionStatus>,
    pub notes: Option<String>,
}

impl SessionPatch {
    /// Applies this patch to an in-memory session.
    pub fn apply_to(&self, session: &mut OperatingSession) {
        if let Some(start_time) = self.start_time {
            session.start_time = start_time;
            session.session_date = start_time.date_naive();
        }
        if let Some(end_time) = self.end_time {
            session.end_time = Some(end_time);
        }
        if let Some(opening) = self.opening_fuel {
            session.opening_fuel = opening;
        }
        if let Some(closing) = self.closing_fuel {
            session.closing_fuel = Some(closing);
        }
        if let Some(hours) = self.operating_hours {
            session.operating_hours = hours;
        }
        if let Some(used) = self.fuel_used_liters {
            session.fuel_used_liters = used;
        }
        if let Some(filled) = self.fuel_filled_liters {
            session.fuel_filled_liters = filled;
        }
        if let Some(cost) = self.cost {
            session.cost = cost;
        }
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(notes) = &self.notes {
            session.notes = Some(notes.clone());
        }
    }
}

/// Final figures for a session closed by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub id: SessionId,
    pub plate: Plate,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub opening_fuel: f64,
    pub closing_fuel: f64,
    pub fuel_filled_liters: f64,
    pub fuel_used_liters: f64,
    pub operating_hours: f64,
    pub cost: f64,
}

impl SessionClose {
    /// Computes the close figures from raw inputs.
    ///
    /// Fills recorded during the session are added back so refuelling never
    /// shows up as negative consumption.
    #[expect(clippy::too_many_arguments, reason = "plain data constructor")]
    pub fn compute(
        id: SessionId,
        plate: Plate,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        opening_fuel: f64,
        closing_fuel: f64,
        fuel_filled_liters: f64,
        policy: &SessionPolicy,
    ) -> Self {
        let fuel_used_liters = (opening_fuel - closing_fuel + fuel_filled_liters).max(0.0);
        Self {
            id,
            plate,
            start_time,
            end_time,
            opening_fuel,
            closing_fuel,
            fuel_filled_liters,
            fuel_used_liters,
            operating_hours: duration_to_hours(end_time - start_time),
            cost: fuel_used_liters * policy.fuel_price_per_liter,
        }
    }

    /// Points this close at `existing`, the stored session that won a
    /// create race. Fills already counted on the stored row are kept.
    pub fn retarget(&mut self, existing: &OperatingSession, policy: &SessionPolicy) {
        *self = Self::compute(
            existing.id.clone(),
            self.plate.clone(),
            existing.start_time,
            self.end_time.max(existing.start_time),
            existing.opening_fuel,
            self.closing_fuel,
            self.fuel_filled_liters + existing.fuel_filled_liters,
            policy,
        );
    }

    /// The finalize patch for this close.
    pub fn patch(&self) -> SessionPatch {
        SessionPatch {
            end_time: Some(self.end_time),
            closing_fuel: Some(self.closing_fuel),
            operating_hours: Some(self.operating_hours),
            fuel_used_liters: Some(self.fuel_used_liters),
            fuel_filled_liters: Some(self.fuel_filled_liters),
            cost: Some(self.cost),
            status: Some(SessionStatus::Completed),
            ..SessionPatch::default()
        }
    }
}

/// A detected refuel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuelFillEvent {
    pub id: FillId,
    pub plate: Plate,
    pub fill_start_time: DateTime<Utc>,
    pub fill_end_time: DateTime<Utc>,
    pub fuel_before: f64,
    pub fuel_after: f64,
    pub fill_amount: f64,
    pub detection_method: DetectionMethod,
}

impl FuelFillEvent {
    /// Builds a fill event with a derived ID and amount.
    pub fn new(
        plate: Plate,
        fill_start_time: DateTime<Utc>,
        fill_end_time: DateTime<Utc>,
        fuel_before: f64,
        fuel_after: f64,
        detection_method: DetectionMethod,
    ) -> Self {
        Self {
            id: FillId::derive(&plate, fill_start_time),
            plate,
            fill_start_time,
            fill_end_time,
            fuel_before,
            fuel_after,
            fill_amount: fuel_after - fuel_before,
            detection_method,
        }
    }
}

/// Kinds of audit-trail entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    EngineOn,
    EngineOff,
    SessionOpened,
    SessionClosed,
    SessionAdopted,
    FillStarted,
    FillCompleted,
    FillDiscarded,
    RepairDuplicateOngoing,
    RepairForceClosed,
    RepairRecomputed,
    RepairConvertedToFill,
    RepairDeletedNoise,
    RepairMerged,
}

impl ActivityKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EngineOn => "engine_on",
            Self::EngineOff => "engine_off",
            Self::SessionOpened => "session_opened",
            Self::SessionClosed => "session_closed",
            Self::SessionAdopted => "session_adopted",
            Self::FillStarted => "fill_started",
            Self::FillCompleted => "fill_completed",
            Self::FillDiscarded => "fill_discarded",
            Self::RepairDuplicateOngoing => "repair_duplicate_ongoing",
            Self::RepairForceClosed => "repair_force_closed",
            Self::RepairRecomputed => "repair_recomputed",
            Self::RepairConvertedToFill => "repair_converted_to_fill",
            Self::RepairDeletedNoise => "repair_deleted_noise",
            Self::RepairMerged => "repair_merged",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "engine_on" => Self::EngineOn,
            "engine_off" => Self::EngineOff,
            "session_opened" => Self::SessionOpened,
            "session_closed" => Self::SessionClosed,
            "session_adopted" => Self::SessionAdopted,
            "fill_started" => Self::FillStarted,
            "fill_completed" => Self::FillCompleted,
            "fill_discarded" => Self::FillDiscarded,
            "repair_duplicate_ongoing" => Self::RepairDuplicateOngoing,
            "repair_force_closed" => Self::RepairForceClosed,
            "repair_recomputed" => Self::RepairRecomputed,
            "repair_converted_to_fill" => Self::RepairConvertedToFill,
            "repair_deleted_noise" => Self::RepairDeletedNoise,
            "repair_merged" => Self::RepairMerged,
            _ => {
                return Err(ValidationError::InvalidActivityKind {
                    value: s.to_string(),
                });
            }
        };
        Ok(kind)
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub plate: Plate,
    pub kind: ActivityKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActivityLogEntry {
    pub fn new(plate: Plate, kind: ActivityKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            plate,
            kind,
            timestamp,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Accounting attribution for a plate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostAssignment {
    pub cost_code: String,
    pub company: String,
    #[serde(skip)]
    pub unmapped: bool,
}

/// Plate → cost code/company reference lookup.
pub trait CostCodeDirectory: Send + Sync {
    fn lookup(&self, plate: &Plate) -> Option<CostAssignment>;

    /// Looks up a plate, falling back to the policy defaults and flagging the
    /// result as unmapped.
    fn assign(&self, plate: &Plate, policy: &SessionPolicy) -> CostAssignment {
        self.lookup(plate).unwrap_or_else(|| CostAssignment {
            cost_code: policy.default_cost_code.clone(),
            company: policy.default_company.clone(),
            unmapped: true,
        })
    }
}

/// A directory loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, CostAssignment>,
}

impl StaticDirectory {
    /// Builds a directory from raw plate keys; keys are normalized the same
    /// way plates are at ingest.
    pub fn new(entries: impl IntoIterator<Item = (String, CostAssignment)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(plate, assignment)| (plate.trim().to_uppercase(), assignment))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CostCodeDirectory for StaticDirectory {
    fn lookup(&self, plate: &Plate) -> Option<CostAssignment> {
        self.entries.get(plate.as_str()).map(|entry| CostAssignment {
            unmapped: false,
            ..entry.clone()
        })
    }
}
