//! Repair and consolidation planning.
//!
//! The planner reads persisted sessions and produces an ordered list of
//! conditional writes. It never touches storage itself: the plan is applied
//! by the store with id + expected-status preconditions so rows changed by
//! live ingestion in the meantime are skipped, not clobbered.
//!
//! Rules run in a fixed order against a working copy of each plate's rows,
//! so later rules see the effect of earlier ones. Running the planner on its
//! own output yields an empty plan.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::policy::{Policy, duration_to_hours, hours_to_duration};
use crate::session::{
    ActivityKind, FLOAT_TOLERANCE, FuelFillEvent, OperatingSession, SessionPatch,
};
use crate::types::{DetectionMethod, Plate, SessionId, SessionStatus};

/// Which rule produced an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairRule {
    DuplicateOngoing,
    ForceClose,
    Recompute,
    ConvertToFill,
    DeleteNoise,
    MergeDaily,
}

impl RepairRule {
    pub const ALL: [Self; 6] = [
        Self::DuplicateOngoing,
        Self::ForceClose,
        Self::Recompute,
        Self::ConvertToFill,
        Self::DeleteNoise,
        Self::MergeDaily,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateOngoing => "duplicate_ongoing",
            Self::ForceClose => "force_close",
            Self::Recompute => "recompute",
            Self::ConvertToFill => "convert_to_fill",
            Self::DeleteNoise => "delete_noise",
            Self::MergeDaily => "merge_daily",
        }
    }

    /// Audit-trail kind written when an action of this rule is applied.
    pub const fn activity_kind(&self) -> ActivityKind {
        match self {
            Self::DuplicateOngoing => ActivityKind::RepairDuplicateOngoing,
            Self::ForceClose => ActivityKind::RepairForceClosed,
            Self::Recompute => ActivityKind::RepairRecomputed,
            Self::ConvertToFill => ActivityKind::RepairConvertedToFill,
            Self::DeleteNoise => ActivityKind::RepairDeletedNoise,
            Self::MergeDaily => ActivityKind::RepairMerged,
        }
    }
}

impl fmt::Display for RepairRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single conditional write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RepairOp {
    Update {
        id: SessionId,
        expected: SessionStatus,
        patch: SessionPatch,
    },
    ConvertToFill {
        id: SessionId,
        expected: SessionStatus,
        patch: SessionPatch,
        fill: FuelFillEvent,
    },
    Delete {
        id: SessionId,
        expected: SessionStatus,
    },
    Merge {
        keep: SessionId,
        expected: SessionStatus,
        patch: SessionPatch,
        absorbed: Vec<SessionId>,
    },
}

impl RepairOp {
    /// The row the op is conditioned on.
    pub const fn target(&self) -> &SessionId {
        match self {
            Self::Update { id, .. } | Self::ConvertToFill { id, .. } | Self::Delete { id, .. } => {
                id
            }
            Self::Merge { keep, .. } => keep,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairAction {
    pub rule: RepairRule,
    pub plate: Plate,
    pub op: RepairOp,
    pub reason: String,
}

/// Something the planner noticed that points at an upstream problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairAnomaly {
    pub plate: Plate,
    pub session_id: SessionId,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairPlan {
    pub generated_at: Option<DateTime<Utc>>,
    pub sessions_examined: usize,
    pub actions: Vec<RepairAction>,
    pub anomalies: Vec<RepairAnomaly>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of actions per rule, in rule order.
    pub fn counts(&self) -> BTreeMap<RepairRule, usize> {
        let mut counts = BTreeMap::new();
        for action in &self.actions {
            *counts.entry(action.rule).or_insert(0) += 1;
        }
        counts
    }
}

/// Plans repairs for all given sessions at `now`.
pub fn plan_repairs(sessions: &[OperatingSession], policy: &Policy, now: DateTime<Utc>) -> RepairPlan {
    let mut by_plate: BTreeMap<&Plate, Vec<OperatingSession>> = BTreeMap::new();
    for session in sessions {
        by_plate
            .entry(&session.plate)
            .or_default()
            .push(session.clone());
    }

    let per_plate: Vec<PlatePlan> = by_plate
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(plate, rows)| PlatePlan::build(plate.clone(), rows, policy, now))
        .collect();

    let mut plan = RepairPlan {
        generated_at: Some(now),
        sessions_examined: sessions.len(),
        ..RepairPlan::default()
    };
    for plate_plan in per_plate {
        plan.actions.extend(plate_plan.actions);
        plan.anomalies.extend(plate_plan.anomalies);
    }
    tracing::debug!(
        sessions = plan.sessions_examined,
        actions = plan.actions.len(),
        anomalies = plan.anomalies.len(),
        "repair plan built"
    );
    plan
}

struct PlatePlan<'a> {
    plate: Plate,
    policy: &'a Policy,
    rows: Vec<OperatingSession>,
    actions: Vec<RepairAction>,
    anomalies: Vec<RepairAnomaly>,
}

impl<'a> PlatePlan<'a> {
    fn build(
        plate: Plate,
        mut rows: Vec<OperatingSession>,
        policy: &'a Policy,
        now: DateTime<Utc>,
    ) -> Self {
        rows.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        let mut plan = Self {
            plate,
            policy,
            rows,
            actions: Vec::new(),
            anomalies: Vec::new(),
        };
        plan.close_duplicate_ongoing();
        plan.force_close_stuck(now);
        plan.recompute_usage();
        plan.delete_noise();
        plan.merge_busy_days();
        plan
    }

    fn close_duplicate_ongoing(&mut self) {
        let ongoing: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SessionStatus::Ongoing)
            .map(|(i, _)| i)
            .collect();
        let Some((&keep, later)) = ongoing.split_first() else {
            return;
        };
        let keep_id = self.rows[keep].id.clone();

        for &index in later {
            let row = &self.rows[index];
            let note = format!("duplicate ONGOING session closed; {keep_id} kept");
            let patch = SessionPatch {
                end_time: Some(row.start_time),
                closing_fuel: Some(row.opening_fuel),
                operating_hours: Some(0.0),
                fuel_used_liters: Some(0.0),
                fuel_filled_liters: Some(0.0),
                cost: Some(0.0),
                status: Some(SessionStatus::Completed),
                notes: Some(note.clone()),
                ..SessionPatch::default()
            };
            self.anomalies.push(RepairAnomaly {
                plate: self.plate.clone(),
                session_id: row.id.clone(),
                description: format!("second ONGOING session alongside {keep_id}"),
            });
            self.update(index, RepairRule::DuplicateOngoing, patch, note);
        }
    }

    fn force_close_stuck(&mut self, now: DateTime<Utc>) {
        let policy = self.policy;
        let repair = &policy.repair;
        let price = policy.session.fuel_price_per_liter;
        let max_ongoing = hours_to_duration(repair.max_ongoing_hours);

        for index in 0..self.rows.len() {
            let row = &self.rows[index];
            if row.status != SessionStatus::Ongoing || now - row.start_time <= max_ongoing {
                continue;
            }
            let elapsed_hours = duration_to_hours(now - row.start_time);
            let end_time = row.start_time
                + hours_to_duration(repair.stuck_estimate_hours.min(elapsed_hours));
            let hours = duration_to_hours(end_time - row.start_time);

            let available = row.opening_fuel + row.fuel_filled_liters;
            let used = (hours * repair.default_consumption_lph).min(available);
            let note = format!(
                "force-closed after {elapsed_hours:.1} h ONGOING; estimated {hours:.1} h at {:.1} L/h",
                repair.default_consumption_lph
            );
            let patch = SessionPatch {
                end_time: Some(end_time),
                closing_fuel: Some(available - used),
                operating_hours: Some(hours),
                fuel_used_liters: Some(used),
                cost: Some(used * price),
                status: Some(SessionStatus::Completed),
                notes: Some(note.clone()),
                ..SessionPatch::default()
            };
            self.update(index, RepairRule::ForceClose, patch, note);
        }
    }

    fn recompute_usage(&mut self) {
        let noise = self.policy.fill.noise_threshold_liters;
        let price = self.policy.session.fuel_price_per_liter;

        for index in 0..self.rows.len() {
            let row = &self.rows[index];
            if row.status != SessionStatus::Completed {
                continue;
            }
            let (Some(closing), Some(end_time)) = (row.closing_fuel, row.end_time) else {
                continue;
            };
            let span = duration_to_hours(end_time - row.start_time);
            let excess = closing - (row.opening_fuel + row.fuel_filled_liters);

            if excess > noise {
                let fill = FuelFillEvent::new(
                    self.plate.clone(),
                    row.start_time,
                    end_time,
                    row.opening_fuel + row.fuel_filled_liters,
                    closing,
                    DetectionMethod::PassiveLevelIncrease,
                );
                let note = format!("closing exceeds opening by {excess:.1} L; recorded as fuel fill");
                let patch = SessionPatch {
                    operating_hours: Some(span),
                    fuel_used_liters: Some(0.0),
                    fuel_filled_liters: Some(row.fuel_filled_liters + excess),
                    cost: Some(0.0),
                    status: Some(SessionStatus::FuelFillCompleted),
                    notes: Some(note.clone()),
                    ..SessionPatch::default()
                };
                let id = row.id.clone();
                patch.apply_to(&mut self.rows[index]);
                self.actions.push(RepairAction {
                    rule: RepairRule::ConvertToFill,
                    plate: self.plate.clone(),
                    op: RepairOp::ConvertToFill {
                        id,
                        expected: SessionStatus::Completed,
                        patch,
                        fill,
                    },
                    reason: note,
                });
                continue;
            }

            let used = (row.opening_fuel - closing + row.fuel_filled_liters).max(0.0);
            let used_changed = (used - row.fuel_used_liters).abs() > FLOAT_TOLERANCE;
            let hours_changed = (span - row.operating_hours).abs() > FLOAT_TOLERANCE;
            if !used_changed && !hours_changed {
                continue;
            }
            let reason = format!(
                "recomputed usage {:.1} -> {used:.1} L, hours {:.3} -> {span:.3}",
                row.fuel_used_liters, row.operating_hours
            );
            let patch = SessionPatch {
                operating_hours: hours_changed.then_some(span),
                fuel_used_liters: used_changed.then_some(used),
                cost: used_changed.then_some(used * price),
                ..SessionPatch::default()
            };
            self.update(index, RepairRule::Recompute, patch, reason);
        }
    }

    fn delete_noise(&mut self) {
        let min_session = self.policy.repair.min_session();
        let mut kept = Vec::with_capacity(self.rows.len());

        for row in std::mem::take(&mut self.rows) {
            let short = row
                .end_time
                .is_some_and(|end| end - row.start_time < min_session);
            if row.status == SessionStatus::Completed && short {
                self.actions.push(RepairAction {
                    rule: RepairRule::DeleteNoise,
                    plate: self.plate.clone(),
                    reason: format!(
                        "{:.0} s is below the {} s minimum",
                        row.operating_hours * 3600.0,
                        self.policy.repair.min_session_secs
                    ),
                    op: RepairOp::Delete {
                        id: row.id,
                        expected: SessionStatus::Completed,
                    },
                });
            } else {
                kept.push(row);
            }
        }
        self.rows = kept;
    }

    fn merge_busy_days(&mut self) {
        let policy = self.policy;
        let repair = &policy.repair;
        let mut by_day: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
        for (index, row) in self.rows.iter().enumerate() {
            if row.status == SessionStatus::Completed {
                by_day.entry(row.session_date).or_default().push(index);
            }
        }

        let mut absorbed_rows = Vec::new();
        for (day, indices) in by_day {
            if indices.len() <= repair.max_sessions_per_day {
                continue;
            }
            let (&keep, rest) = match indices.split_first() {
                Some(split) => split,
                None => continue,
            };
            let group: Vec<&OperatingSession> = indices.iter().map(|&i| &self.rows[i]).collect();
            let summed_hours: f64 = group.iter().map(|s| s.operating_hours).sum();
            let hours = summed_hours.min(repair.daily_max_hours);
            let filled: f64 = group.iter().map(|s| s.fuel_filled_liters).sum();
            let mut used: f64 = group.iter().map(|s| s.fuel_used_liters).sum();
            let mut cost: f64 = group.iter().map(|s| s.cost).sum();

            let first = &self.rows[keep];
            let available = first.opening_fuel + filled;
            if used > available {
                used = available;
                cost = used * policy.session.fuel_price_per_liter;
            }
            let end_time = first.start_time + hours_to_duration(hours);
            let hours = duration_to_hours(end_time - first.start_time);
            let note = format!(
                "merged {} sessions on {day}; {summed_hours:.2} h summed, {hours:.2} h kept",
                indices.len()
            );
            let patch = SessionPatch {
                end_time: Some(end_time),
                closing_fuel: Some(available - used),
                operating_hours: Some(hours),
                fuel_used_liters: Some(used),
                fuel_filled_liters: Some(filled),
                cost: Some(cost),
                notes: Some(note.clone()),
                ..SessionPatch::default()
            };
            let absorbed: Vec<SessionId> = rest.iter().map(|&i| self.rows[i].id.clone()).collect();
            let keep_id = first.id.clone();

            patch.apply_to(&mut self.rows[keep]);
            absorbed_rows.extend(rest.iter().copied());
            self.actions.push(RepairAction {
                rule: RepairRule::MergeDaily,
                plate: self.plate.clone(),
                op: RepairOp::Merge {
                    keep: keep_id,
                    expected: SessionStatus::Completed,
                    patch,
                    absorbed,
                },
                reason: note,
            });
        }

        absorbed_rows.sort_unstable();
        for index in absorbed_rows.into_iter().rev() {
            self.rows.remove(index);
        }
    }

    fn update(&mut self, index: usize, rule: RepairRule, patch: SessionPatch, reason: String) {
        let row = &mut self.rows[index];
        let expected = row.status;
        let id = row.id.clone();
        patch.apply_to(row);
        self.actions.push(RepairAction {
            rule,
            plate: self.plate.clone(),
            op: RepairOp::Update {
                id,
                expected,
                patch,
            },
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CostAssignment;
    use chrono::{Duration, TimeZone};

    fn day_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()
    }

    fn plate() -> Plate {
        Plate::new("X").unwrap()
    }

    fn completed(start: DateTime<Utc>, secs: i64, opening: f64, closing: f64) -> OperatingSession {
        let mut session = OperatingSession::open(
            SessionId::derive(&plate(), start),
            plate(),
            start,
            opening,
            CostAssignment {
                cost_code: "CC".into(),
                company: "Co".into(),
                unmapped: false,
            },
        );
        let end = start + Duration::seconds(secs);
        session.end_time = Some(end);
        session.closing_fuel = Some(closing);
        session.operating_hours = duration_to_hours(end - start);
        session.fuel_used_liters = (opening - closing).max(0.0);
        session.status = SessionStatus::Completed;
        session
    }

    fn ongoing(start: DateTime<Utc>, opening: f64) -> OperatingSession {
        OperatingSession::open(
            SessionId::derive(&plate(), start),
            plate(),
            start,
            opening,
            CostAssignment {
                cost_code: "CC".into(),
                company: "Co".into(),
                unmapped: false,
            },
        )
    }

    /// Applies a plan to an in-memory copy the way the store does.
    fn apply(sessions: &[OperatingSession], plan: &RepairPlan) -> Vec<OperatingSession> {
        let mut rows: Vec<OperatingSession> = sessions.to_vec();
        for action in &plan.actions {
            match &action.op {
                RepairOp::Update { id, patch, .. } | RepairOp::ConvertToFill { id, patch, .. } => {
                    let row = rows.iter_mut().find(|r| &r.id == id).unwrap();
                    patch.apply_to(row);
                }
                RepairOp::Delete { id, .. } => rows.retain(|r| &r.id != id),
                RepairOp::Merge {
                    keep,
                    patch,
                    absorbed,
                    ..
                } => {
                    let row = rows.iter_mut().find(|r| &r.id == keep).unwrap();
                    patch.apply_to(row);
                    rows.retain(|r| !absorbed.contains(&r.id));
                }
            }
        }
        rows
    }

    fn assert_idempotent(sessions: &[OperatingSession], now: DateTime<Utc>) -> Vec<OperatingSession> {
        let policy = Policy::default();
        let first = plan_repairs(sessions, &policy, now);
        let repaired = apply(sessions, &first);
        let second = plan_repairs(&repaired, &policy, now);
        assert!(second.is_empty(), "second pass not empty: {:?}", second.actions);
        for row in &repaired {
            row.check_invariants().unwrap();
        }
        repaired
    }

    #[test]
    fn short_sessions_are_deleted() {
        let sessions = vec![
            completed(day_start(), 180, 100.0, 99.0),
            completed(day_start() + Duration::hours(2), 288, 99.0, 98.0),
        ];
        let plan = plan_repairs(&sessions, &Policy::default(), day_start() + Duration::days(1));
        assert_eq!(plan.counts().get(&RepairRule::DeleteNoise), Some(&2));
        assert!(assert_idempotent(&sessions, day_start() + Duration::days(1)).is_empty());
    }

    #[test]
    fn stuck_session_is_force_closed_with_estimate() {
        let start = day_start();
        let sessions = vec![ongoing(start, 300.0)];
        let now = start + Duration::hours(30);

        let plan = plan_repairs(&sessions, &Policy::default(), now);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].rule, RepairRule::ForceClose);

        let repaired = assert_idempotent(&sessions, now);
        let row = &repaired[0];
        assert_eq!(row.status, SessionStatus::Completed);
        assert_eq!(row.end_time, Some(start + Duration::hours(8)));
        assert!((row.fuel_used_liters - 80.0).abs() < 1e-6);
        assert!(row.notes.as_deref().unwrap().contains("force-closed"));
    }

    #[test]
    fn recent_ongoing_session_is_left_alone() {
        let sessions = vec![ongoing(day_start(), 300.0)];
        let plan = plan_repairs(&sessions, &Policy::default(), day_start() + Duration::hours(3));
        assert!(plan.is_empty());
    }

    #[test]
    fn negative_usage_becomes_fill() {
        let sessions = vec![completed(day_start(), 3600, 100.0, 180.0)];
        let plan = plan_repairs(&sessions, &Policy::default(), day_start() + Duration::days(1));
        let RepairOp::ConvertToFill { fill, .. } = &plan.actions[0].op else {
            panic!("expected conversion, got {:?}", plan.actions[0].op);
        };
        assert!((fill.fill_amount - 80.0).abs() < 1e-6);

        let repaired = assert_idempotent(&sessions, day_start() + Duration::days(1));
        assert_eq!(repaired[0].status, SessionStatus::FuelFillCompleted);
        assert!(repaired[0].fuel_used_liters.abs() < f64::EPSILON);
    }

    #[test]
    fn stale_usage_is_recomputed() {
        let mut session = completed(day_start(), 3600, 100.0, 60.0);
        session.fuel_used_liters = 12.0;
        let plan = plan_repairs(&[session.clone()], &Policy::default(), day_start() + Duration::days(1));
        assert_eq!(plan.actions[0].rule, RepairRule::Recompute);

        let repaired = assert_idempotent(&[session], day_start() + Duration::days(1));
        assert!((repaired[0].fuel_used_liters - 40.0).abs() < 1e-6);
    }

    #[test]
    fn busy_day_is_merged_into_earliest() {
        let sessions: Vec<OperatingSession> = (0..4)
            .map(|i| {
                let opening = 400.0 - f64::from(i) * 20.0;
                completed(day_start() + Duration::hours(i64::from(i) * 3), 3600, opening, opening - 10.0)
            })
            .collect();
        let plan = plan_repairs(&sessions, &Policy::default(), day_start() + Duration::days(1));
        assert_eq!(plan.actions.len(), 1);
        let RepairOp::Merge { keep, absorbed, .. } = &plan.actions[0].op else {
            panic!("expected merge");
        };
        assert_eq!(keep, &sessions[0].id);
        assert_eq!(absorbed.len(), 3);

        let repaired = assert_idempotent(&sessions, day_start() + Duration::days(1));
        assert_eq!(repaired.len(), 1);
        assert!((repaired[0].operating_hours - 4.0).abs() < 1e-6);
        assert!((repaired[0].fuel_used_liters - 40.0).abs() < 1e-6);
        assert_eq!(repaired[0].closing_fuel, Some(360.0));
    }

    #[test]
    fn merged_hours_are_capped() {
        let policy = Policy {
            repair: crate::policy::RepairPolicy {
                max_sessions_per_day: 1,
                daily_max_hours: 5.0,
                ..crate::policy::RepairPolicy::default()
            },
            ..Policy::default()
        };
        let sessions = vec![
            completed(day_start(), 4 * 3600, 500.0, 460.0),
            completed(day_start() + Duration::hours(5), 4 * 3600, 460.0, 420.0),
        ];
        let plan = plan_repairs(&sessions, &policy, day_start() + Duration::days(1));
        let RepairOp::Merge { patch, .. } = &plan.actions[0].op else {
            panic!("expected merge");
        };
        assert_eq!(patch.operating_hours, Some(5.0));
        assert_eq!(patch.end_time, Some(day_start() + Duration::hours(5)));
    }

    #[test]
    fn duplicate_ongoing_keeps_earliest() {
        let now = day_start() + Duration::hours(2);
        let sessions = vec![
            ongoing(day_start() + Duration::minutes(30), 200.0),
            ongoing(day_start(), 210.0),
        ];
        let plan = plan_repairs(&sessions, &Policy::default(), now);
        assert_eq!(plan.anomalies.len(), 1);
        assert_eq!(plan.anomalies[0].session_id, sessions[0].id);

        let repaired = assert_idempotent(&sessions, now);
        let still_ongoing: Vec<_> = repaired
            .iter()
            .filter(|s| s.status == SessionStatus::Ongoing)
            .collect();
        assert_eq!(still_ongoing.len(), 1);
        assert_eq!(still_ongoing[0].id, sessions[1].id);
    }

    #[test]
    fn plates_are_planned_independently() {
        let other = Plate::new("Y").unwrap();
        let mut foreign = ongoing(day_start(), 100.0);
        foreign.plate = other.clone();
        foreign.id = SessionId::derive(&other, day_start());
        let sessions = vec![ongoing(day_start(), 100.0), foreign];
        let plan = plan_repairs(&sessions, &Policy::default(), day_start() + Duration::hours(1));
        assert!(plan.anomalies.is_empty());
        assert_eq!(plan.sessions_examined, 2);
    }
}
