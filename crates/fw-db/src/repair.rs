//! Applying repair plans.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fw_core::{
    ActivityLogEntry, RepairAction, RepairAnomaly, RepairOp, RepairPlan, RepairRule, SessionId,
    SessionStatus,
};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::{Database, DbError, append_activity, update_conditional, upsert_fill};

/// An action whose precondition no longer held when it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRepair {
    pub rule: RepairRule,
    pub session_id: SessionId,
    pub reason: String,
}

/// Outcome of [`Database::apply_repair_plan`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    pub sessions_examined: usize,
    pub applied: BTreeMap<RepairRule, usize>,
    pub sessions_deleted: usize,
    pub fills_created: usize,
    pub skipped: Vec<SkippedRepair>,
    pub anomalies: Vec<RepairAnomaly>,
}

impl RepairReport {
    pub fn total_applied(&self) -> usize {
        self.applied.values().sum()
    }
}

impl Database {
    /// Applies a plan in one transaction.
    ///
    /// Every write is conditioned on the row still having the status the
    /// planner saw, so rows touched by live ingestion since planning are
    /// skipped and reported rather than overwritten. Each applied action is
    /// appended to the activity log.
    pub fn apply_repair_plan(
        &mut self,
        plan: &RepairPlan,
        now: DateTime<Utc>,
    ) -> Result<RepairReport, DbError> {
        let mut report = RepairReport {
            sessions_examined: plan.sessions_examined,
            anomalies: plan.anomalies.clone(),
            ..RepairReport::default()
        };

        let tx = self.conn.transaction()?;
        for action in &plan.actions {
            if apply_action(&tx, action, now, &mut report)? {
                *report.applied.entry(action.rule).or_insert(0) += 1;
                let detail = serde_json::to_string(&action.op).map_or_else(
                    |_| action.reason.clone(),
                    |op| format!("{}: {op}", action.reason),
                );
                append_activity(
                    &tx,
                    &ActivityLogEntry::new(action.plate.clone(), action.rule.activity_kind(), now)
                        .with_detail(detail),
                    now,
                )?;
            } else {
                tracing::info!(
                    rule = %action.rule,
                    session = %action.op.target(),
                    "repair skipped; session changed since planning"
                );
                report.skipped.push(SkippedRepair {
                    rule: action.rule,
                    session_id: action.op.target().clone(),
                    reason: "status changed since planning".to_string(),
                });
            }
        }
        tx.commit()?;

        tracing::info!(
            applied = report.total_applied(),
            skipped = report.skipped.len(),
            "repair plan applied"
        );
        Ok(report)
    }
}

fn apply_action(
    conn: &Connection,
    action: &RepairAction,
    now: DateTime<Utc>,
    report: &mut RepairReport,
) -> Result<bool, DbError> {
    match &action.op {
        RepairOp::Update {
            id,
            expected,
            patch,
        } => update_conditional(conn, id, *expected, patch, now),
        RepairOp::ConvertToFill {
            id,
            expected,
            patch,
            fill,
        } => {
            if !update_conditional(conn, id, *expected, patch, now)? {
                return Ok(false);
            }
            upsert_fill(conn, fill, now)?;
            report.fills_created += 1;
            Ok(true)
        }
        RepairOp::Delete { id, expected } => {
            let deleted = delete_conditional(conn, id, *expected)?;
            report.sessions_deleted += usize::from(deleted);
            Ok(deleted)
        }
        RepairOp::Merge {
            keep,
            expected,
            patch,
            absorbed,
        } => {
            if !update_conditional(conn, keep, *expected, patch, now)? {
                return Ok(false);
            }
            for id in absorbed {
                if delete_conditional(conn, id, *expected)? {
                    report.sessions_deleted += 1;
                } else {
                    report.skipped.push(SkippedRepair {
                        rule: action.rule,
                        session_id: id.clone(),
                        reason: "merge source changed since planning".to_string(),
                    });
                }
            }
            Ok(true)
        }
    }
}

fn delete_conditional(
    conn: &Connection,
    id: &SessionId,
    expected: SessionStatus,
) -> Result<bool, DbError> {
    let deleted = conn.execute(
        "DELETE FROM operating_sessions WHERE id = ? AND status = ?",
        params![id.as_str(), expected.as_str()],
    )?;
    Ok(deleted > 0)
}
