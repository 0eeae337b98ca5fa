//! Repair command for consolidating persisted sessions.
//!
//! Plans against every stored session, then applies the plan in one
//! transaction. Safe to run while ingest is live and safe to rerun: a second
//! pass over repaired data plans nothing.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fw_core::{Policy, RepairPlan, RepairRule, plan_repairs};
use fw_db::{Database, RepairReport, SessionFilter};

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    policy: &Policy,
    now: DateTime<Utc>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let sessions = db
        .list_sessions(&SessionFilter::default())
        .context("failed to load sessions")?;
    let plan = plan_repairs(&sessions, policy, now);
    tracing::debug!(
        sessions = plan.sessions_examined,
        actions = plan.actions.len(),
        "repair plan ready"
    );

    if dry_run {
        if json {
            serde_json::to_writer_pretty(&mut *writer, &plan)?;
            writeln!(writer)?;
        } else {
            write_plan(writer, &plan)?;
        }
        return Ok(());
    }

    let report = db
        .apply_repair_plan(&plan, now)
        .context("failed to apply repair plan")?;
    tracing::info!(
        applied = report.total_applied(),
        skipped = report.skipped.len(),
        "repair finished"
    );

    if json {
        serde_json::to_writer_pretty(&mut *writer, &report)?;
        writeln!(writer)?;
    } else {
        write_report(writer, &report)?;
    }
    Ok(())
}

fn write_plan<W: Write>(writer: &mut W, plan: &RepairPlan) -> Result<()> {
    writeln!(
        writer,
        "Repair plan ({} sessions examined, dry run)",
        plan.sessions_examined
    )?;
    if plan.is_empty() {
        writeln!(writer, "Nothing to repair.")?;
    }
    for action in &plan.actions {
        writeln!(
            writer,
            "- {:<16} {:<10} {}",
            action.rule.as_str(),
            action.plate.as_str(),
            action.reason
        )?;
    }
    write_anomalies(writer, plan.anomalies.iter().map(|a| (a.plate.as_str(), &a.description)))
}

fn write_report<W: Write>(writer: &mut W, report: &RepairReport) -> Result<()> {
    writeln!(
        writer,
        "Repair applied ({} sessions examined)",
        report.sessions_examined
    )?;
    for rule in RepairRule::ALL {
        let count = report.applied.get(&rule).copied().unwrap_or_default();
        writeln!(writer, "- {:<16} {count}", rule.as_str())?;
    }
    writeln!(writer, "Sessions deleted: {}", report.sessions_deleted)?;
    writeln!(writer, "Fill events created: {}", report.fills_created)?;
    if !report.skipped.is_empty() {
        writeln!(writer, "Skipped (changed since planning):")?;
        for skipped in &report.skipped {
            writeln!(
                writer,
                "- {} {}: {}",
                skipped.rule.as_str(),
                skipped.session_id,
                skipped.reason
            )?;
        }
    }
    write_anomalies(
        writer,
        report.anomalies.iter().map(|a| (a.plate.as_str(), &a.description)),
    )
}

fn write_anomalies<'a, W: Write>(
    writer: &mut W,
    anomalies: impl Iterator<Item = (&'a str, &'a String)>,
) -> Result<()> {
    let mut anomalies = anomalies.peekable();
    if anomalies.peek().is_some() {
        writeln!(writer, "Anomalies:")?;
        for (plate, description) in anomalies {
            writeln!(writer, "- {plate}: {description}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone};
    use fw_core::{
        CostAssignment, OperatingSession, Plate, SessionId, SessionPatch, SessionStatus,
    };
    use insta::assert_snapshot;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()
    }

    /// One two-minute blip and one session that never closed.
    fn seed(db: &mut Database) {
        let plate = Plate::new("GEN-01").unwrap();
        let assignment = CostAssignment {
            cost_code: "CC-1".into(),
            company: "Acme".into(),
            unmapped: false,
        };

        let blip = OperatingSession::open(
            SessionId::derive(&plate, t0()),
            plate.clone(),
            t0(),
            300.0,
            assignment.clone(),
        );
        db.create_session(&blip).unwrap();
        db.update_session(
            &blip.id,
            SessionStatus::Ongoing,
            &SessionPatch {
                end_time: Some(t0() + Duration::minutes(2)),
                closing_fuel: Some(300.0),
                operating_hours: Some(2.0 / 60.0),
                status: Some(SessionStatus::Completed),
                ..SessionPatch::default()
            },
        )
        .unwrap();

        let start = t0() + Duration::hours(1);
        let stuck = OperatingSession::open(
            SessionId::derive(&plate, start),
            plate,
            start,
            290.0,
            assignment,
        );
        db.create_session(&stuck).unwrap();
    }

    #[test]
    fn dry_run_writes_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        seed(&mut db);

        let mut output = Vec::new();
        run(
            &mut output,
            &mut db,
            &Policy::default(),
            t0() + Duration::days(3),
            true,
            false,
        )
        .unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("Repair plan (2 sessions examined, dry run)\n"));
        assert!(output.contains("- force_close"));
        assert!(output.contains("- delete_noise"));
        assert_eq!(db.summary().unwrap().ongoing, 1);
    }

    #[test]
    fn applies_plan_and_second_run_is_noop() {
        let mut db = Database::open_in_memory().unwrap();
        seed(&mut db);
        let now = t0() + Duration::days(3);

        let mut output = Vec::new();
        run(&mut output, &mut db, &Policy::default(), now, false, false).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Repair applied (2 sessions examined)
        - duplicate_ongoing 0
        - force_close      1
        - recompute        0
        - convert_to_fill  0
        - delete_noise     1
        - merge_daily      0
        Sessions deleted: 1
        Fill events created: 0
        ");

        let summary = db.summary().unwrap();
        assert_eq!(summary.ongoing, 0);
        assert_eq!(summary.completed, 1);

        let mut output = Vec::new();
        run(&mut output, &mut db, &Policy::default(), now, true, true).unwrap();
        let plan: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(plan["actions"].as_array().unwrap().len(), 0);
    }
}
