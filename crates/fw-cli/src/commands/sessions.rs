//! Sessions command for listing operating sessions.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use fw_core::{OperatingSession, SessionStatus};
use fw_db::{Database, SessionFilter};

use super::util::{parse_plate, parse_since};

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    plate: Option<&str>,
    status: Option<&str>,
    since: Option<&str>,
    json: bool,
) -> Result<()> {
    let filter = SessionFilter {
        plate: parse_plate(plate)?,
        status: status
            .map(|s| s.trim().to_uppercase().parse::<SessionStatus>())
            .transpose()
            .context("invalid --status")?,
        from: since.map(parse_since).transpose()?,
        to: None,
    };
    let sessions = db.list_sessions(&filter)?;

    if json {
        serde_json::to_writer_pretty(&mut *writer, &sessions)?;
        writeln!(writer)?;
        return Ok(());
    }

    if sessions.is_empty() {
        writeln!(writer, "No sessions found.")?;
        return Ok(());
    }

    for session in &sessions {
        write_session(writer, session)?;
    }
    let used: f64 = sessions.iter().map(|s| s.fuel_used_liters).sum();
    let hours: f64 = sessions.iter().map(|s| s.operating_hours).sum();
    writeln!(
        writer,
        "{} sessions, {hours:.2} h, {used:.1} L used",
        sessions.len()
    )?;
    Ok(())
}

fn write_session<W: Write>(writer: &mut W, session: &OperatingSession) -> Result<()> {
    let end = session
        .end_time
        .map_or_else(|| "-".to_string(), format_time);
    let closing = session
        .closing_fuel
        .map_or_else(|| "-".to_string(), |fuel| format!("{fuel:.1}"));
    writeln!(
        writer,
        "{plate:<10} {start} -> {end}  {status:<19} {hours:>6.2} h  {opening:.1} -> {closing} L  used {used:.1} L  filled {filled:.1} L  {code}{unmapped}",
        plate = session.plate.as_str(),
        start = format_time(session.start_time),
        status = session.status.as_str(),
        hours = session.operating_hours,
        opening = session.opening_fuel,
        used = session.fuel_used_liters,
        filled = session.fuel_filled_liters,
        code = session.cost_code,
        unmapped = if session.unmapped { " (unmapped)" } else { "" },
    )?;
    if let Some(notes) = &session.notes {
        writeln!(writer, "           note: {notes}")?;
    }
    Ok(())
}

pub(crate) fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone};
    use fw_core::{CostAssignment, Plate, SessionId, SessionPatch};
    use insta::assert_snapshot;

    fn seed(db: &mut Database) {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        let plate = Plate::new("GEN-01").unwrap();
        let session = OperatingSession::open(
            SessionId::derive(&plate, t0),
            plate,
            t0,
            500.0,
            CostAssignment {
                cost_code: "CC-1".into(),
                company: "Acme".into(),
                unmapped: false,
            },
        );
        db.create_session(&session).unwrap();
        db.update_session(
            &session.id,
            SessionStatus::Ongoing,
            &SessionPatch {
                end_time: Some(t0 + Duration::minutes(90)),
                closing_fuel: Some(470.0),
                operating_hours: Some(1.5),
                fuel_used_liters: Some(30.0),
                status: Some(SessionStatus::Completed),
                ..SessionPatch::default()
            },
        )
        .unwrap();

        let other = Plate::new("GEN-02").unwrap();
        let start = t0 + Duration::hours(2);
        let ongoing = OperatingSession::open(
            SessionId::derive(&other, start),
            other,
            start,
            210.0,
            CostAssignment {
                cost_code: "UNMAPPED".into(),
                company: "UNKNOWN".into(),
                unmapped: true,
            },
        );
        db.create_session(&ongoing).unwrap();
    }

    #[test]
    fn lists_sessions_with_totals() {
        let mut db = Database::open_in_memory().unwrap();
        seed(&mut db);

        let mut output = Vec::new();
        run(&mut output, &db, None, None, None, false).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        GEN-01     2025-03-01T06:00:00Z -> 2025-03-01T07:30:00Z  COMPLETED             1.50 h  500.0 -> 470.0 L  used 30.0 L  filled 0.0 L  CC-1
        GEN-02     2025-03-01T08:00:00Z -> -  ONGOING               0.00 h  210.0 -> - L  used 0.0 L  filled 0.0 L  UNMAPPED (unmapped)
        2 sessions, 1.50 h, 30.0 L used
        ");
    }

    #[test]
    fn filters_by_status_case_insensitively() {
        let mut db = Database::open_in_memory().unwrap();
        seed(&mut db);

        let mut output = Vec::new();
        run(&mut output, &db, None, Some("ongoing"), None, true).unwrap();

        let rows: Vec<OperatingSession> = serde_json::from_slice(&output).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].plate.as_str(), "GEN-02");
    }

    #[test]
    fn since_excludes_earlier_sessions() {
        let mut db = Database::open_in_memory().unwrap();
        seed(&mut db);

        let mut output = Vec::new();
        run(&mut output, &db, Some("gen-01"), None, Some("2025-03-02"), false).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @"No sessions found.");
    }
}
