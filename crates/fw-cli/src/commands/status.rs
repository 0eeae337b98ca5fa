//! Status command for showing what the database holds.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use fw_db::Database;
use serde::Serialize;

use super::sessions::format_time;

#[derive(Serialize)]
struct StatusReport<'a> {
    database: &'a Path,
    #[serde(flatten)]
    summary: fw_db::StoreSummary,
}

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path, json: bool) -> Result<()> {
    let summary = db.summary()?;

    if json {
        let report = StatusReport {
            database: database_path,
            summary,
        };
        serde_json::to_writer_pretty(&mut *writer, &report)?;
        writeln!(writer)?;
        return Ok(());
    }

    writeln!(writer, "Fuel session status")?;
    writeln!(writer, "Database: {}", database_path.display())?;
    writeln!(writer, "Sessions:")?;
    writeln!(writer, "- ongoing: {}", summary.ongoing)?;
    writeln!(writer, "- completed: {}", summary.completed)?;
    writeln!(writer, "- fuel fill completed: {}", summary.fuel_fill_completed)?;
    writeln!(writer, "- unmapped: {}", summary.unmapped)?;
    writeln!(writer, "Fill events: {}", summary.fill_events)?;
    match summary.last_activity_at {
        Some(at) => writeln!(
            writer,
            "Activity entries: {} (last {})",
            summary.activity_entries,
            format_time(at)
        )?,
        None => writeln!(writer, "No activity recorded.")?,
    }

    Ok(())
}
