//! Activity command for reading the audit trail.

use std::io::Write;

use anyhow::Result;
use fw_db::Database;

use super::sessions::format_time;
use super::util::parse_plate;

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    plate: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let plate = parse_plate(plate)?;
    let entries = db.list_activity(plate.as_ref(), limit)?;

    if json {
        serde_json::to_writer_pretty(&mut *writer, &entries)?;
        writeln!(writer)?;
        return Ok(());
    }

    if entries.is_empty() {
        writeln!(writer, "No activity recorded.")?;
        return Ok(());
    }

    for entry in &entries {
        let time = format_time(entry.timestamp);
        let plate = entry.plate.as_str();
        let kind = entry.kind.as_str();
        match &entry.detail {
            Some(detail) => writeln!(writer, "{time} {plate:<10} {kind:<24} {detail}")?,
            None => writeln!(writer, "{time} {plate:<10} {kind}")?,
        }
    }
    Ok(())
}
