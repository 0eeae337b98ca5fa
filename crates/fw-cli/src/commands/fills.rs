//! Fills command for listing fuel fill events.
//!
//! Stored events are listed as-is by default. With `--merge-gap-mins`,
//! events for one plate that follow each other within the gap are shown as
//! a single refuel.

use std::io::Write;

use anyhow::{Result, bail};
use chrono::Duration;
use fw_core::{ReportedFill, merge_adjacent_fills};
use fw_db::Database;

use super::sessions::format_time;
use super::util::{parse_plate, parse_since};

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    plate: Option<&str>,
    since: Option<&str>,
    merge_gap_mins: i64,
    json: bool,
) -> Result<()> {
    if merge_gap_mins < 0 {
        bail!("--merge-gap-mins must not be negative");
    }
    let plate = parse_plate(plate)?;
    let since = since.map(parse_since).transpose()?;
    let events = db.list_fills(plate.as_ref(), since)?;
    let fills = merge_adjacent_fills(&events, Duration::minutes(merge_gap_mins));

    if json {
        serde_json::to_writer_pretty(&mut *writer, &fills)?;
        writeln!(writer)?;
        return Ok(());
    }

    if fills.is_empty() {
        writeln!(writer, "No fuel fills found.")?;
        return Ok(());
    }

    for fill in &fills {
        write_fill(writer, fill)?;
    }
    let total: f64 = fills.iter().map(|f| f.amount).sum();
    writeln!(writer, "{} fills, {total:.1} L", fills.len())?;
    Ok(())
}

fn write_fill<W: Write>(writer: &mut W, fill: &ReportedFill) -> Result<()> {
    let merged = match fill.source_ids.len() {
        0 | 1 => String::new(),
        n => format!("  ({n} events)"),
    };
    writeln!(
        writer,
        "{plate:<10} {start} -> {end}  {before:.1} -> {after:.1} L  +{amount:.1} L{merged}",
        plate = fill.plate.as_str(),
        start = format_time(fill.start_time),
        end = format_time(fill.end_time),
        before = fill.fuel_before,
        after = fill.fuel_after,
        amount = fill.amount,
    )?;
    Ok(())
}
