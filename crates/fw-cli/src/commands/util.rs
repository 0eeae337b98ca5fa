//! Shared utilities for CLI commands.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fw_core::Plate;

/// Parse a time filter as RFC 3339 or a plain `YYYY-MM-DD` date (midnight UTC).
pub fn parse_since(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| {
        format!("Invalid time: {s}. Use RFC 3339 (e.g., 2025-03-01T06:00:00Z) or YYYY-MM-DD")
    })?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Normalize an optional `--plate` argument the same way ingest does.
pub fn parse_plate(plate: Option<&str>) -> Result<Option<Plate>> {
    plate
        .map(|raw| Plate::normalized(raw).with_context(|| format!("invalid plate: {raw:?}")))
        .transpose()
}

/// Builds the multi-threaded runtime used by the ingest commands.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}
