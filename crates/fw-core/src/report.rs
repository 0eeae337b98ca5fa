//! Read-time presentation of fill events.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::session::FuelFillEvent;
use crate::types::{FillId, Plate};

/// One fill as shown to report consumers. May stand for several stored
/// events that happened close together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedFill {
    pub plate: Plate,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub fuel_before: f64,
    pub fuel_after: f64,
    pub amount: f64,
    pub source_ids: Vec<FillId>,
}

impl ReportedFill {
    fn from_event(event: &FuelFillEvent) -> Self {
        Self {
            plate: event.plate.clone(),
            start_time: event.fill_start_time,
            end_time: event.fill_end_time,
            fuel_before: event.fuel_before,
            fuel_after: event.fuel_after,
            amount: event.fill_amount,
            source_ids: vec![event.id.clone()],
        }
    }
}

/// Combines fills of the same plate whose gap (previous end to next start)
/// is at most `gap`. Stored rows are not affected.
pub fn merge_adjacent_fills(events: &[FuelFillEvent], gap: Duration) -> Vec<ReportedFill> {
    let mut sorted: Vec<&FuelFillEvent> = events.iter().collect();
    sorted.sort_by(|a, b| {
        a.plate
            .cmp(&b.plate)
            .then(a.fill_start_time.cmp(&b.fill_start_time))
    });

    let mut merged: Vec<ReportedFill> = Vec::new();
    for event in sorted {
        match merged.last_mut() {
            Some(last)
                if last.plate == event.plate && event.fill_start_time - last.end_time <= gap =>
            {
                // The closing level belongs to whichever fill ended last.
                if event.fill_end_time >= last.end_time {
                    last.end_time = event.fill_end_time;
                    last.fuel_after = event.fuel_after;
                }
                last.amount = last.fuel_after - last.fuel_before;
                last.source_ids.push(event.id.clone());
            }
            _ => merged.push(ReportedFill::from_event(event)),
        }
    }
    merged
}
