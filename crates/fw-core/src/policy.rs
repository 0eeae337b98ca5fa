//! Centrally configured thresholds.
//!
//! Every tunable number used by the online state machine and the repair job
//! lives here so one policy drives both. Durations are whole seconds (or
//! milliseconds where sub-second precision matters) to keep config files
//! readable.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// All engine policy sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub reorder: ReorderPolicy,
    pub fill: FillPolicy,
    pub session: SessionPolicy,
    pub repair: RepairPolicy,
}

/// Reordering buffer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderPolicy {
    /// How long a message may wait for earlier stragglers.
    /// Default: 20000 (20 seconds).
    pub window_ms: u64,

    /// Buffer size that forces an early flush.
    pub max_buffered: usize,

    /// How many recently seen message fingerprints are kept for duplicate
    /// suppression.
    pub dedup_memory: usize,
}

impl Default for ReorderPolicy {
    fn default() -> Self {
        Self {
            window_ms: 20_000,
            max_buffered: 256,
            dedup_memory: 1024,
        }
    }
}

impl ReorderPolicy {
    pub const fn window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.window_ms)
    }
}

/// Fuel fill detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillPolicy {
    /// Fills at or below this amount are sensor noise and never persisted.
    pub noise_threshold_liters: f64,

    /// Minimum rise above the recent low that starts a passive fill.
    pub min_significant_delta_liters: f64,

    /// The rise must happen within this long of the low reading.
    pub rise_window_secs: i64,

    /// A passive fill completes after this long without a new high.
    pub stabilization_dwell_secs: i64,

    /// A reading must beat the current high by more than this to count as a
    /// new high (restarting the dwell).
    pub stabilization_tolerance_liters: f64,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self {
            noise_threshold_liters: 5.0,
            min_significant_delta_liters: 20.0,
            rise_window_secs: 600,
            stabilization_dwell_secs: 120,
            stabilization_tolerance_liters: 1.0,
        }
    }
}

impl FillPolicy {
    pub const fn rise_window(&self) -> Duration {
        Duration::seconds(self.rise_window_secs)
    }

    pub const fn stabilization_dwell(&self) -> Duration {
        Duration::seconds(self.stabilization_dwell_secs)
    }
}

/// Online session accounting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// How long after engine-on to wait for a fuel reading when the
    /// engine-on message carried none.
    pub opening_grace_secs: i64,

    /// How long after engine-off to wait for a fuel reading when the
    /// engine-off message carried none.
    pub closing_grace_secs: i64,

    /// Price used to derive session cost from fuel used.
    pub fuel_price_per_liter: f64,

    /// Cost code used when the plate has no reference mapping.
    pub default_cost_code: String,

    /// Company used when the plate has no reference mapping.
    pub default_company: String,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            opening_grace_secs: 60,
            closing_grace_secs: 60,
            fuel_price_per_liter: 0.0,
            default_cost_code: "UNMAPPED".to_string(),
            default_company: "UNKNOWN".to_string(),
        }
    }
}

impl SessionPolicy {
    pub const fn opening_grace(&self) -> Duration {
        Duration::seconds(self.opening_grace_secs)
    }

    pub const fn closing_grace(&self) -> Duration {
        Duration::seconds(self.closing_grace_secs)
    }
}

/// Repair/consolidation job settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairPolicy {
    /// Completed sessions shorter than this are noise and deleted.
    pub min_session_secs: i64,

    /// More completed sessions than this on one plate-day get merged.
    pub max_sessions_per_day: usize,

    /// Upper bound for a merged day's operating hours.
    pub daily_max_hours: f64,

    /// Sessions ONGOING longer than this are force-closed.
    pub max_ongoing_hours: f64,

    /// Duration assumed for a force-closed session (capped by elapsed time).
    pub stuck_estimate_hours: f64,

    /// Consumption rate used to estimate usage of force-closed sessions.
    pub default_consumption_lph: f64,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            min_session_secs: 300,
            max_sessions_per_day: 3,
            daily_max_hours: 24.0,
            max_ongoing_hours: 24.0,
            stuck_estimate_hours: 8.0,
            default_consumption_lph: 10.0,
        }
    }
}

impl RepairPolicy {
    pub const fn min_session(&self) -> Duration {
        Duration::seconds(self.min_session_secs)
    }
}

/// Converts fractional hours to a millisecond-precision duration.
#[expect(
    clippy::cast_possible_truncation,
    reason = "hour values are bounded by policy and far below i64 range"
)]
pub fn hours_to_duration(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}

/// Converts a duration to fractional hours.
#[expect(
    clippy::cast_precision_loss,
    reason = "millisecond counts fit comfortably in f64 mantissa"
)]
pub fn duration_to_hours(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 3_600_000.0
}
