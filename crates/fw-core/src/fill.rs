//! Fuel fill detection.
//!
//! Two paths feed one fill lifecycle. The status path follows the device's
//! own "possible fuel fill" indicator; the passive path watches the level
//! itself for a significant rise above the recent low that then settles.
//! Either way a fill at or below the noise threshold is discarded.

use chrono::{DateTime, Utc};

use crate::policy::FillPolicy;
use crate::session::FuelFillEvent;
use crate::status_token::StatusToken;
use crate::types::{DetectionMethod, Plate};

/// What an observation did to the fill axis.
#[derive(Debug, Clone, PartialEq)]
pub enum FillTransition {
    Started {
        method: DetectionMethod,
        at: DateTime<Utc>,
        fuel_before: f64,
    },
    Completed(FuelFillEvent),
    Discarded {
        method: DetectionMethod,
        at: DateTime<Utc>,
        amount: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    None,
    Passive {
        start: DateTime<Utc>,
        fuel_before: f64,
        highest: f64,
        last_increase: DateTime<Utc>,
    },
    Status {
        start: DateTime<Utc>,
        fuel_before: f64,
        latest: f64,
        last_token_time: DateTime<Utc>,
    },
}

/// Read-only view of an open fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpenFill {
    pub method: DetectionMethod,
    pub start: DateTime<Utc>,
    pub fuel_before: f64,
    pub fuel_after: f64,
}

/// Per-plate fill detector.
#[derive(Debug, Clone)]
pub struct FuelFillDetector {
    plate: Plate,
    policy: FillPolicy,
    phase: Phase,
    /// Lowest reading since the last confirmed event, with its time.
    low: Option<(f64, DateTime<Utc>)>,
    last_fuel: Option<f64>,
}

impl FuelFillDetector {
    pub fn new(plate: Plate, policy: FillPolicy) -> Self {
        Self {
            plate,
            policy,
            phase: Phase::None,
            low: None,
            last_fuel: None,
        }
    }

    pub const fn is_filling(&self) -> bool {
        !matches!(self.phase, Phase::None)
    }

    /// The current low reading used as the passive baseline.
    pub fn lowest(&self) -> Option<f64> {
        self.low.map(|(fuel, _)| fuel)
    }

    pub fn open_fill(&self) -> Option<OpenFill> {
        match self.phase {
            Phase::None => None,
            Phase::Passive {
                start,
                fuel_before,
                highest,
                ..
            } => Some(OpenFill {
                method: DetectionMethod::PassiveLevelIncrease,
                start,
                fuel_before,
                fuel_after: highest,
            }),
            Phase::Status {
                start,
                fuel_before,
                latest,
                ..
            } => Some(OpenFill {
                method: DetectionMethod::StatusIndicator,
                start,
                fuel_before,
                fuel_after: latest,
            }),
        }
    }

    /// Amount the open fill would record if it finalized now, when that
    /// amount is above the noise threshold.
    pub fn provisional_amount(&self) -> Option<f64> {
        self.open_fill()
            .map(|fill| fill.fuel_after - fill.fuel_before)
            .filter(|amount| *amount > self.policy.noise_threshold_liters)
    }

    /// Feeds one message, in device-time order.
    pub fn observe(
        &mut self,
        time: DateTime<Utc>,
        token: StatusToken,
        fuel: Option<f64>,
    ) -> Vec<FillTransition> {
        let mut transitions = Vec::new();
        let fill_token = token == StatusToken::PossibleFill;

        match &mut self.phase {
            Phase::Status {
                latest,
                last_token_time,
                ..
            } => {
                if fill_token {
                    if let Some(fuel) = fuel {
                        *latest = fuel;
                    }
                    *last_token_time = time;
                } else {
                    transitions.extend(self.finalize());
                    self.reset_low(fuel, time);
                }
            }
            Phase::Passive {
                start,
                fuel_before,
                highest,
                last_increase,
            } => {
                if fill_token {
                    // The device confirmed what the level already showed.
                    let latest = fuel.map_or(*highest, |fuel| fuel.max(*highest));
                    self.phase = Phase::Status {
                        start: *start,
                        fuel_before: *fuel_before,
                        latest,
                        last_token_time: time,
                    };
                } else {
                    if let Some(fuel) = fuel {
                        if fuel > *highest + self.policy.stabilization_tolerance_liters {
                            *highest = fuel;
                            *last_increase = time;
                        } else if fuel >= *highest {
                            *highest = fuel;
                        }
                    }
                    if time - *last_increase >= self.policy.stabilization_dwell() {
                        transitions.extend(self.finalize());
                        self.reset_low(fuel, time);
                    }
                }
            }
            Phase::None => {
                if fill_token {
                    if let Some(fuel_before) = self.last_fuel.or(fuel) {
                        self.phase = Phase::Status {
                            start: time,
                            fuel_before,
                            latest: fuel.unwrap_or(fuel_before),
                            last_token_time: time,
                        };
                        transitions.push(FillTransition::Started {
                            method: DetectionMethod::StatusIndicator,
                            at: time,
                            fuel_before,
                        });
                    }
                } else if let Some(fuel) = fuel {
                    transitions.extend(self.track_level(time, fuel));
                }
            }
        }

        if fuel.is_some() {
            self.last_fuel = fuel;
        }
        transitions
    }

    /// Finalizes any open fill, e.g. at shutdown.
    pub fn finish(&mut self) -> Option<FillTransition> {
        let transition = self.finalize();
        self.low = None;
        transition
    }

    fn track_level(&mut self, time: DateTime<Utc>, fuel: f64) -> Option<FillTransition> {
        let Some((low, low_time)) = self.low else {
            self.low = Some((fuel, time));
            return None;
        };

        if time - low_time > self.policy.rise_window() || fuel <= low {
            self.low = Some((fuel, time));
            return None;
        }
        if fuel - low > self.policy.min_significant_delta_liters {
            self.phase = Phase::Passive {
                start: time,
                fuel_before: low,
                highest: fuel,
                last_increase: time,
            };
            return Some(FillTransition::Started {
                method: DetectionMethod::PassiveLevelIncrease,
                at: time,
                fuel_before: low,
            });
        }
        None
    }

    fn finalize(&mut self) -> Option<FillTransition> {
        let (method, start, end, before, after) = match std::mem::replace(&mut self.phase, Phase::None) {
            Phase::None => return None,
            Phase::Passive {
                start,
                fuel_before,
                highest,
                last_increase,
            } => (
                DetectionMethod::PassiveLevelIncrease,
                start,
                last_increase,
                fuel_before,
                highest,
            ),
            Phase::Status {
                start,
                fuel_before,
                latest,
                last_token_time,
            } => (
                DetectionMethod::StatusIndicator,
                start,
                last_token_time,
                fuel_before,
                latest,
            ),
        };

        let amount = after - before;
        if amount <= self.policy.noise_threshold_liters {
            return Some(FillTransition::Discarded {
                method,
                at: end,
                amount,
            });
        }
        Some(FillTransition::Completed(FuelFillEvent::new(
            self.plate.clone(),
            start,
            end,
            before,
            after,
            method,
        )))
    }

    fn reset_low(&mut self, fuel: Option<f64>, time: DateTime<Utc>) {
        self.low = fuel.map(|fuel| (fuel, time));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn detector() -> FuelFillDetector {
        FuelFillDetector::new(Plate::new("GEN-01").unwrap(), FillPolicy::default())
    }

    fn completed(transitions: &[FillTransition]) -> Option<&FuelFillEvent> {
        transitions.iter().find_map(|t| match t {
            FillTransition::Completed(fill) => Some(fill),
            _ => None,
        })
    }

    #[test]
    fn passive_fill_uses_lowest_pre_jump_reading() {
        let mut d = detector();
        assert!(d.observe(at(0), StatusToken::EngineOn, Some(400.0)).is_empty());
        d.observe(at(60), StatusToken::Unknown, Some(390.0));
        d.observe(at(115), StatusToken::Unknown, Some(380.0));

        let started = d.observe(at(120), StatusToken::Unknown, Some(480.0));
        assert!(matches!(
            started.as_slice(),
            [FillTransition::Started {
                method: DetectionMethod::PassiveLevelIncrease,
                ..
            }]
        ));
        assert!(d.is_filling());

        assert!(d.observe(at(180), StatusToken::Unknown, Some(480.0)).is_empty());
        let done = d.observe(at(240), StatusToken::EngineOff, Some(460.0));
        let fill = completed(&done).expect("fill should complete after dwell");
        assert!((fill.fuel_before - 380.0).abs() < f64::EPSILON);
        assert!((fill.fuel_after - 480.0).abs() < f64::EPSILON);
        assert!((fill.fill_amount - 100.0).abs() < f64::EPSILON);
        assert_eq!(fill.fill_end_time, at(120));
        assert!(!d.is_filling());
    }

    #[test]
    fn new_high_restarts_dwell() {
        let mut d = detector();
        d.observe(at(0), StatusToken::Unknown, Some(100.0));
        d.observe(at(10), StatusToken::Unknown, Some(150.0));
        d.observe(at(100), StatusToken::Unknown, Some(200.0));
        // 120s after the first high but only 30s after the second.
        assert!(completed(&d.observe(at(130), StatusToken::Unknown, Some(200.0))).is_none());
        let done = d.observe(at(220), StatusToken::Unknown, Some(199.5));
        let fill = completed(&done).unwrap();
        assert!((fill.fill_amount - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn jitter_within_tolerance_does_not_restart_dwell() {
        let mut d = detector();
        d.observe(at(0), StatusToken::Unknown, Some(100.0));
        d.observe(at(10), StatusToken::Unknown, Some(150.0));
        d.observe(at(70), StatusToken::Unknown, Some(150.6));
        let fill = completed(&d.observe(at(130), StatusToken::Unknown, Some(150.2)))
            .cloned()
            .expect("sub-tolerance creep should not hold the fill open");
        assert!((fill.fuel_after - 150.6).abs() < 1e-9);
    }

    #[test]
    fn slow_rise_outside_window_is_not_a_fill() {
        let mut d = detector();
        d.observe(at(0), StatusToken::Unknown, Some(100.0));
        assert!(d.observe(at(700), StatusToken::Unknown, Some(130.0)).is_empty());
        assert!(!d.is_filling());
        assert_eq!(d.lowest(), Some(130.0));
    }

    #[test]
    fn small_rise_is_ignored() {
        let mut d = detector();
        d.observe(at(0), StatusToken::Unknown, Some(100.0));
        assert!(d.observe(at(30), StatusToken::Unknown, Some(115.0)).is_empty());
        assert!(!d.is_filling());
    }

    #[test]
    fn status_path_finalizes_when_token_clears() {
        let mut d = detector();
        d.observe(at(0), StatusToken::EngineOff, Some(200.0));
        let started = d.observe(at(30), StatusToken::PossibleFill, Some(205.0));
        assert!(matches!(
            started.as_slice(),
            [FillTransition::Started {
                method: DetectionMethod::StatusIndicator,
                fuel_before,
                ..
            }] if (*fuel_before - 200.0).abs() < f64::EPSILON
        ));
        d.observe(at(60), StatusToken::PossibleFill, Some(260.0));
        d.observe(at(90), StatusToken::PossibleFill, None);

        let done = d.observe(at(120), StatusToken::Unknown, Some(262.0));
        let fill = completed(&done).unwrap();
        assert_eq!(fill.detection_method, DetectionMethod::StatusIndicator);
        assert_eq!(fill.fill_start_time, at(30));
        assert_eq!(fill.fill_end_time, at(90));
        assert!((fill.fill_amount - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn status_fill_at_noise_is_discarded() {
        let mut d = detector();
        d.observe(at(0), StatusToken::Unknown, Some(200.0));
        d.observe(at(10), StatusToken::PossibleFill, Some(203.0));
        let done = d.observe(at(20), StatusToken::Unknown, Some(203.0));
        assert!(matches!(
            done.as_slice(),
            [FillTransition::Discarded { amount, .. }] if (*amount - 3.0).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn status_token_takes_over_passive_fill() {
        let mut d = detector();
        d.observe(at(0), StatusToken::Unknown, Some(100.0));
        d.observe(at(10), StatusToken::Unknown, Some(150.0));
        assert!(d.observe(at(20), StatusToken::PossibleFill, Some(170.0)).is_empty());
        assert_eq!(
            d.open_fill().map(|f| f.method),
            Some(DetectionMethod::StatusIndicator)
        );
        let fill = completed(&d.observe(at(30), StatusToken::Unknown, None))
            .cloned()
            .unwrap();
        assert_eq!(fill.fill_start_time, at(10));
        assert!((fill.fuel_before - 100.0).abs() < f64::EPSILON);
        assert!((fill.fuel_after - 170.0).abs() < f64::EPSILON);
    }

    #[test]
    fn finish_flushes_open_fill() {
        let mut d = detector();
        d.observe(at(0), StatusToken::Unknown, Some(100.0));
        d.observe(at(10), StatusToken::Unknown, Some(180.0));
        assert_eq!(d.provisional_amount(), Some(80.0));
        assert!(matches!(d.finish(), Some(FillTransition::Completed(_))));
        assert!(d.finish().is_none());
    }
}
