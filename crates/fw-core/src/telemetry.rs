//! Normalization of inbound device telemetry.
//!
//! Devices send loosely typed JSON: numbers arrive as strings, timestamps as
//! either text or epoch values, and status is free text. Everything is turned
//! into a [`TelemetryMessage`] here or rejected with an [`IngestError`];
//! nothing downstream sees raw input.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::status_token::{self, StatusToken};
use crate::types::{Plate, ValidationError};

/// Epoch values above this are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Reasons an inbound message is rejected.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid plate: {0}")]
    InvalidPlate(#[from] ValidationError),
    #[error("field {field} is not numeric: {value}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid device_time: {0}")]
    InvalidTimestamp(String),
}

/// Wire shape of an inbound message. Every field is optional here so that
/// validation can report which one is missing.
#[derive(Debug, Default, Deserialize)]
pub struct RawTelemetry {
    #[serde(default)]
    pub plate: Option<String>,
    #[serde(default)]
    pub device_time: Option<Value>,
    #[serde(default)]
    pub status_token: Option<String>,
    #[serde(default)]
    pub fuel_volume_liters: Option<Value>,
    #[serde(default)]
    pub fuel_percent: Option<Value>,
    #[serde(default)]
    pub fuel_temperature: Option<Value>,
    #[serde(default)]
    pub speed: Option<Value>,
}

/// A normalized telemetry reading for one plate.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub plate: Plate,
    pub device_time: DateTime<Utc>,
    pub status: StatusToken,
    /// Status text as received, kept for the audit trail.
    pub raw_status: String,
    pub fuel_volume_liters: Option<f64>,
    pub fuel_percent: Option<f64>,
    pub fuel_temperature: Option<f64>,
    pub speed: Option<f64>,
}

/// Identity of a message for duplicate suppression.
///
/// Floats are compared by bit pattern: an exact duplicate is a byte-for-byte
/// redelivery, not a numerically close reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    plate: Plate,
    device_time_ms: i64,
    raw_status: String,
    fuel_volume: Option<u64>,
    fuel_percent: Option<u64>,
    fuel_temperature: Option<u64>,
    speed: Option<u64>,
}

impl TelemetryMessage {
    /// Creates a message with no readings. Mostly useful for tests and
    /// replay tooling; the gateway goes through [`TelemetryMessage::from_json`].
    pub fn new(plate: Plate, device_time: DateTime<Utc>, raw_status: &str) -> Self {
        Self {
            plate,
            device_time,
            status: status_token::classify(raw_status),
            raw_status: raw_status.to_string(),
            fuel_volume_liters: None,
            fuel_percent: None,
            fuel_temperature: None,
            speed: None,
        }
    }

    /// Sets the fuel volume reading.
    #[must_use]
    pub fn with_fuel(mut self, liters: f64) -> Self {
        self.fuel_volume_liters = Some(liters);
        self
    }

    /// Parses and normalizes one JSON message.
    pub fn from_json(json: &str) -> Result<Self, IngestError> {
        let raw: RawTelemetry = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    /// Normalizes an already-deserialized message.
    pub fn from_raw(raw: RawTelemetry) -> Result<Self, IngestError> {
        let plate = raw.plate.ok_or(IngestError::MissingField("plate"))?;
        let plate = Plate::normalized(&plate)?;
        let device_time = raw
            .device_time
            .ok_or(IngestError::MissingField("device_time"))
            .and_then(|value| parse_device_time(&value))?;
        let raw_status = raw.status_token.unwrap_or_default();

        let fuel_volume_liters =
            parse_number("fuel_volume_liters", raw.fuel_volume_liters.as_ref())?;
        if let Some(volume) = fuel_volume_liters {
            if volume < 0.0 {
                return Err(IngestError::InvalidNumber {
                    field: "fuel_volume_liters",
                    value: volume.to_string(),
                });
            }
        }

        Ok(Self {
            plate,
            device_time,
            status: status_token::classify(&raw_status),
            raw_status,
            fuel_volume_liters,
            fuel_percent: parse_number("fuel_percent", raw.fuel_percent.as_ref())?,
            fuel_temperature: parse_number("fuel_temperature", raw.fuel_temperature.as_ref())?,
            speed: parse_number("speed", raw.speed.as_ref())?,
        })
    }

    /// Returns the duplicate-suppression key for this message.
    pub fn key(&self) -> MessageKey {
        MessageKey {
            plate: self.plate.clone(),
            device_time_ms: self.device_time.timestamp_millis(),
            raw_status: self.raw_status.clone(),
            fuel_volume: self.fuel_volume_liters.map(f64::to_bits),
            fuel_percent: self.fuel_percent.map(f64::to_bits),
            fuel_temperature: self.fuel_temperature.map(f64::to_bits),
            speed: self.speed.map(f64::to_bits),
        }
    }
}

/// Parses a numeric field that may arrive as a JSON number or a numeric
/// string. Absent, null and blank values are `None`.
fn parse_number(field: &'static str, value: Option<&Value>) -> Result<Option<f64>, IngestError> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<f64>().ok()
        }
        Some(_) => None,
    };
    match parsed {
        Some(number) if number.is_finite() => Ok(Some(number)),
        _ => Err(IngestError::InvalidNumber {
            field,
            value: value.map(ToString::to_string).unwrap_or_default(),
        }),
    }
}

fn parse_device_time(value: &Value) -> Result<DateTime<Utc>, IngestError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .and_then(epoch_to_datetime)
            .ok_or_else(|| IngestError::InvalidTimestamp(number.to_string())),
        Value::String(text) => parse_time_text(text.trim()),
        other => Err(IngestError::InvalidTimestamp(other.to_string())),
    }
}

fn parse_time_text(text: &str) -> Result<DateTime<Utc>, IngestError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    text.parse::<f64>()
        .ok()
        .and_then(epoch_to_datetime)
        .ok_or_else(|| IngestError::InvalidTimestamp(text.to_string()))
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "bounded by DateTime range check below"
)]
fn epoch_to_datetime(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    let millis = if epoch > EPOCH_MILLIS_THRESHOLD {
        epoch
    } else {
        epoch * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}
