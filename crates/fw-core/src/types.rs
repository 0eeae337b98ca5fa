//! Core type definitions with validation.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// Invalid session status value.
    #[error("invalid session status: {value}")]
    InvalidSessionStatus { value: String },

    /// Invalid fill detection method value.
    #[error("invalid detection method: {value}")]
    InvalidDetectionMethod { value: String },

    /// Invalid activity kind value.
    #[error("invalid activity kind: {value}")]
    InvalidActivityKind { value: String },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated vehicle or generator plate.
    ///
    /// Plates are the partition key for all per-asset state. Surrounding
    /// whitespace is stripped and letters are uppercased by [`Plate::normalized`]
    /// at the ingest boundary so `abc 123` and `ABC 123` share one worker.
    Plate, "plate"
);

define_string_id!(
    /// A validated operating session identifier.
    SessionId, "session ID"
);

define_string_id!(
    /// A validated fuel fill event identifier.
    FillId, "fill ID"
);

impl Plate {
    /// Creates a plate from raw device input, trimming and uppercasing it.
    pub fn normalized(raw: &str) -> Result<Self, ValidationError> {
        Self::new(raw.trim().to_uppercase())
    }
}

impl SessionId {
    /// Derives the deterministic session ID for a plate and start time.
    ///
    /// Replaying the same telemetry yields the same ID, which is what lets
    /// `create_session` treat a repeated call as a no-op.
    pub fn derive(plate: &Plate, start_time: DateTime<Utc>) -> Self {
        Self(deterministic_id("session", plate, start_time))
    }
}

impl FillId {
    /// Derives the deterministic fill ID for a plate and fill start time.
    pub fn derive(plate: &Plate, fill_start_time: DateTime<Utc>) -> Self {
        Self(deterministic_id("fill", plate, fill_start_time))
    }
}

fn deterministic_id(kind: &str, plate: &Plate, at: DateTime<Utc>) -> String {
    let content = format!(
        "{kind}|{plate}|{}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, content.as_bytes()).to_string()
}

/// Lifecycle status of an operating session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Engine is running; `end_time` is not yet known.
    Ongoing,
    /// Engine-off observed (or force-closed by repair).
    Completed,
    /// The row turned out to describe a refuel rather than consumption.
    FuelFillCompleted,
}

impl SessionStatus {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ongoing => "ONGOING",
            Self::Completed => "COMPLETED",
            Self::FuelFillCompleted => "FUEL_FILL_COMPLETED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONGOING" => Ok(Self::Ongoing),
            "COMPLETED" => Ok(Self::Completed),
            "FUEL_FILL_COMPLETED" => Ok(Self::FuelFillCompleted),
            _ => Err(ValidationError::InvalidSessionStatus {
                value: s.to_string(),
            }),
        }
    }
}

/// How a fuel fill was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionMethod {
    /// The device reported "possible fuel fill" in its status text.
    StatusIndicator,
    /// A significant level rise followed by stabilization.
    PassiveLevelIncrease,
}

impl DetectionMethod {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StatusIndicator => "STATUS_INDICATOR",
            Self::PassiveLevelIncrease => "PASSIVE_LEVEL_INCREASE",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STATUS_INDICATOR" => Ok(Self::StatusIndicator),
            "PASSIVE_LEVEL_INCREASE" => Ok(Self::PassiveLevelIncrease),
            _ => Err(ValidationError::InvalidDetectionMethod {
                value: s.to_string(),
            }),
        }
    }
}
