//! Core domain logic for fuel session reconstruction.
//!
//! This crate contains the pure parts of the engine:
//! - Telemetry normalization and status-token classification
//! - Per-plate reordering of out-of-order messages
//! - The vehicle session state machine and its fuel fill detector
//! - Repair planning over persisted sessions
//! - The persistence contract the runtime writes through

pub mod fill;
pub mod machine;
pub mod policy;
pub mod reorder;
pub mod repair;
pub mod report;
pub mod session;
pub mod status_token;
pub mod store;
pub mod telemetry;
pub mod types;

pub use fill::{FillTransition, FuelFillDetector, OpenFill};
pub use machine::{EngineAxis, Effect, VehicleStateMachine, VehicleStateView};
pub use policy::{FillPolicy, Policy, RepairPolicy, ReorderPolicy, SessionPolicy};
pub use reorder::{Admission, ReorderBuffer, ReorderStats};
pub use repair::{RepairAction, RepairAnomaly, RepairOp, RepairPlan, RepairRule, plan_repairs};
pub use report::{ReportedFill, merge_adjacent_fills};
pub use session::{
    ActivityKind, ActivityLogEntry, CostAssignment, CostCodeDirectory, FuelFillEvent,
    OperatingSession, SessionClose, SessionPatch, StaticDirectory,
};
pub use status_token::{StatusToken, TOKEN_RULES_V1, TokenRule, TokenRules, UnknownStatusToken};
pub use store::{SessionStore, StoreError};
pub use telemetry::{IngestError, MessageKey, TelemetryMessage};
pub use types::{DetectionMethod, FillId, Plate, SessionId, SessionStatus, ValidationError};
