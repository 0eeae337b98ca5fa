//! Persistence contract the online engine writes through.

use thiserror::Error;

use crate::session::{ActivityLogEntry, FuelFillEvent, OperatingSession, SessionPatch};
use crate::types::{Plate, SessionId, SessionStatus};

/// Errors surfaced by a [`SessionStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another ONGOING session already exists for the plate.
    #[error("plate {plate} already has ongoing session {existing}")]
    Conflict { plate: Plate, existing: SessionId },

    /// A conditional update found the row in an unexpected status.
    #[error("session {id} expected status {expected}, found {actual}")]
    PreconditionFailed {
        id: SessionId,
        expected: SessionStatus,
        actual: SessionStatus,
    },

    #[error("session {0} not found")]
    NotFound(SessionId),

    /// Transient failure; the caller may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Non-retryable backend failure.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same call might succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Storage operations used by per-plate workers.
///
/// Every method is idempotent so that a retried or replayed call converges
/// on the same stored state:
///
/// - `create_session` with an existing ID returns that ID.
/// - `update_session` applies only when the row still has
///   `expected_status`, and reports success if the row already reached the
///   patch's target status.
/// - `upsert_fill_event` keys on the fill ID.
pub trait SessionStore: Send + Sync + 'static {
    fn create_session(&self, session: &OperatingSession) -> Result<SessionId, StoreError>;

    fn update_session(
        &self,
        id: &SessionId,
        expected_status: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<(), StoreError>;

    fn upsert_fill_event(&self, fill: &FuelFillEvent) -> Result<(), StoreError>;

    fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError>;

    /// The plate's ONGOING session, if any. Used to resume after restart.
    fn ongoing_session(&self, plate: &Plate) -> Result<Option<OperatingSession>, StoreError>;
}
